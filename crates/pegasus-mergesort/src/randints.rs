//! First stage: workers generate segments of random integers.

use std::any::Any;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pegasus_core::{
    decode_spec, Job, SharedJob, Task, TaskGenerator, TaskReport, TaskSpec, Tasklet, TaskletCtx,
};

pub(crate) const RANDINTS_KIND: &str = "Mergesort:randints";
const GEN_SEGMENTS: usize = 4;
const MIN_INT: i64 = 1;
const MAX_INT: i64 = 100;

#[derive(Default)]
pub struct JobRandInts {
    seed: u64,
    task_idx: usize,
    output: Vec<i64>,
    next: Vec<SharedJob>,
}

impl JobRandInts {
    pub fn new(next: Vec<SharedJob>) -> Self {
        Self {
            next,
            ..Self::default()
        }
    }
}

impl Job for JobRandInts {
    fn kind(&self) -> &str {
        RANDINTS_KIND
    }

    fn append_input(&mut self, _input: Value) {}

    fn init(&mut self, _env: Option<&Value>) -> anyhow::Result<()> {
        self.seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        self.task_idx = 0;
        self.output.clear();
        Ok(())
    }

    fn calc_task_count(&self) -> usize {
        GEN_SEGMENTS
    }

    fn next_task(&mut self, tid: String) -> Option<TaskSpec> {
        self.task_idx += 1;
        if self.task_idx > GEN_SEGMENTS {
            return None;
        }
        let spec = RandIntsSpec {
            seed: self.seed.wrapping_add(self.task_idx as u64),
            size: self.task_idx * 10,
        };
        Some(TaskSpec {
            tid,
            kind: RANDINTS_KIND.to_string(),
            spec: serde_json::to_value(spec).expect("randints spec encodes"),
        })
    }

    fn reduce(&mut self, reports: &[TaskReport]) -> anyhow::Result<()> {
        for report in reports {
            let ints: Vec<i64> = serde_json::from_value(report.output.clone())?;
            self.output.extend(ints);
        }
        Ok(())
    }

    fn output(&self) -> Value {
        serde_json::to_value(&self.output).expect("int list encodes")
    }

    fn next_jobs(&self) -> Vec<SharedJob> {
        self.next.clone()
    }

    fn task_generator(&self) -> Option<TaskGenerator> {
        Some(task_gen_randints)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RandIntsSpec {
    seed: u64,
    size: usize,
}

pub(crate) fn task_gen_randints(tspec: &TaskSpec) -> anyhow::Result<Box<dyn Task>> {
    let spec: RandIntsSpec = decode_spec(tspec)?;
    Ok(Box::new(TaskRandInts {
        tid: tspec.tid.clone(),
        seed: spec.seed,
        total: spec.size,
        left: spec.size,
        tasklet_cnt: 0,
        tasklet_idx: 0,
        ints: Vec::new(),
    }))
}

struct TaskRandInts {
    tid: String,
    seed: u64,
    total: usize,
    left: usize,
    tasklet_cnt: usize,
    tasklet_idx: usize,
    ints: Vec<i64>,
}

impl Task for TaskRandInts {
    fn init(&mut self, executor_count: usize) -> anyhow::Result<()> {
        let executors = executor_count.max(1);
        self.tasklet_cnt = self.total.div_ceil(executors);
        Ok(())
    }

    fn new_tasklet_ctx(&self) -> Box<dyn TaskletCtx> {
        Box::new(RandIntsCtx {
            base_seed: self.seed,
        })
    }

    fn task_id(&self) -> &str {
        &self.tid
    }

    fn kind(&self) -> &str {
        RANDINTS_KIND
    }

    fn desc(&self) -> String {
        format!("Generate {} random ints", self.total)
    }

    fn tasklet_count(&self) -> usize {
        self.tasklet_cnt
    }

    fn next_tasklet(&mut self, tasklet_id: String) -> Option<Box<dyn Tasklet>> {
        if self.left == 0 {
            return None;
        }
        let size = self
            .total
            .div_ceil(self.tasklet_cnt.max(1))
            .min(self.left);
        self.left -= size;
        let index = self.tasklet_idx;
        self.tasklet_idx += 1;
        Some(Box::new(TaskletRandInts {
            id: tasklet_id,
            index,
            size,
            ints: Vec::new(),
        }))
    }

    fn reduce_tasklets(&mut self, tasklets: Vec<Box<dyn Tasklet>>) {
        for tasklet in tasklets {
            if let Some(t) = tasklet.as_any().downcast_ref::<TaskletRandInts>() {
                self.ints.extend_from_slice(&t.ints);
            }
        }
    }

    fn output(&self) -> Value {
        serde_json::to_value(&self.ints).expect("int list encodes")
    }
}

struct RandIntsCtx {
    base_seed: u64,
}

impl TaskletCtx for RandIntsCtx {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct TaskletRandInts {
    id: String,
    index: usize,
    size: usize,
    ints: Vec<i64>,
}

impl Tasklet for TaskletRandInts {
    fn tasklet_id(&self) -> &str {
        &self.id
    }

    fn execute(&mut self, ctx: &mut dyn TaskletCtx) -> anyhow::Result<()> {
        let base_seed = ctx
            .as_any_mut()
            .downcast_mut::<RandIntsCtx>()
            .ok_or_else(|| anyhow::anyhow!("unexpected tasklet ctx"))?
            .base_seed;
        // Seed per tasklet so the generated multiset does not depend on
        // which executor runs which tasklet.
        let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(self.index as u64));
        self.ints = (0..self.size)
            .map(|_| rng.gen_range(MIN_INT..=MAX_INT))
            .collect();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_task(seed: u64, size: usize, executor_count: usize) -> Vec<i64> {
        let tspec = TaskSpec {
            tid: "tsk-0-0".into(),
            kind: RANDINTS_KIND.into(),
            spec: serde_json::to_value(RandIntsSpec { seed, size }).unwrap(),
        };
        let mut task = task_gen_randints(&tspec).unwrap();
        task.init(executor_count).unwrap();

        let mut done = Vec::new();
        let mut idx = 0;
        while let Some(mut tasklet) = task.next_tasklet(format!("tsk-0-0-{idx}")) {
            idx += 1;
            let mut ctx = task.new_tasklet_ctx();
            tasklet.execute(ctx.as_mut()).unwrap();
            done.push(tasklet);
        }
        // Completion order is arbitrary in the real executor pool.
        done.reverse();
        task.reduce_tasklets(done);

        let out: Vec<i64> = serde_json::from_value(task.output()).unwrap();
        out
    }

    #[test]
    fn fixed_seed_is_deterministic_up_to_order() {
        let mut a = run_task(42, 40, 4);
        let mut b = run_task(42, 40, 4);
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.iter().all(|v| (MIN_INT..=MAX_INT).contains(v)));
    }

    #[test]
    fn job_emits_four_tasks_of_growing_size() {
        let mut job = JobRandInts::new(Vec::new());
        job.init(None).unwrap();
        assert_eq!(job.calc_task_count(), 4);

        let mut sizes = Vec::new();
        let mut idx = 0;
        while let Some(tspec) = job.next_task(format!("tsk-0-{idx}")) {
            idx += 1;
            let spec: RandIntsSpec = decode_spec(&tspec).unwrap();
            sizes.push(spec.size);
        }
        assert_eq!(sizes, vec![10, 20, 30, 40]);
    }
}
