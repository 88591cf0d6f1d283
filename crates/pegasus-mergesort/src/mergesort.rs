//! Second stage: sort the accumulated integers segment by segment on the
//! workers, then merge.

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pegasus_core::{
    decode_spec, Job, SharedJob, Task, TaskGenerator, TaskReport, TaskSpec, Tasklet, TaskletCtx,
};

pub(crate) const MERGESORT_KIND: &str = "Mergesort:mergesort";
const SPLIT_SEGMENTS: usize = 8;

#[derive(Default)]
pub struct JobMergesort {
    input: Vec<i64>,
    total: usize,
    next_start: usize,
    tsk_size: usize,
    output: Vec<i64>,
    next: Vec<SharedJob>,
}

impl JobMergesort {
    pub fn new(next: Vec<SharedJob>) -> Self {
        Self {
            next,
            ..Self::default()
        }
    }
}

impl Job for JobMergesort {
    fn kind(&self) -> &str {
        MERGESORT_KIND
    }

    fn append_input(&mut self, input: Value) {
        match serde_json::from_value::<Vec<i64>>(input) {
            Ok(ints) => self.input.extend(ints),
            Err(err) => tracing::warn!(error = %err, "mergesort input is not an int list"),
        }
    }

    fn init(&mut self, _env: Option<&Value>) -> anyhow::Result<()> {
        self.total = self.input.len();
        self.next_start = 0;
        self.output.clear();
        self.tsk_size = self.total.div_ceil(SPLIT_SEGMENTS).max(1);
        Ok(())
    }

    fn calc_task_count(&self) -> usize {
        self.total.div_ceil(self.tsk_size.max(1))
    }

    fn next_task(&mut self, tid: String) -> Option<TaskSpec> {
        if self.next_start >= self.total {
            return None;
        }
        let end = (self.next_start + self.tsk_size).min(self.total);
        let spec = MergesortSpec {
            seq: self.input[self.next_start..end].to_vec(),
        };
        self.next_start = end;
        Some(TaskSpec {
            tid,
            kind: MERGESORT_KIND.to_string(),
            spec: serde_json::to_value(spec).expect("mergesort spec encodes"),
        })
    }

    fn reduce(&mut self, reports: &[TaskReport]) -> anyhow::Result<()> {
        let mut all = Vec::with_capacity(self.total);
        for report in reports {
            let ints: Vec<i64> = serde_json::from_value(report.output.clone())?;
            all.extend(ints);
        }
        all.sort_unstable();
        self.output = all;
        Ok(())
    }

    fn output(&self) -> Value {
        serde_json::to_value(&self.output).expect("int list encodes")
    }

    fn next_jobs(&self) -> Vec<SharedJob> {
        self.next.clone()
    }

    fn task_generator(&self) -> Option<TaskGenerator> {
        Some(task_gen_mergesort)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MergesortSpec {
    seq: Vec<i64>,
}

pub(crate) fn task_gen_mergesort(tspec: &TaskSpec) -> anyhow::Result<Box<dyn Task>> {
    let spec: MergesortSpec = decode_spec(tspec)?;
    Ok(Box::new(TaskMergesort {
        tid: tspec.tid.clone(),
        seq: spec.seq,
        left: 1,
        output: Vec::new(),
    }))
}

struct TaskMergesort {
    tid: String,
    seq: Vec<i64>,
    left: usize,
    output: Vec<i64>,
}

impl Task for TaskMergesort {
    fn init(&mut self, _executor_count: usize) -> anyhow::Result<()> {
        self.left = 1;
        Ok(())
    }

    fn new_tasklet_ctx(&self) -> Box<dyn TaskletCtx> {
        Box::new(MergesortCtx)
    }

    fn task_id(&self) -> &str {
        &self.tid
    }

    fn kind(&self) -> &str {
        MERGESORT_KIND
    }

    fn desc(&self) -> String {
        format!("Sort segment of {}", self.seq.len())
    }

    fn tasklet_count(&self) -> usize {
        1
    }

    fn next_tasklet(&mut self, tasklet_id: String) -> Option<Box<dyn Tasklet>> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        Some(Box::new(TaskletMergesort {
            id: tasklet_id,
            seq: std::mem::take(&mut self.seq),
        }))
    }

    fn reduce_tasklets(&mut self, tasklets: Vec<Box<dyn Tasklet>>) {
        for tasklet in tasklets {
            if let Some(t) = tasklet.as_any().downcast_ref::<TaskletMergesort>() {
                self.output = t.seq.clone();
            }
        }
    }

    fn output(&self) -> Value {
        serde_json::to_value(&self.output).expect("int list encodes")
    }
}

struct MergesortCtx;

impl TaskletCtx for MergesortCtx {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct TaskletMergesort {
    id: String,
    seq: Vec<i64>,
}

impl Tasklet for TaskletMergesort {
    fn tasklet_id(&self) -> &str {
        &self.id
    }

    fn execute(&mut self, _ctx: &mut dyn TaskletCtx) -> anyhow::Result<()> {
        self.seq.sort_unstable();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
