//! The project → job → task → tasklet contract and the wire envelopes.

use std::any::Any;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job shared between its predecessors (which feed it input) and the
/// runner (which drives it).
pub type SharedJob = Arc<Mutex<dyn Job>>;

/// Builds a worker-side [`Task`] from a [`TaskSpec`].
pub type TaskGenerator = fn(&TaskSpec) -> anyhow::Result<Box<dyn Task>>;

/// Creates a fresh project instance for one run.
pub type ProjectFactory = fn() -> Box<dyn Project>;

/// Wrap a concrete job for the shared job graph.
pub fn shared_job<J: Job + 'static>(job: J) -> Arc<Mutex<J>> {
    Arc::new(Mutex::new(job))
}

/// A named pipeline of jobs executed in order by the master.
pub trait Project: Send {
    fn name(&self) -> &str;

    /// Wire the job graph (each job's successors) without touching config.
    /// Called by the registry at startup to discover task generators.
    fn init_jobs(&mut self);

    /// Parse the per-run JSON config string into the project environment and
    /// wire the job graph. Called exactly once per run, before the first job.
    fn init(&mut self, config: &str) -> anyhow::Result<()>;

    /// Opaque environment handed to every job's `init`.
    fn env(&self) -> Option<Value> {
        None
    }

    fn jobs(&self) -> Vec<SharedJob>;

    /// Called once after the last job (or the first failure).
    fn finish(&mut self, stats: &ProjStats) -> anyhow::Result<()>;
}

/// One pipeline stage, decomposed into tasks by the master.
///
/// Lifecycle: predecessors call `append_input` any number of times, then the
/// runner calls `init` exactly once, drains `next_task`, collects reports,
/// and calls `reduce` exactly once. `output` is stable after `reduce`.
pub trait Job: Send {
    fn kind(&self) -> &str;

    /// Accumulate output fed from a predecessor job.
    fn append_input(&mut self, input: Value);

    fn init(&mut self, env: Option<&Value>) -> anyhow::Result<()>;

    /// Expected number of tasks; 0 means the dispatch phase is skipped.
    fn calc_task_count(&self) -> usize;

    /// Next task to dispatch, or `None` when exhausted.
    fn next_task(&mut self, tid: String) -> Option<TaskSpec>;

    /// Aggregate all task reports; reports arrive in arbitrary order.
    fn reduce(&mut self, reports: &[TaskReport]) -> anyhow::Result<()>;

    fn output(&self) -> Value;

    fn next_jobs(&self) -> Vec<SharedJob>;

    /// Generator used by workers to rebuild this job's tasks; `None` for
    /// jobs that never dispatch (zero task count).
    fn task_generator(&self) -> Option<TaskGenerator>;
}

/// Worker-side realization of one dispatched task.
pub trait Task: Send {
    fn init(&mut self, executor_count: usize) -> anyhow::Result<()>;

    /// Per-executor scratchpad (RNG, connection handle, ...). Closed when the
    /// task completes.
    fn new_tasklet_ctx(&self) -> Box<dyn TaskletCtx>;

    fn task_id(&self) -> &str;

    fn kind(&self) -> &str;

    fn desc(&self) -> String;

    fn tasklet_count(&self) -> usize;

    /// Next tasklet to execute, or `None` when exhausted.
    fn next_tasklet(&mut self, tasklet_id: String) -> Option<Box<dyn Tasklet>>;

    /// Combine the completed tasklets; order is arbitrary.
    fn reduce_tasklets(&mut self, tasklets: Vec<Box<dyn Tasklet>>);

    fn output(&self) -> Value;
}

/// The atomic, retriable unit of work run on an executor thread.
pub trait Tasklet: Send {
    fn tasklet_id(&self) -> &str;

    fn execute(&mut self, ctx: &mut dyn TaskletCtx) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Per-executor context handed to every `execute` call on that executor.
pub trait TaskletCtx: Send {
    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Wire envelope for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskSpec {
    pub tid: String,
    pub kind: String,
    /// Opaque payload interpreted only by the matching task generator.
    pub spec: Value,
}

/// Wire envelope a worker posts back when its task finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskReport {
    /// Empty on success.
    pub err: String,
    pub tid: String,
    pub kind: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: Option<TaskStatus>,
    pub output: Value,
}

impl TaskReport {
    pub fn failed(&self) -> bool {
        !self.err.is_empty()
    }
}

/// Live progress snapshot of an in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskStatus {
    pub tid: String,
    pub desc: String,
    pub start_ts: DateTime<Utc>,
    pub finished: bool,
    pub total: usize,
    pub done: usize,
}

/// Registration form a worker posts after obtaining its key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerRegForm {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl WorkerRegForm {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Aggregate statistics handed to `Project::finish`.
#[derive(Debug, Clone)]
pub struct ProjStats {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub job_count: usize,
}

/// Re-decode an opaque task spec payload into its kind-specific type.
///
/// The payload travels as generic JSON; master and worker agree on the
/// concrete shape only through the generator registered for the kind.
pub fn decode_spec<T: DeserializeOwned>(tspec: &TaskSpec) -> anyhow::Result<T> {
    serde_json::from_value(tspec.spec.clone())
        .with_context(|| format!("fail to decode spec for task {:?}", tspec.tid))
}

/// Task ids are `tsk-<unix_nanos>-<idx>`, unique within one job run.
pub fn generate_tid(idx: usize) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("tsk-{nanos}-{idx}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct SortSpec {
        seq: Vec<i64>,
    }

    #[test]
    fn spec_payload_round_trips_through_generic_json() {
        let spec = SortSpec {
            seq: vec![3, 1, 2],
        };
        let tspec = TaskSpec {
            tid: generate_tid(0),
            kind: "sort".into(),
            spec: serde_json::to_value(&spec).unwrap(),
        };
        let decoded: SortSpec = decode_spec(&tspec).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn decode_spec_rejects_mismatched_payload() {
        let tspec = TaskSpec {
            tid: "tsk-0-0".into(),
            kind: "sort".into(),
            spec: serde_json::json!({"seq": "not a list"}),
        };
        assert!(decode_spec::<SortSpec>(&tspec).is_err());
    }

    #[test]
    fn tid_format() {
        let tid = generate_tid(7);
        let parts: Vec<&str> = tid.splitn(3, '-').collect();
        assert_eq!(parts[0], "tsk");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "7");
    }

    #[test]
    fn wire_names_are_pascal_case() {
        let tspec = TaskSpec {
            tid: "tsk-1-0".into(),
            kind: "sort".into(),
            spec: Value::Null,
        };
        let v = serde_json::to_value(&tspec).unwrap();
        assert!(v.get("Tid").is_some());
        assert!(v.get("Kind").is_some());
        assert!(v.get("Spec").is_some());

        let report = TaskReport {
            err: String::new(),
            tid: "tsk-1-0".into(),
            kind: "sort".into(),
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            status: None,
            output: Value::Null,
        };
        let v = serde_json::to_value(&report).unwrap();
        for key in ["Err", "Tid", "Kind", "StartTs", "EndTs", "Status", "Output"] {
            assert!(v.get(key).is_some(), "missing wire field {key}");
        }
    }
}
