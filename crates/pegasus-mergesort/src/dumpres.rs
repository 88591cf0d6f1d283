//! Final stage: dump the sorted sequence to a JSON file. A source-less
//! job: zero tasks, all work happens at init.

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use pegasus_core::{Job, SharedJob, TaskGenerator, TaskReport, TaskSpec};

pub(crate) const DUMPRES_KIND: &str = "Mergesort:dumpres";

#[derive(Debug, Default, Deserialize)]
struct DumpresEnv {
    #[serde(default)]
    out_dir: Option<String>,
}

#[derive(Default)]
pub struct JobDumpres {
    input: Vec<i64>,
    output_file: Option<PathBuf>,
}

impl JobDumpres {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Job for JobDumpres {
    fn kind(&self) -> &str {
        DUMPRES_KIND
    }

    fn append_input(&mut self, input: Value) {
        match serde_json::from_value::<Vec<i64>>(input) {
            Ok(ints) => self.input.extend(ints),
            Err(err) => tracing::warn!(error = %err, "dumpres input is not an int list"),
        }
    }

    fn init(&mut self, env: Option<&Value>) -> anyhow::Result<()> {
        let env: DumpresEnv = match env {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
            None => DumpresEnv::default(),
        };
        let dir = env
            .out_dir
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = dir.join(format!("mergesort-res-{nanos}.json"));
        let buf = serde_json::to_vec_pretty(&self.input)?;
        std::fs::write(&path, buf)?;
        tracing::info!(file = %path.display(), len = self.input.len(), "result dumped");
        self.output_file = Some(path);
        Ok(())
    }

    fn calc_task_count(&self) -> usize {
        0
    }

    fn next_task(&mut self, _tid: String) -> Option<TaskSpec> {
        None
    }

    fn reduce(&mut self, _reports: &[TaskReport]) -> anyhow::Result<()> {
        Ok(())
    }

    fn output(&self) -> Value {
        match &self.output_file {
            Some(path) => Value::String(path.display().to_string()),
            None => Value::Null,
        }
    }

    fn next_jobs(&self) -> Vec<SharedJob> {
        Vec::new()
    }

    fn task_generator(&self) -> Option<TaskGenerator> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_the_accumulated_input() {
        let dir = tempfile::tempdir().unwrap();
        let env = serde_json::json!({"out_dir": dir.path().display().to_string()});

        let mut job = JobDumpres::new();
        job.append_input(serde_json::json!([1, 2, 3]));
        job.append_input(serde_json::json!([4, 5]));
        job.init(Some(&env)).unwrap();
        assert_eq!(job.calc_task_count(), 0);
        assert!(job.next_task("tsk-0-0".into()).is_none());

        let path = match job.output() {
            Value::String(s) => PathBuf::from(s),
            other => panic!("unexpected output {other:?}"),
        };
        let raw = std::fs::read_to_string(path).unwrap();
        let written: Vec<i64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4, 5]);
    }
}
