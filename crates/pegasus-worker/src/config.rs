use serde::{Deserialize, Serialize};

/// Config schema path for the worker entry.
pub const WORKER_CFG_PATH: &str = "pegasus.worker.WorkerCfg";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCfg {
    /// Executors running tasklets concurrently for one task.
    pub executor_count: usize,
    /// Capacity of the todo-tasklet queue.
    pub tasklet_buf: usize,
    /// Attempts per tasklet before the task is failed.
    pub tasklet_max_retry: u32,
    /// Period of the task progress reporter.
    pub status_interval_ms: u64,
}

impl Default for WorkerCfg {
    fn default() -> Self {
        Self {
            executor_count: 4,
            tasklet_buf: 8,
            tasklet_max_retry: 3,
            status_interval_ms: 1_000,
        }
    }
}
