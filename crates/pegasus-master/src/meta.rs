//! Observability records for status queries. Snapshots are deep copies
//! taken under the owning mutex, so readers never block dispatch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pegasus_core::TaskStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskMeta {
    pub tid: String,
    pub kind: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub worker_label: String,
    pub dispatched: bool,
    pub finished: bool,
    pub err_cnt: u32,
    pub err_msg: String,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobMeta {
    pub kind: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub err_msg: String,
    pub finished: bool,
    pub total: usize,
    pub dispatched: usize,
    pub done: usize,
    pub task_metas: BTreeMap<String, TaskMeta>,
}

impl JobMeta {
    pub fn new(kind: String, start_ts: DateTime<Utc>, total: usize) -> Self {
        Self {
            kind,
            start_ts,
            end_ts: None,
            err_msg: String::new(),
            finished: false,
            total,
            dispatched: 0,
            done: 0,
            task_metas: BTreeMap::new(),
        }
    }

    pub fn failed(&self) -> bool {
        !self.err_msg.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjMeta {
    pub name: String,
    pub pid: String,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub err_msg: String,
    pub finished: bool,
    pub job_metas: Vec<JobMeta>,
}

impl ProjMeta {
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            pid: String::new(),
            start_ts: None,
            end_ts: None,
            err_msg: String::new(),
            finished: false,
            job_metas: Vec::new(),
        }
    }
}

/// Receipt returned by the project-start endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjReceipt {
    pub err_msg: String,
    pub proj_id: String,
}
