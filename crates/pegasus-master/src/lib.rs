#![forbid(unsafe_code)]

//! Pegasus master: worker pool management, per-job task dispatch, and
//! project sequencing, exposed over an HTTP API.

pub mod config;
pub mod http;
pub mod job;
pub mod meta;
pub mod pool;
pub mod project;

pub use config::{MASTER_CFG_PATH, MasterCfg};
pub use http::{MasterState, router, serve};
pub use meta::{JobMeta, ProjMeta, ProjReceipt, TaskMeta};
pub use pool::{PoolError, WorkerPool, WorkerSnapshot, WorkerState};
