#![forbid(unsafe_code)]

//! Pegasus worker: accepts one task at a time from the master, fans its
//! tasklets out across an executor pool, and reports progress and results
//! back over HTTP.

pub mod config;
pub mod executor;
pub mod heartbeat;
pub mod http;
pub mod monitor;
pub mod register;

pub use config::{WORKER_CFG_PATH, WorkerCfg};
pub use executor::{TaskEngine, TaskProgress};
pub use heartbeat::start_heartbeat;
pub use http::{router, serve};
pub use monitor::spawn_status_monitor;
pub use register::{MasterClient, register};
