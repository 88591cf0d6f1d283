#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Core contract shared by the pegasus master and workers: the
//! project/job/task/tasklet interfaces, the wire envelopes exchanged over
//! HTTP, the task registry, and the typed config machinery.

pub mod cfgclient;
pub mod config;
pub mod registry;
pub mod server;
pub mod task;

pub use registry::Registry;
pub use task::{
    Job, Project, ProjStats, ProjectFactory, SharedJob, Task, TaskGenerator, Tasklet,
    TaskletCtx, TaskReport, TaskSpec, TaskStatus, WorkerRegForm, decode_spec, shared_job,
};
