//! Master HTTP API.
//!
//! Envelope: successful responses carry `application/json` bodies; errors
//! come back as HTTP 400 with a `text/plain` message. The worker key rides
//! in the `key` query parameter.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use pegasus_core::server::{bad_request, json_ok, text_ok};
use pegasus_core::{Registry, TaskReport, TaskStatus, WorkerRegForm};

use crate::config::MasterCfg;
use crate::job::JobRunner;
use crate::pool::WorkerPool;
use crate::project::ProjectRunner;

pub struct MasterState {
    pub pool: Arc<WorkerPool>,
    pub jobs: Arc<JobRunner>,
    pub projects: Arc<ProjectRunner>,
}

impl MasterState {
    pub fn new(cfg: MasterCfg, registry: Arc<Registry>) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(WorkerPool::new(cfg)?);
        let jobs = Arc::new(JobRunner::new(pool.clone()));
        let projects = Arc::new(ProjectRunner::new(registry, jobs.clone()));
        Ok(Arc::new(Self {
            pool,
            jobs,
            projects,
        }))
    }
}

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

#[derive(Deserialize)]
struct ProjQuery {
    proj: String,
}

async fn register_worker(State(st): State<Arc<MasterState>>) -> Response {
    text_ok(st.pool.register())
}

async fn verify_worker(
    State(st): State<Arc<MasterState>>,
    Query(q): Query<KeyQuery>,
    Json(form): Json<WorkerRegForm>,
) -> Response {
    match st.pool.verify(&q.key, &form) {
        Ok(()) => json_ok(&""),
        Err(err) => bad_request(err.to_string()),
    }
}

async fn worker_heartbeat(
    State(st): State<Arc<MasterState>>,
    Query(q): Query<KeyQuery>,
    Json(ts): Json<DateTime<Utc>>,
) -> Response {
    match st.pool.update_heartbeat(&q.key, ts) {
        Ok(()) => json_ok(&""),
        Err(err) => bad_request(err.to_string()),
    }
}

async fn heartbeat_interval(State(st): State<Arc<MasterState>>) -> Response {
    // JSON duration in nanoseconds.
    let nanos = st.pool.cfg().hb_interval().as_nanos() as u64;
    json_ok(&nanos)
}

async fn task_status(
    State(st): State<Arc<MasterState>>,
    Query(q): Query<KeyQuery>,
    Json(status): Json<TaskStatus>,
) -> Response {
    if !st.pool.worker_exists(&q.key) {
        return bad_request(format!("worker key {:?} not registered", q.key));
    }
    st.jobs.update_task_status(status);
    json_ok(&"")
}

async fn task_report(
    State(st): State<Arc<MasterState>>,
    Query(q): Query<KeyQuery>,
    Json(report): Json<TaskReport>,
) -> Response {
    let tspec = match st.pool.handle_task_report(&q.key, &report) {
        Ok(tspec) => tspec,
        Err(err) => return bad_request(err.to_string()),
    };
    match st.jobs.collect_report(tspec, report) {
        Ok(()) => json_ok(&""),
        Err(err) => bad_request(err.to_string()),
    }
}

async fn run_project(
    State(st): State<Arc<MasterState>>,
    Query(q): Query<ProjQuery>,
    config: String,
) -> Response {
    json_ok(&st.projects.try_run(&q.proj, config))
}

async fn project_status(State(st): State<Arc<MasterState>>) -> Response {
    json_ok(&st.projects.status())
}

pub fn router(state: Arc<MasterState>) -> Router {
    Router::new()
        .route("/worker", get(register_worker).post(verify_worker))
        .route("/worker/heartbeat", post(worker_heartbeat))
        .route("/worker/heartbeat/interval", get(heartbeat_interval))
        .route("/worker/task/status", post(task_status))
        .route("/worker/task/report", post(task_report))
        .route("/project", post(run_project))
        .route("/project/status", get(project_status))
        .with_state(state)
}

/// Serve the master API on an already-bound listener.
pub async fn serve(
    state: Arc<MasterState>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "master listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
