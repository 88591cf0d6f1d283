//! Worker HTTP API: the single task-acceptance endpoint.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;

use pegasus_core::TaskSpec;
use pegasus_core::server::{bad_request, json_ok};

use crate::executor::TaskEngine;

async fn accept_task(
    State(engine): State<Arc<TaskEngine>>,
    Json(tspec): Json<TaskSpec>,
) -> Response {
    match engine.accept(tspec) {
        Ok(()) => json_ok(&""),
        Err(err) => bad_request(err.to_string()),
    }
}

pub fn router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .route("/task", post(accept_task))
        .with_state(engine)
}

/// Serve the worker API on an already-bound listener.
pub async fn serve(
    engine: Arc<TaskEngine>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "worker listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
