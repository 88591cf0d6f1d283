//! Progress reporter for the in-flight task.

use std::sync::Arc;

use crate::executor::TaskEngine;

/// Poll the engine at the configured period and push a status snapshot of
/// the in-flight task (if any) to the master.
pub fn spawn_status_monitor(engine: Arc<TaskEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_millis(engine.cfg().status_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let Some(progress) = engine.current_progress() else {
                continue;
            };
            let status = progress.snapshot(false);
            if let Err(err) = engine.master().post_status(&status).await {
                tracing::warn!(error = %err, "fail to post task status");
            }
        }
    })
}
