//! Periodic liveness posts to the master. Network errors are logged and
//! retried on the next tick; the master times out silent workers.

use std::sync::Arc;

use crate::register::MasterClient;

/// Fetch the heartbeat interval from the master and post heartbeats at
/// that period forever.
pub async fn start_heartbeat(
    client: Arc<MasterClient>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let interval = client.hb_interval().await?;
    tracing::info!(?interval, "start heartbeat");
    Ok(tokio::spawn(async move {
        let period = interval.max(std::time::Duration::from_millis(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if let Err(err) = client.post_heartbeat().await {
                tracing::warn!(error = %err, "fail to post heartbeat");
            }
        }
    }))
}
