//! Background loops: idle-connection sweep and node health publishing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handlers::gateway::Gateway;

/// Close connections idle past `idle` every `every`, until cancelled.
pub async fn run_sweeper(
    gateway: Arc<Gateway>,
    every: Duration,
    idle: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let closed = gateway.sweep_expired(idle).await;
                if closed > 0 {
                    info!(closed, "swept expired connections");
                }
            }
        }
    }
    debug!("sweeper stopped");
}

/// Refresh this node's health record every `every`, until cancelled. The first publish is
/// immediate so the node shows up as soon as it is listening.
pub async fn run_node_publisher(gateway: Arc<Gateway>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = gateway.publish_node_health().await {
                    warn!(error = %e, "node health publish failed");
                }
            }
        }
    }
    debug!("node health publisher stopped");
}
