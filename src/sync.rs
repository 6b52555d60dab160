//! Bounded queue that applies device online/offline flags to the durable store off the
//! connection path. One worker drains it in FIFO order, so a device's online and offline
//! updates land in the order they were issued.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::DevicePresence;
use crate::stats::Stats;
use crate::store::DeviceStore;

pub const SYNC_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub app_id: i64,
    pub token_hash: String,
    pub presence: DevicePresence,
    /// Apply only while the device row still names this connection.
    pub if_connection: Option<String>,
}

#[derive(Clone)]
pub struct PresenceSync {
    tx: mpsc::Sender<PresenceUpdate>,
    stats: Arc<Stats>,
}

impl PresenceSync {
    /// Start the worker. It exits once `shutdown` fires and the queue is drained.
    pub fn spawn(
        store: Arc<dyn DeviceStore>,
        stats: Arc<Stats>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(run(rx, store, stats.clone(), shutdown));
        (Self { tx, stats }, worker)
    }

    /// Never waits. A full or closed queue drops the update.
    pub fn enqueue(&self, update: PresenceUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(u)) => {
                self.stats.metrics().sync_dropped.inc();
                tracing::warn!(
                    app_id = u.app_id,
                    online = u.presence.is_online,
                    "presence sync queue full, update dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(u)) => {
                self.stats.metrics().sync_dropped.inc();
                tracing::debug!(app_id = u.app_id, "presence sync stopped, update dropped");
            }
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<PresenceUpdate>,
    store: Arc<dyn DeviceStore>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => apply(&*store, &stats, update).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                let mut drained = 0usize;
                while let Some(update) = rx.recv().await {
                    apply(&*store, &stats, update).await;
                    drained += 1;
                }
                tracing::debug!(drained, "presence sync drained");
                break;
            }
        }
    }
}

async fn apply(store: &dyn DeviceStore, stats: &Stats, update: PresenceUpdate) {
    if let Err(e) = store
        .set_presence(
            update.app_id,
            &update.token_hash,
            &update.presence,
            update.if_connection.as_deref(),
        )
        .await
    {
        stats.metrics().sync_failures.inc();
        tracing::warn!(
            app_id = update.app_id,
            online = update.presence.is_online,
            error = %e,
            "presence sync failed"
        );
    }
}
