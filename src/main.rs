mod config;
mod error;
mod handlers;
mod maintenance;
mod models;
mod presence;
mod protocol;
mod registry;
mod schema;
mod serde_u64_string;
mod stats;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod validator;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::handlers::gateway::Gateway;
use crate::presence::{PresenceStore, RedisPresence};
use crate::stats::Stats;
use crate::store::{DeviceStore, PgDeviceStore};
use crate::sync::{PresenceSync, SYNC_QUEUE_CAPACITY};
use crate::validator::DeviceValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,push_gateway=debug")),
        )
        .init();

    let config = Config::from_env().context("load configuration")?;
    tracing::info!(node_id = %config.node_id, port = config.port, "starting device gateway");

    let presence: Arc<dyn PresenceStore> = Arc::new(
        RedisPresence::connect(
            &config.redis.url(),
            config.timing.startup_deadline,
            config.timing.presence_deadline,
        )
        .await
        .inspect_err(|e| tracing::error!(error = %e, "presence store unreachable"))
        .context("connect presence store")?,
    );
    let devices: Arc<dyn DeviceStore> = Arc::new(
        PgDeviceStore::connect(&config.database_url, config.database_pool_size)
            .context("connect database")?,
    );
    let stats = Arc::new(Stats::new(&config.node_id).context("register metrics")?);

    let sync_stop = CancellationToken::new();
    let (sync, sync_worker) = PresenceSync::spawn(
        devices.clone(),
        stats.clone(),
        SYNC_QUEUE_CAPACITY,
        sync_stop.clone(),
    );
    let gateway = Arc::new(Gateway::new(
        &config,
        stats.clone(),
        presence,
        DeviceValidator::new(devices),
        sync,
    ));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parse listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "gateway listening");

    let shutdown = CancellationToken::new();
    let background = CancellationToken::new();

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let metrics_listener = TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("bind metrics {metrics_addr}"))?;
    tracing::info!(%metrics_addr, "metrics listening");
    let metrics_server = tokio::spawn({
        let app = handlers::health::router(stats.clone());
        let stop = background.clone();
        async move {
            if let Err(e) = axum::serve(metrics_listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "metrics server failed");
            }
        }
    });

    let sweeper = tokio::spawn(maintenance::run_sweeper(
        gateway.clone(),
        config.timing.sweep_interval,
        config.timing.idle_threshold,
        background.clone(),
    ));
    let publisher = tokio::spawn(maintenance::run_node_publisher(
        gateway.clone(),
        config.timing.node_publish_interval,
        background.clone(),
    ));

    let connections = TaskTracker::new();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    connections.spawn(gateway.clone().serve(stream, remote, shutdown.clone()));
                }
                Err(e) => tracing::error!(error = %e, "accept failed"),
            },
        }
    }

    tracing::info!(open = gateway.registry().len(), "shutting down, closing device connections");
    drop(listener);
    shutdown.cancel();
    connections.close();
    if tokio::time::timeout(config.timing.shutdown_grace, connections.wait())
        .await
        .is_err()
    {
        tracing::warn!(remaining = connections.len(), "grace period elapsed with connections still open");
    }

    background.cancel();
    let _ = tokio::join!(sweeper, publisher, metrics_server);

    sync_stop.cancel();
    if let Err(e) = sync_worker.await {
        tracing::warn!(error = %e, "presence sync worker failed");
    }
    if let Err(e) = gateway.withdraw_node().await {
        tracing::warn!(error = %e, "node health cleanup failed");
    }
    drop(gateway);
    tracing::info!("presence store connection closed, bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("termination signal received");
}
