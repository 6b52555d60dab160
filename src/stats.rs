//! Process-wide gateway statistics and their Prometheus collectors.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

pub struct Stats {
    active: AtomicI64,
    total_messages: AtomicU64,
    started: Instant,
    metrics: GatewayMetrics,
}

/// Point-in-time view used by the node health publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_messages: u64,
    pub uptime_secs: u64,
}

pub struct GatewayMetrics {
    pub registry: Registry,
    active_connections: IntGauge,
    total_messages: IntCounter,
    pub sync_dropped: IntCounter,
    pub sync_failures: IntCounter,
}

impl GatewayMetrics {
    fn new(node_id: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("node_id", node_id);
        let active_connections = IntGauge::with_opts(opts(
            "gateway_active_connections",
            "Device sockets currently open on this node",
        ))?;
        let total_messages = IntCounter::with_opts(opts(
            "gateway_total_messages",
            "Frames received from devices since start",
        ))?;
        let sync_dropped = IntCounter::with_opts(opts(
            "gateway_presence_sync_dropped_total",
            "Durable presence updates dropped because the queue was full",
        ))?;
        let sync_failures = IntCounter::with_opts(opts(
            "gateway_presence_sync_failures_total",
            "Durable presence updates that failed to apply",
        ))?;

        let registry = Registry::new();
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(total_messages.clone()))?;
        registry.register(Box::new(sync_dropped.clone()))?;
        registry.register(Box::new(sync_failures.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            total_messages,
            sync_dropped,
            sync_failures,
        })
    }

    /// Prometheus text exposition of every collector.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl Stats {
    pub fn new(node_id: &str) -> Result<Self, prometheus::Error> {
        Ok(Self {
            active: AtomicI64::new(0),
            total_messages: AtomicU64::new(0),
            started: Instant::now(),
            metrics: GatewayMetrics::new(node_id)?,
        })
    }

    /// Take a connection slot if fewer than `max` are open. The check and the increment are one
    /// atomic step, so concurrent accepts cannot overshoot.
    pub fn try_connection_opened(&self, max: u64) -> bool {
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                ((n.max(0) as u64) < max).then_some(n + 1)
            })
            .is_ok();
        if reserved {
            self.metrics.active_connections.inc();
        }
        reserved
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.metrics.active_connections.dec();
    }

    pub fn message_received(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_messages.inc();
    }

    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections(),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
