//! Presence store: device online records and node health records in Redis, both TTL-bound.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::GatewayError;

/// KEYS[1] record, ARGV[1] ttl, ARGV[2] conn_id, ARGV[3..] field/value pairs.
/// Writes the record unless another connection owns it.
const REFRESH_SCRIPT: &str = r"
local owner = redis.call('HGET', KEYS[1], 'conn_id')
if owner and owner ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1
";

/// KEYS[1] record, ARGV[1] conn_id. Deletes the record only while it names that connection.
const RELEASE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], 'conn_id') == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

pub fn device_online_key(token: &str) -> String {
    format!("device_online:{token}")
}

pub fn gateway_node_key(node_id: &str) -> String {
    format!("gateway_node:{node_id}")
}

/// `device_online:{token}` hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub node_id: String,
    pub conn_id: String,
    pub app_id: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("online", "1".to_string()),
            ("node_id", self.node_id.clone()),
            ("conn_id", self.conn_id.clone()),
            ("app_id", self.app_id.to_string()),
            ("last_heartbeat", self.last_heartbeat.timestamp().to_string()),
            ("remote_addr", self.remote_addr.to_string()),
            ("connect_time", self.connected_at.timestamp().to_string()),
        ]
    }
}

/// `gateway_node:{node_id}` hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub active_connections: u64,
    pub max_connections: u64,
    pub total_messages: u64,
    pub uptime_secs: u64,
    pub updated_at: DateTime<Utc>,
}

impl NodeHealth {
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("connections", self.active_connections.to_string()),
            ("max_connections", self.max_connections.to_string()),
            ("total_messages", self.total_messages.to_string()),
            ("uptime", self.uptime_secs.to_string()),
            ("last_update", self.updated_at.timestamp().to_string()),
        ]
    }
}

/// Shared by every connection task and background loop; implementations must be cheap to call
/// concurrently.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn ping(&self) -> Result<(), GatewayError>;
    /// Replace the record for `token`, whoever owned it.
    async fn set_online(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError>;
    /// Rewrite the record and its TTL, recreating it if it expired or was never written.
    /// A record owned by a different connection is left alone.
    async fn heartbeat(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError>;
    /// Delete the record for `token` if it still belongs to `conn_id`.
    async fn remove(&self, token: &str, conn_id: &str) -> Result<(), GatewayError>;
    async fn publish_node(&self, health: &NodeHealth, ttl: Duration) -> Result<(), GatewayError>;
    async fn remove_node(&self, node_id: &str) -> Result<(), GatewayError>;
}

pub struct RedisPresence {
    conn: ConnectionManager,
    deadline: Duration,
    refresh: Script,
    release: Script,
}

impl RedisPresence {
    /// Connect and PING within `startup_deadline`. Failure here is fatal to bootstrap.
    /// Later calls are each bounded by `deadline`.
    pub async fn connect(
        url: &str,
        startup_deadline: Duration,
        deadline: Duration,
    ) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(startup_deadline, ConnectionManager::new(client))
            .await
            .map_err(|_| GatewayError::PresenceTimeout)??;
        let store = Self {
            conn,
            deadline: startup_deadline,
            refresh: Script::new(REFRESH_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        };
        store.ping().await?;
        Ok(Self { deadline, ..store })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(GatewayError::PresenceTimeout),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn set_online(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let key = device_online_key(token);
        let fields = record.fields();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &fields[..])
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore();
        let _: () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.refresh.key(device_online_key(token));
        invocation.arg(ttl.as_secs()).arg(&record.conn_id);
        for (field, value) in record.fields() {
            invocation.arg(field).arg(value);
        }
        let written: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        if written == 0 {
            tracing::debug!(conn_id = %record.conn_id, "presence owned by another connection, heartbeat skipped");
        }
        Ok(())
    }

    async fn remove(&self, token: &str, conn_id: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.release.key(device_online_key(token));
        invocation.arg(conn_id);
        let _: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(())
    }

    async fn publish_node(&self, health: &NodeHealth, ttl: Duration) -> Result<(), GatewayError> {
        let key = gateway_node_key(&health.node_id);
        let fields = health.fields();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields[..])
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore();
        let _: () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded(
                redis::cmd("DEL")
                    .arg(gateway_node_key(node_id))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}
