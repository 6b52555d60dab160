//! Device socket handler: registration, heartbeat, and disconnect handling.
//!
//! Each accepted socket runs in its own task, so the callbacks for one connection never overlap.
//! A connection is `Connected` until a validated REGISTER, `Registered` after, and `Expired`
//! only when the sweep takes it down. Whoever removes it from the registry runs the offline path.
//!
//! Registrations for one token are serialized by a striped lock, so a replaced connection's
//! offline writes always land before its successor's online writes.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, Timing};
use crate::error::GatewayError;
use crate::models::DevicePresence;
use crate::presence::{NodeHealth, PresenceRecord, PresenceStore};
use crate::protocol::{self, Frame, Opcode, ProtocolError, WireMessage, MAX_FRAME_LEN};
use crate::registry::{idle_cutoff, Connection, ConnectionRegistry, Registration};
use crate::stats::Stats;
use crate::store::token_hash;
use crate::sync::{PresenceSync, PresenceUpdate};
use crate::validator::{AuthError, DeviceValidator};

const TOKEN_LOCK_STRIPES: usize = 256;

/// What the socket task does after a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Reply(Vec<u8>),
    /// Send the frame, then close the socket.
    Close(Vec<u8>),
    Nothing,
}

pub struct Gateway {
    node_id: String,
    host: String,
    port: u16,
    max_connections: u64,
    timing: Timing,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<Stats>,
    presence: Arc<dyn PresenceStore>,
    validator: DeviceValidator,
    sync: PresenceSync,
    token_locks: Vec<Mutex<()>>,
    token_hasher: RandomState,
}

impl Gateway {
    pub fn new(
        config: &Config,
        stats: Arc<Stats>,
        presence: Arc<dyn PresenceStore>,
        validator: DeviceValidator,
        sync: PresenceSync,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            host: config.host.clone(),
            port: config.port,
            max_connections: config.max_connections,
            timing: config.timing.clone(),
            registry: Arc::new(ConnectionRegistry::new(config.node_id.clone())),
            stats,
            presence,
            validator,
            sync,
            token_locks: (0..TOKEN_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            token_hasher: RandomState::new(),
        }
    }

    fn token_lock(&self, token: &str) -> &Mutex<()> {
        let stripe = self.token_hasher.hash_one(token) as usize % self.token_locks.len();
        &self.token_locks[stripe]
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Drive one device socket until the peer closes, a terminal error, or `shutdown`.
    pub async fn serve<S>(self: Arc<Self>, mut stream: S, remote: SocketAddr, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.stats.try_connection_opened(self.max_connections) {
            warn!(remote = %remote, max = self.max_connections, "connection limit reached");
            let _ = stream.write_all(&protocol::error("server busy")).await;
            let _ = stream.shutdown().await;
            return;
        }

        let closer = shutdown.child_token();
        let conn = self.on_open(remote, closer.clone());
        let mut buf = BytesMut::with_capacity(MAX_FRAME_LEN + 1);

        loop {
            let decoded = match protocol::decode_next(&mut buf) {
                Ok(Some(frame)) => Ok(frame),
                Err(e) => Err(e),
                Ok(None) => {
                    tokio::select! {
                        biased;
                        _ = closer.cancelled() => {
                            debug!(conn_id = %conn.id, "closing connection on request");
                            break;
                        }
                        res = stream.read_buf(&mut buf) => match res {
                            Ok(0) => break,
                            Ok(_) => continue,
                            Err(e) => {
                                debug!(conn_id = %conn.id, error = %e, "read failed");
                                break;
                            }
                        },
                    }
                }
            };
            // Frames already buffered are dropped once the connection is taken down.
            if closer.is_cancelled() {
                debug!(conn_id = %conn.id, "closing connection on request");
                break;
            }

            match self.on_frame(&conn.id, decoded).await {
                Flow::Reply(frame) => {
                    if let Err(e) = stream.write_all(&frame).await {
                        debug!(conn_id = %conn.id, error = %e, "write failed");
                        break;
                    }
                }
                Flow::Close(frame) => {
                    let _ = stream.write_all(&frame).await;
                    let _ = stream.shutdown().await;
                    break;
                }
                Flow::Nothing => {}
            }
        }

        self.on_close(&conn.id).await;
    }

    fn on_open(&self, remote: SocketAddr, closer: CancellationToken) -> Connection {
        let conn = self.registry.open(remote, closer);
        info!(conn_id = %conn.id, remote = %remote, "device connected");
        conn
    }

    /// Handle one decoded frame, or the decode error that ends the stream.
    pub async fn on_frame(&self, conn_id: &str, decoded: Result<Frame, ProtocolError>) -> Flow {
        self.registry.touch(conn_id);
        self.stats.message_received();

        let result = match decoded {
            Ok(frame) => match frame.opcode {
                Opcode::Ping => self.on_ping(conn_id).await,
                Opcode::Register => self.on_register(conn_id, frame.message()).await,
                Opcode::Unknown(b) => Err(ProtocolError::UnknownOpcode(b).into()),
                other => Err(ProtocolError::Unsupported(other.as_byte()).into()),
            },
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(reply) => Flow::Reply(reply),
            Err(e) if e.is_terminal() => {
                debug!(conn_id, error = %e, "rejecting connection");
                Flow::Close(protocol::error(&e.client_message()))
            }
            Err(e) => {
                warn!(conn_id, error = %e, "frame handling failed");
                Flow::Nothing
            }
        }
    }

    fn presence_record(&self, conn: &Connection, at: DateTime<Utc>) -> PresenceRecord {
        PresenceRecord {
            node_id: self.node_id.clone(),
            conn_id: conn.id.clone(),
            app_id: conn.app_id,
            last_heartbeat: at,
            remote_addr: conn.remote_addr,
            connected_at: conn.connected_at,
        }
    }

    async fn on_ping(&self, conn_id: &str) -> Result<Vec<u8>, GatewayError> {
        if let Some(conn) = self.registry.get(conn_id).filter(Connection::is_registered) {
            trace!(conn_id, "heartbeat");
            let record = self.presence_record(&conn, conn.last_activity);
            if let Err(e) = self
                .presence
                .heartbeat(&conn.device_token, &record, self.timing.presence_ttl)
                .await
            {
                warn!(conn_id, error = %e, "presence heartbeat failed");
            }
        }
        Ok(protocol::pong())
    }

    async fn on_register(&self, conn_id: &str, msg: WireMessage) -> Result<Vec<u8>, GatewayError> {
        let conn = self.registry.get(conn_id).ok_or(AuthError::Unavailable)?;
        if !conn.device_token.is_empty() {
            return Err(ProtocolError::AlreadyRegistered.into());
        }

        let device = self.validator.validate(msg.app_id, &msg.token).await?;
        let platform = msg.platform.unwrap_or(device.platform);

        let _serialized = self.token_lock(&msg.token).lock().await;
        let displaced = match self
            .registry
            .register(conn_id, msg.app_id, &msg.token, &platform)
        {
            Registration::Bound { displaced } => displaced,
            Registration::Gone => return Err(AuthError::Unavailable.into()),
        };
        if let Some(prev) = displaced {
            info!(conn_id, replaced = %prev, "device token re-registered, closing previous connection");
            self.disconnect(&prev).await;
        }

        let now = Utc::now();
        let record = PresenceRecord {
            app_id: msg.app_id,
            ..self.presence_record(&conn, now)
        };
        if let Err(e) = self
            .presence
            .set_online(&msg.token, &record, self.timing.presence_ttl)
            .await
        {
            warn!(conn_id, error = %e, "presence write failed");
        }
        self.sync.enqueue(PresenceUpdate {
            app_id: device.app_id,
            token_hash: device.token_hash,
            presence: DevicePresence::online(&self.node_id, conn_id, now),
            if_connection: None,
        });

        info!(
            conn_id,
            app_id = msg.app_id,
            device_id = device.device_id,
            platform = %platform,
            "device registered"
        );
        Ok(protocol::ack(true))
    }

    async fn on_close(&self, conn_id: &str) {
        if let Some(conn) = self.registry.close(conn_id) {
            self.go_offline(&conn).await;
            info!(
                conn_id,
                token = %conn.device_token,
                platform = %conn.platform,
                messages = conn.message_count,
                "device disconnected"
            );
        } else {
            debug!(conn_id, "socket closed after connection was taken down");
        }
        self.stats.connection_closed();
    }

    /// Remove a connection, run its offline path, and signal its socket task to exit.
    async fn disconnect(&self, conn_id: &str) {
        if let Some(conn) = self.registry.close(conn_id) {
            self.go_offline(&conn).await;
            conn.closer.cancel();
        }
    }

    /// Presence delete and durable offline flag, both skipped where a newer connection (here or
    /// on another node) already owns the device. Both are best-effort.
    async fn go_offline(&self, conn: &Connection) {
        if conn.device_token.is_empty() {
            return;
        }
        if let Err(e) = self.presence.remove(&conn.device_token, &conn.id).await {
            warn!(conn_id = %conn.id, error = %e, "presence delete failed");
        }
        let Ok(app_id) = i64::try_from(conn.app_id) else {
            return;
        };
        self.sync.enqueue(PresenceUpdate {
            app_id,
            token_hash: token_hash(&conn.device_token),
            presence: DevicePresence::offline(Utc::now()),
            if_connection: Some(conn.id.clone()),
        });
    }

    /// Expire and close every connection idle for longer than `idle`. Returns how many were closed.
    pub async fn sweep_expired(&self, idle: Duration) -> usize {
        let Some(cutoff) = idle_cutoff(idle) else {
            return 0;
        };
        let mut closed = 0;
        for stale in self.registry.sweep(cutoff) {
            // Idleness is re-checked at removal; earlier offline writes may have taken a while.
            let Some(conn) = self.registry.close_idle(&stale.id, cutoff) else {
                continue;
            };
            self.go_offline(&conn).await;
            conn.closer.cancel();
            debug!(conn_id = %conn.id, last_activity = %conn.last_activity, "expired idle connection");
            closed += 1;
        }
        closed
    }

    pub fn node_health(&self) -> NodeHealth {
        let snap = self.stats.snapshot();
        NodeHealth {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
            active_connections: snap.active_connections,
            max_connections: self.max_connections,
            total_messages: snap.total_messages,
            uptime_secs: snap.uptime_secs,
            updated_at: Utc::now(),
        }
    }

    pub async fn publish_node_health(&self) -> Result<(), GatewayError> {
        self.presence
            .publish_node(&self.node_health(), self.timing.node_ttl)
            .await
    }

    pub async fn withdraw_node(&self) -> Result<(), GatewayError> {
        self.presence.remove_node(&self.node_id).await
    }
}
