//! Connection registry: live device connections keyed by connection id, plus a device token index.
//! Both maps are sharded (`DashMap`), so unrelated connections never contend on one lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connected,
    Registered,
    Expired,
}

/// Per-connection state. The socket task holds the id; everything else lives here.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    /// Empty until registered.
    pub device_token: String,
    /// 0 until registered.
    pub app_id: u64,
    pub platform: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub status: ConnStatus,
    /// Cancelled to force the socket task to close.
    pub closer: CancellationToken,
}

impl Connection {
    pub fn is_registered(&self) -> bool {
        self.status == ConnStatus::Registered
    }
}

/// Thread-safe; shared via Arc.
pub struct ConnectionRegistry {
    node_id: String,
    next_seq: AtomicU64,
    by_id: DashMap<String, Connection>,
    /// device token -> connection id.
    by_token: DashMap<String, String>,
}

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug, PartialEq, Eq)]
pub enum Registration {
    /// The token now points at this connection. `displaced` is the previous owner, still live in
    /// the registry until the caller closes it.
    Bound { displaced: Option<String> },
    /// The connection was closed before it could register.
    Gone,
}

/// Activity cutoff for an idle timeout, `None` if it does not fit in a timestamp.
pub fn idle_cutoff(idle: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(idle)
        .ok()
        .and_then(|idle| Utc::now().checked_sub_signed(idle))
}

impl ConnectionRegistry {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            next_seq: AtomicU64::new(0),
            by_id: DashMap::new(),
            by_token: DashMap::new(),
        }
    }

    /// `{node}-{unix millis}-{seq}`; the sequence alone keeps ids unique for the process lifetime.
    fn next_conn_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.node_id, now.timestamp_millis(), seq)
    }

    /// Store a new connection in `Connected` state and return a snapshot of it.
    pub fn open(&self, remote_addr: SocketAddr, closer: CancellationToken) -> Connection {
        let now = Utc::now();
        let conn = Connection {
            id: self.next_conn_id(now),
            device_token: String::new(),
            app_id: 0,
            platform: String::new(),
            remote_addr,
            connected_at: now,
            last_activity: now,
            message_count: 0,
            status: ConnStatus::Connected,
            closer,
        };
        self.by_id.insert(conn.id.clone(), conn.clone());
        conn
    }

    /// Record traffic. Returns the new last-activity time, never earlier than the previous one.
    pub fn touch(&self, conn_id: &str) -> Option<DateTime<Utc>> {
        let mut conn = self.by_id.get_mut(conn_id)?;
        conn.last_activity = conn.last_activity.max(Utc::now());
        conn.message_count += 1;
        Some(conn.last_activity)
    }

    /// Move a connection to `Registered` and point the token index at it. The index swap is a
    /// single insert, so of any number of concurrent registrations for one token each displaces
    /// exactly one predecessor and the last one owns the token.
    pub fn register(
        &self,
        conn_id: &str,
        app_id: u64,
        device_token: &str,
        platform: &str,
    ) -> Registration {
        let Some(mut conn) = self.by_id.get_mut(conn_id) else {
            return Registration::Gone;
        };
        conn.status = ConnStatus::Registered;
        conn.app_id = app_id;
        conn.device_token = device_token.to_string();
        conn.platform = platform.to_string();
        // Index updated under the by-id guard so a concurrent close sees both or neither.
        let displaced = self
            .by_token
            .insert(device_token.to_string(), conn_id.to_string())
            .filter(|prev| prev != conn_id);
        Registration::Bound { displaced }
    }

    pub fn get(&self, conn_id: &str) -> Option<Connection> {
        self.by_id.get(conn_id).map(|c| c.clone())
    }

    /// Connection id currently bound to a device token.
    pub fn token_owner(&self, device_token: &str) -> Option<String> {
        self.by_token.get(device_token).map(|id| id.clone())
    }

    /// Remove a connection and its token mapping. Only the first caller gets `Some`, which makes
    /// the caller responsible for the offline path.
    pub fn close(&self, conn_id: &str) -> Option<Connection> {
        let (_, conn) = self.by_id.remove(conn_id)?;
        if !conn.device_token.is_empty() {
            self.by_token
                .remove_if(&conn.device_token, |_, owner| owner == conn_id);
        }
        Some(conn)
    }

    /// Remove a connection only if it has been idle since before `cutoff`, checked under the
    /// entry lock so traffic racing the sweep keeps the connection alive.
    pub fn close_idle(&self, conn_id: &str, cutoff: DateTime<Utc>) -> Option<Connection> {
        let (_, mut conn) = self
            .by_id
            .remove_if(conn_id, |_, c| c.last_activity < cutoff)?;
        if !conn.device_token.is_empty() {
            self.by_token
                .remove_if(&conn.device_token, |_, owner| owner == conn_id);
        }
        conn.status = ConnStatus::Expired;
        Some(conn)
    }

    /// Snapshot connections with no traffic since `cutoff`. Nothing is removed.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Vec<Connection> {
        self.by_id
            .iter()
            .filter(|c| c.last_activity < cutoff)
            .map(|c| c.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
