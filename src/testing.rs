//! In-memory presence and durable stores for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::models::{App, Device, DevicePresence};
use crate::presence::{NodeHealth, PresenceRecord, PresenceStore};
use crate::store::{token_hash, DeviceStore};

#[derive(Default)]
pub struct MemoryPresence {
    online: Mutex<HashMap<String, (PresenceRecord, Duration)>>,
    heartbeats: Mutex<HashMap<String, usize>>,
    removals: Mutex<HashMap<String, usize>>,
    nodes: Mutex<HashMap<String, (NodeHealth, Duration)>>,
    failing: AtomicBool,
    yielding: AtomicBool,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Yield to the scheduler at the start of every call, like a network round trip.
    pub fn set_yielding(&self, yielding: bool) {
        self.yielding.store(yielding, Ordering::SeqCst);
    }

    pub fn record(&self, token: &str) -> Option<(PresenceRecord, Duration)> {
        self.online.lock().unwrap().get(token).cloned()
    }

    pub fn heartbeats(&self, token: &str) -> usize {
        self.heartbeats.lock().unwrap().get(token).copied().unwrap_or(0)
    }

    pub fn removals(&self, token: &str) -> usize {
        self.removals.lock().unwrap().get(token).copied().unwrap_or(0)
    }

    pub fn node(&self, node_id: &str) -> Option<(NodeHealth, Duration)> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }

    async fn check(&self) -> Result<(), GatewayError> {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::PresenceTimeout)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.check().await
    }

    async fn set_online(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        self.check().await?;
        self.online
            .lock()
            .unwrap()
            .insert(token.to_string(), (record.clone(), ttl));
        Ok(())
    }

    async fn heartbeat(
        &self,
        token: &str,
        record: &PresenceRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        self.check().await?;
        {
            let mut online = self.online.lock().unwrap();
            let owned_elsewhere = online
                .get(token)
                .is_some_and(|(rec, _)| rec.conn_id != record.conn_id);
            if !owned_elsewhere {
                online.insert(token.to_string(), (record.clone(), ttl));
            }
        }
        *self
            .heartbeats
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default() += 1;
        Ok(())
    }

    /// Counts only deletes that matched the owning connection.
    async fn remove(&self, token: &str, conn_id: &str) -> Result<(), GatewayError> {
        self.check().await?;
        let mut online = self.online.lock().unwrap();
        if online.get(token).is_some_and(|(rec, _)| rec.conn_id == conn_id) {
            online.remove(token);
            *self
                .removals
                .lock()
                .unwrap()
                .entry(token.to_string())
                .or_default() += 1;
        }
        Ok(())
    }

    async fn publish_node(&self, health: &NodeHealth, ttl: Duration) -> Result<(), GatewayError> {
        self.check().await?;
        self.nodes
            .lock()
            .unwrap()
            .insert(health.node_id.clone(), (health.clone(), ttl));
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<(), GatewayError> {
        self.check().await?;
        self.nodes.lock().unwrap().remove(node_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    apps: Mutex<HashMap<i64, App>>,
    devices: Mutex<Vec<Device>>,
    history: Mutex<HashMap<String, Vec<DevicePresence>>>,
    fail_lookups: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_app(&self, id: i64, status: i16) {
        self.apps.lock().unwrap().insert(
            id,
            App {
                id,
                name: format!("app-{id}"),
                status,
            },
        );
    }

    pub fn add_device(&self, app_id: i64, token: &str, platform: &str, status: i16) {
        let mut devices = self.devices.lock().unwrap();
        let id = devices.len() as i64 + 1;
        devices.push(Device {
            id,
            app_id,
            token_hash: token_hash(token),
            platform: platform.to_string(),
            status,
            is_online: false,
            last_seen_at: None,
            last_heartbeat_at: None,
            gateway_node: None,
            connection_id: None,
        });
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every presence write that matched a device row for a token, oldest first.
    pub fn presence_history(&self, token: &str) -> Vec<DevicePresence> {
        self.history
            .lock()
            .unwrap()
            .get(&token_hash(token))
            .cloned()
            .unwrap_or_default()
    }

    pub fn device(&self, app_id: i64, token: &str) -> Option<Device> {
        let hash = token_hash(token);
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.app_id == app_id && d.token_hash == hash)
            .cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn find_app(&self, app_id: i64) -> Result<Option<App>, GatewayError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(GatewayError::Store(diesel::result::Error::BrokenTransactionManager));
        }
        Ok(self.apps.lock().unwrap().get(&app_id).cloned())
    }

    async fn find_device(
        &self,
        app_id: i64,
        token_hash: &str,
    ) -> Result<Option<Device>, GatewayError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(GatewayError::Store(diesel::result::Error::BrokenTransactionManager));
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.app_id == app_id && d.token_hash == token_hash)
            .cloned())
    }

    async fn set_presence(
        &self,
        app_id: i64,
        token_hash: &str,
        presence: &DevicePresence,
        if_connection: Option<&str>,
    ) -> Result<(), GatewayError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Store(diesel::result::Error::BrokenTransactionManager));
        }
        let mut applied = 0;
        for d in self.devices.lock().unwrap().iter_mut() {
            if d.app_id != app_id || d.token_hash != token_hash {
                continue;
            }
            if if_connection.is_some_and(|c| d.connection_id.as_deref() != Some(c)) {
                continue;
            }
            d.is_online = presence.is_online;
            d.gateway_node = presence.gateway_node.clone();
            d.connection_id = presence.connection_id.clone();
            d.last_seen_at = presence.last_seen_at;
            d.last_heartbeat_at = presence.last_heartbeat_at;
            applied += 1;
        }
        if applied > 0 {
            self.history
                .lock()
                .unwrap()
                .entry(token_hash.to_string())
                .or_default()
                .push(presence.clone());
        }
        Ok(())
    }
}
