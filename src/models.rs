use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

/// `status` value for enabled apps and devices.
pub const STATUS_ENABLED: i16 = 1;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::apps)]
pub struct App {
    pub id: i64,
    pub name: String,
    pub status: i16,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::devices)]
pub struct Device {
    pub id: i64,
    pub app_id: i64,
    pub token_hash: String,
    pub platform: String,
    pub status: i16,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub gateway_node: Option<String>,
    pub connection_id: Option<String>,
}

/// Presence columns written when a device comes online or goes offline.
/// `None` for node and connection clears them.
#[derive(Debug, Clone, PartialEq, Eq, AsChangeset)]
#[diesel(table_name = schema::devices, treat_none_as_null = true)]
pub struct DevicePresence {
    pub is_online: bool,
    pub gateway_node: Option<String>,
    pub connection_id: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl DevicePresence {
    pub fn online(node_id: &str, conn_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            is_online: true,
            gateway_node: Some(node_id.to_string()),
            connection_id: Some(conn_id.to_string()),
            last_seen_at: Some(at),
            last_heartbeat_at: Some(at),
        }
    }

    pub fn offline(at: DateTime<Utc>) -> Self {
        Self {
            is_online: false,
            gateway_node: None,
            connection_id: None,
            last_seen_at: Some(at),
            last_heartbeat_at: Some(at),
        }
    }
}
