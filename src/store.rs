//! Durable store access: app/device lookups for registration and device presence columns.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::error::GatewayError;
use crate::models::{App, Device, DevicePresence};
use crate::schema::{apps, devices};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Hex MD5 of a device token, the form stored in `devices.token_hash`.
pub fn token_hash(token: &str) -> String {
    format!("{:x}", md5::compute(token.as_bytes()))
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_app(&self, app_id: i64) -> Result<Option<App>, GatewayError>;
    async fn find_device(
        &self,
        app_id: i64,
        token_hash: &str,
    ) -> Result<Option<Device>, GatewayError>;
    /// Write the presence columns. With `if_connection`, only a row that still names that
    /// connection is updated.
    async fn set_presence(
        &self,
        app_id: i64,
        token_hash: &str,
        presence: &DevicePresence,
        if_connection: Option<&str>,
    ) -> Result<(), GatewayError>;
}

/// Postgres-backed store. Diesel is blocking, so every query runs on the blocking pool.
#[derive(Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, GatewayError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| GatewayError::Config(format!("database pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, diesel::result::Error> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T, GatewayError> {
            let conn = &mut pool.get()?;
            Ok(f(conn)?)
        })
        .await?
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn find_app(&self, app_id: i64) -> Result<Option<App>, GatewayError> {
        self.run(move |conn| {
            apps::table
                .find(app_id)
                .select(App::as_select())
                .first(conn)
                .optional()
        })
        .await
    }

    async fn find_device(
        &self,
        app_id: i64,
        token_hash: &str,
    ) -> Result<Option<Device>, GatewayError> {
        let token_hash = token_hash.to_string();
        self.run(move |conn| {
            devices::table
                .filter(devices::app_id.eq(app_id))
                .filter(devices::token_hash.eq(token_hash))
                .select(Device::as_select())
                .first(conn)
                .optional()
        })
        .await
    }

    async fn set_presence(
        &self,
        app_id: i64,
        token_hash: &str,
        presence: &DevicePresence,
        if_connection: Option<&str>,
    ) -> Result<(), GatewayError> {
        let token_hash = token_hash.to_string();
        let presence = presence.clone();
        let if_connection = if_connection.map(str::to_string);
        let updated = self
            .run(move |conn| {
                let target = devices::table
                    .filter(devices::app_id.eq(app_id))
                    .filter(devices::token_hash.eq(token_hash));
                match if_connection {
                    Some(conn_id) => diesel::update(target.filter(devices::connection_id.eq(conn_id)))
                        .set(&presence)
                        .execute(conn),
                    None => diesel::update(target).set(&presence).execute(conn),
                }
            })
            .await?;
        if updated == 0 {
            tracing::debug!(app_id, "presence update matched no device row");
        }
        Ok(())
    }
}
