//! Registration check: the app must exist and be enabled, and the token must belong to an
//! enabled device of that app.

use std::sync::Arc;

use thiserror::Error;

use crate::error::GatewayError;
use crate::models::STATUS_ENABLED;
use crate::store::{token_hash, DeviceStore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing appId or token")]
    MissingFields,
    #[error("app not found")]
    AppNotFound,
    #[error("app disabled")]
    AppDisabled,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device disabled")]
    DeviceDisabled,
    #[error("registration unavailable")]
    Unavailable,
}

/// A device that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidDevice {
    pub app_id: i64,
    pub device_id: i64,
    pub token_hash: String,
    pub platform: String,
}

#[derive(Clone)]
pub struct DeviceValidator {
    store: Arc<dyn DeviceStore>,
}

impl DeviceValidator {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Store failures surface as [`AuthError::Unavailable`]: the client is refused either way.
    pub async fn validate(&self, app_id: u64, token: &str) -> Result<ValidDevice, AuthError> {
        if app_id == 0 || token.is_empty() {
            return Err(AuthError::MissingFields);
        }
        let app_id = i64::try_from(app_id).map_err(|_| AuthError::AppNotFound)?;
        self.lookup(app_id, token).await.map_err(|e| match e {
            GatewayError::Auth(auth) => auth,
            other => {
                tracing::warn!(app_id, error = %other, "device lookup failed");
                AuthError::Unavailable
            }
        })
    }

    async fn lookup(&self, app_id: i64, token: &str) -> Result<ValidDevice, GatewayError> {
        let app = self.store.find_app(app_id).await?.ok_or(AuthError::AppNotFound)?;
        if app.status != STATUS_ENABLED {
            return Err(AuthError::AppDisabled.into());
        }
        let hash = token_hash(token);
        let device = self
            .store
            .find_device(app_id, &hash)
            .await?
            .ok_or(AuthError::DeviceNotFound)?;
        if device.status != STATUS_ENABLED {
            return Err(AuthError::DeviceDisabled.into());
        }
        Ok(ValidDevice {
            app_id,
            device_id: device.id,
            token_hash: hash,
            platform: device.platform,
        })
    }
}
