use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::validator::AuthError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("registration rejected: {0}")]
    Auth(#[from] AuthError),
    #[error("presence store error: {0}")]
    Presence(#[from] redis::RedisError),
    #[error("presence store call timed out")]
    PresenceTimeout,
    #[error("database error: {0}")]
    Store(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Protocol and registration failures end the connection with an ERROR frame.
    /// Everything else is infrastructure trouble the client never hears about.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GatewayError::Protocol(_) | GatewayError::Auth(_))
    }

    /// Text for the ERROR frame body.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Protocol(e) => e.to_string(),
            GatewayError::Auth(e) => e.to_string(),
            _ => "internal error".to_string(),
        }
    }
}
