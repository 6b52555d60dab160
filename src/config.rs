//! Gateway configuration, sourced from the environment (and `.env` via dotenvy).

use std::str::FromStr;
use std::time::Duration;

use crate::error::GatewayError;

/// Presence record TTL: 2 hours.
pub const DEVICE_ONLINE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Node health record TTL: 30 seconds.
pub const NODE_HEALTH_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub max_connections: u64,
    pub metrics_port: u16,
    pub redis: RedisConfig,
    pub database_url: String,
    pub database_pool_size: u32,
    pub timing: Timing,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL in the `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Intervals and deadlines used by the handler and background loops.
#[derive(Debug, Clone)]
pub struct Timing {
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
    pub node_publish_interval: Duration,
    pub presence_ttl: Duration,
    pub node_ttl: Duration,
    pub presence_deadline: Duration,
    pub startup_deadline: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(5 * 60),
            node_publish_interval: Duration::from_secs(10),
            presence_ttl: DEVICE_ONLINE_TTL,
            node_ttl: NODE_HEALTH_TTL,
            presence_deadline: Duration::from_secs(2),
            startup_deadline: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let node_id = get("GATEWAY_NODE_ID").unwrap_or_else(|| {
            let host = get("HOSTNAME").unwrap_or_else(|| "local".to_string());
            format!("gateway-{host}")
        });
        let database_url = get("DATABASE_URL")
            .ok_or_else(|| GatewayError::Config("DATABASE_URL must be set".into()))?;

        let mut timing = Timing::default();
        timing.shutdown_grace =
            Duration::from_secs(parse_or(&get, "GATEWAY_SHUTDOWN_GRACE_SECS", 10u64)?);

        Ok(Self {
            node_id,
            host: get("GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "GATEWAY_PORT", 5003)?,
            max_connections: parse_or(&get, "GATEWAY_MAX_CONNECTIONS", 100_000)?,
            metrics_port: parse_or(&get, "GATEWAY_METRICS_PORT", 9090)?,
            redis: RedisConfig {
                host: get("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or(&get, "REDIS_PORT", 6379)?,
                password: get("REDIS_PASSWORD"),
                db: parse_or(&get, "REDIS_DB", 0)?,
            },
            database_url,
            database_pool_size: parse_or(&get, "DATABASE_POOL_SIZE", 16)?,
            timing,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, GatewayError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}
