//! Configuración leída una sola vez al arrancar, desde variables de entorno.
//!
//! Todo tiene default salvo los secretos (`FLEET_AUTH_TOKEN`,
//! `FLEET_ENCRYPTION_KEY`), que son obligatorios.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::ConfigError;

pub const DEFAULT_NODE_ADDR: &str = "0.0.0.0:7070";
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:7070";

pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
pub const DEFAULT_SCHEDULING_POLICY: &str = "dynamic";
pub const DEFAULT_FOLD: &str = "concat";
pub const DEFAULT_FINISHED_BATCH_RETENTION: usize = 1024;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
pub const DEFAULT_NODE_CONCURRENCY: u32 = 2;
pub const DEFAULT_MAX_UTILIZATION_PERCENT: f32 = 85.0;

/// Secreto que no se imprime en logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Lector de variables: permite testear sin tocar el entorno del proceso.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, var: &'static str, default: &str) -> String {
        (self.lookup)(var)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(var) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { var, value: raw }),
            _ => Ok(default),
        }
    }

    fn secret(&self, var: &'static str) -> Result<Secret, ConfigError> {
        (self.lookup)(var)
            .filter(|v| !v.is_empty())
            .map(Secret)
            .ok_or(ConfigError::Missing(var))
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parsed(var, default)?;
        if secs == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: "0".into(),
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parsed(var, default)?))
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Puerto TCP donde se conectan los nodos (canal seguro)
    pub node_addr: String,
    /// API HTTP para clientes
    pub http_addr: String,

    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub receive_timeout: Duration,
    pub handshake_timeout: Duration,
    pub batch_timeout: Duration,

    pub max_task_attempts: u32,
    pub retry_backoff: Backoff,

    pub scheduling_policy: String,
    pub fold: String,
    pub data_dir: PathBuf,
    /// Batches terminados que se siguen consultando en memoria; los más
    /// viejos se olvidan (su salida queda en el storage)
    pub finished_batch_retention: usize,

    pub auth_token: Secret,
    pub encryption_key: Secret,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let v = Vars { lookup };
        Ok(Self {
            node_addr: v.string("FLEET_NODE_ADDR", DEFAULT_NODE_ADDR),
            http_addr: v.string("FLEET_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            heartbeat_timeout: v.secs("FLEET_HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS)?,
            sweep_interval: v.secs("FLEET_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?,
            receive_timeout: v.secs("FLEET_RECEIVE_TIMEOUT_SECS", DEFAULT_RECEIVE_TIMEOUT_SECS)?,
            handshake_timeout: v.secs(
                "FLEET_HANDSHAKE_TIMEOUT_SECS",
                DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            )?,
            batch_timeout: v.secs("FLEET_BATCH_TIMEOUT_SECS", DEFAULT_BATCH_TIMEOUT_SECS)?,
            max_task_attempts: v.parsed("FLEET_MAX_TASK_ATTEMPTS", DEFAULT_MAX_TASK_ATTEMPTS)?,
            retry_backoff: Backoff::new(
                v.millis("FLEET_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?,
                v.millis("FLEET_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)?,
            ),
            scheduling_policy: v.string("FLEET_SCHEDULING_POLICY", DEFAULT_SCHEDULING_POLICY),
            fold: v.string("FLEET_FOLD", DEFAULT_FOLD),
            data_dir: PathBuf::from(v.string("FLEET_DATA_DIR", "/tmp/fleet_data")),
            finished_batch_retention: v.parsed(
                "FLEET_FINISHED_BATCH_RETENTION",
                DEFAULT_FINISHED_BATCH_RETENTION,
            )?,
            auth_token: v.secret("FLEET_AUTH_TOKEN")?,
            encryption_key: v.secret("FLEET_ENCRYPTION_KEY")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub coordinator_addr: String,
    /// Si falta, el nodo usa su hostname
    pub node_id: Option<String>,

    pub heartbeat_interval: Duration,
    pub receive_timeout: Duration,
    /// Backoff de reconexión; `max` es el techo configurado
    pub reconnect_backoff: Backoff,

    pub concurrency: u32,
    pub max_utilization_percent: f32,
    pub data_dir: PathBuf,

    pub auth_token: Secret,
    pub encryption_key: Secret,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let v = Vars { lookup };
        let concurrency: u32 = v.parsed("FLEET_NODE_CONCURRENCY", DEFAULT_NODE_CONCURRENCY)?;
        Ok(Self {
            coordinator_addr: v.string("FLEET_COORDINATOR_ADDR", DEFAULT_COORDINATOR_ADDR),
            node_id: (v.lookup)("FLEET_NODE_ID").filter(|s| !s.trim().is_empty()),
            heartbeat_interval: v.secs(
                "FLEET_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?,
            receive_timeout: v.secs("FLEET_RECEIVE_TIMEOUT_SECS", DEFAULT_RECEIVE_TIMEOUT_SECS)?,
            reconnect_backoff: Backoff::new(
                v.millis("FLEET_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?,
                v.millis("FLEET_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?,
            ),
            concurrency: concurrency.max(1),
            max_utilization_percent: v.parsed(
                "FLEET_MAX_UTILIZATION_PERCENT",
                DEFAULT_MAX_UTILIZATION_PERCENT,
            )?,
            data_dir: PathBuf::from(v.string("FLEET_DATA_DIR", "/tmp/fleet_node")),
            auth_token: v.secret("FLEET_AUTH_TOKEN")?,
            encryption_key: v.secret("FLEET_ENCRYPTION_KEY")?,
        })
    }
}
