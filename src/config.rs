//! Server configuration, read from `SLOTKEEPER_*` environment variables.
//!
//! - `SLOTKEEPER_PORT`: listen port (default 5433)
//! - `SLOTKEEPER_BIND`: bind address (default 0.0.0.0)
//! - `SLOTKEEPER_DATA_DIR`: directory holding the WAL (default ./data)
//! - `SLOTKEEPER_PASSWORD`: cleartext password for the wire protocol (default slotkeeper)
//! - `SLOTKEEPER_MAX_CONNECTIONS`: concurrent connection limit (default 256)
//! - `SLOTKEEPER_COMPACT_THRESHOLD`: WAL appends before compaction (default 1000)
//! - `SLOTKEEPER_TLS_CERT` / `SLOTKEEPER_TLS_KEY`: PEM files; both or neither
//! - `SLOTKEEPER_METRICS_PORT`: Prometheus exporter port (disabled if unset)
//! - `SLOTKEEPER_RETRY_ATTEMPTS`: gateway attempts per call (default 3)
//! - `SLOTKEEPER_RETRY_BASE_DELAY_MS`: first backoff delay (default 50)
//! - `SLOTKEEPER_OP_TIMEOUT_MS`: gateway deadline per attempt (default 5000)
//! - `SLOTKEEPER_DEFAULT_GRANULARITY_MIN`: slot step when a query omits one (default 15)

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::GatewayConfig;
use crate::limits::{DEFAULT_GRANULARITY_MIN, MAX_GRANULARITY_MIN, MIN_GRANULARITY_MIN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set together")]
    PartialTls,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |var: &'static str, default| -> Result<u64, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { var, value }),
            }
        };
        let port = parsed("SLOTKEEPER_PORT", 5433)?;
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            var: "SLOTKEEPER_PORT",
            value: port.to_string(),
        })?;
        let metrics_port = match lookup("SLOTKEEPER_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                var: "SLOTKEEPER_METRICS_PORT",
                value,
            })?),
        };

        let max_connections = parsed("SLOTKEEPER_MAX_CONNECTIONS", 256)? as usize;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "SLOTKEEPER_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        let tls_cert = lookup("SLOTKEEPER_TLS_CERT");
        let tls_key = lookup("SLOTKEEPER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let granularity = parsed("SLOTKEEPER_DEFAULT_GRANULARITY_MIN", DEFAULT_GRANULARITY_MIN as u64)?;
        if !(MIN_GRANULARITY_MIN as u64..=MAX_GRANULARITY_MIN as u64).contains(&granularity) {
            return Err(ConfigError::Invalid {
                var: "SLOTKEEPER_DEFAULT_GRANULARITY_MIN",
                value: granularity.to_string(),
            });
        }

        let gateway = GatewayConfig {
            retry_attempts: parsed("SLOTKEEPER_RETRY_ATTEMPTS", 3)?.clamp(1, 10) as u32,
            retry_base_delay: Duration::from_millis(parsed("SLOTKEEPER_RETRY_BASE_DELAY_MS", 50)?),
            op_timeout: Duration::from_millis(parsed("SLOTKEEPER_OP_TIMEOUT_MS", 5000)?.max(1)),
            default_granularity_min: granularity as u32,
        };

        Ok(Self {
            port,
            bind: lookup("SLOTKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SLOTKEEPER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SLOTKEEPER_PASSWORD").unwrap_or_else(|| "slotkeeper".into()),
            max_connections,
            compact_threshold: parsed("SLOTKEEPER_COMPACT_THRESHOLD", 1000)?,
            tls_cert,
            tls_key,
            metrics_port,
            gateway,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeeper.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.gateway.retry_attempts, 3);
        assert_eq!(config.gateway.op_timeout, Duration::from_secs(5));
        assert_eq!(config.gateway.default_granularity_min, 15);
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotkeeper.wal"));
    }

    #[test]
    fn overrides() {
        let config = from(&[
            ("SLOTKEEPER_PORT", "6000"),
            ("SLOTKEEPER_METRICS_PORT", "9100"),
            ("SLOTKEEPER_RETRY_ATTEMPTS", "5"),
            ("SLOTKEEPER_OP_TIMEOUT_MS", "250"),
            ("SLOTKEEPER_DEFAULT_GRANULARITY_MIN", "30"),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.gateway.retry_attempts, 5);
        assert_eq!(config.gateway.op_timeout, Duration::from_millis(250));
        assert_eq!(config.gateway.default_granularity_min, 30);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            from(&[("SLOTKEEPER_PORT", "http")]).unwrap_err(),
            ConfigError::Invalid {
                var: "SLOTKEEPER_PORT",
                value: "http".into()
            }
        );
        assert!(from(&[("SLOTKEEPER_PORT", "70000")]).is_err());
        assert!(from(&[("SLOTKEEPER_MAX_CONNECTIONS", "0")]).is_err());
        assert!(from(&[("SLOTKEEPER_DEFAULT_GRANULARITY_MIN", "1")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            from(&[("SLOTKEEPER_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::PartialTls
        );
        let config = from(&[
            ("SLOTKEEPER_TLS_CERT", "cert.pem"),
            ("SLOTKEEPER_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
    }
}
