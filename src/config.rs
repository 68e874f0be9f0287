use crate::cluster::{HealthConfig, ServerFeatures, TcpServer};
use crate::error::{DriverError, DriverResult};
use crate::protocol::Compressor;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Compressor names in preference order (`snappy`, `zlib`, `noop`)
    pub compressors: Vec<String>,

    /// zlib level 0-9, library default when unset
    pub zlib_compression_level: Option<u32>,

    /// Time between background maintenance passes (heartbeats, reaping)
    pub executor_interval_ms: u64,

    pub socket_timeout_ms: u64,

    pub session_idle_timeout_secs: u64,

    /// Silence after which a server is treated as suspected
    pub suspicion_threshold_ms: u64,

    /// Silence after which a server is treated as dead
    pub failure_threshold_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            compressors: Vec::new(),
            zlib_compression_level: None,
            executor_interval_ms: 1000,
            socket_timeout_ms: 30_000,
            session_idle_timeout_secs: 30 * 60,
            suspicion_threshold_ms: 10_000,
            failure_threshold_ms: 15_000,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compressors<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.compressors = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn zlib_compression_level(mut self, level: u32) -> Self {
        self.zlib_compression_level = Some(level);
        self
    }

    pub fn executor_interval_ms(mut self, ms: u64) -> Self {
        self.executor_interval_ms = ms;
        self
    }

    pub fn socket_timeout_ms(mut self, ms: u64) -> Self {
        self.socket_timeout_ms = ms;
        self
    }

    pub fn session_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.session_idle_timeout_secs = secs;
        self
    }

    /// Resolve the compressor names. Unknown names are rejected here, before
    /// anything is sent.
    pub fn resolved_compressors(&self) -> DriverResult<Vec<Compressor>> {
        self.compressors.iter().map(|name| name.parse()).collect()
    }

    /// Check every setting without building anything.
    pub fn validate(&self) -> DriverResult<()> {
        self.resolved_compressors()?;
        if let Some(level) = self.zlib_compression_level {
            if level > 9 {
                return Err(DriverError::Configuration(format!(
                    "zlib compression level must be between 0 and 9, got {}",
                    level
                )));
            }
        }
        if self.executor_interval_ms == 0 {
            return Err(DriverError::Configuration(
                "executor interval must be positive".to_string(),
            ));
        }
        if self.suspicion_threshold_ms > self.failure_threshold_ms {
            return Err(DriverError::Configuration(format!(
                "suspicion threshold ({}ms) exceeds failure threshold ({}ms)",
                self.suspicion_threshold_ms, self.failure_threshold_ms
            )));
        }
        Ok(())
    }

    pub fn executor_interval(&self) -> Duration {
        Duration::from_millis(self.executor_interval_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            suspicion_threshold: Duration::from_millis(self.suspicion_threshold_ms),
            failure_threshold: Duration::from_millis(self.failure_threshold_ms),
        }
    }

    /// A TCP server handle using this configuration's socket timeout.
    pub fn tcp_server(&self, address: &str, features: ServerFeatures) -> TcpServer {
        TcpServer::new(address, features).with_socket_timeout(self.socket_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.compressors.is_empty());
        assert_eq!(config.executor_interval(), Duration::from_secs(1));
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(1800));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_resolved_compressors_keep_order() {
        let config = ClientConfig::new().compressors(["zlib", "snappy"]);
        assert_eq!(
            config.resolved_compressors().unwrap(),
            vec![Compressor::Zlib, Compressor::Snappy]
        );
    }

    #[test]
    fn test_unknown_compressor_is_configuration_error() {
        let config = ClientConfig::new().compressors(["zstd"]);
        assert!(matches!(
            config.resolved_compressors(),
            Err(DriverError::Configuration(_))
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ranges() {
        assert_err!(ClientConfig::new().zlib_compression_level(10).validate());
        assert_err!(ClientConfig::new().executor_interval_ms(0).validate());

        let mut inverted = ClientConfig::new();
        inverted.suspicion_threshold_ms = 20_000;
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"compressors": ["snappy"], "socket_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.compressors, vec!["snappy"]);
        assert_eq!(config.socket_timeout(), Duration::from_millis(500));
        assert_eq!(config.executor_interval_ms, 1000);
    }
}
