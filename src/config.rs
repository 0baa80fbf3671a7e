//! Client Configuration
//!
//! Settings shared by both cache strategies. Loaded from YAML or built in
//! code; every field has a default so partial documents are accepted.
//!
//! ```yaml
//! operation_timeout_ms: 30000
//! reader_chunk_size: 500
//! compression_enabled: true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Client-side configuration for an open cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout attached to every outgoing request
    pub operation_timeout_ms: u64,
    /// Timeout for establishing a server connection
    pub connection_timeout_ms: u64,
    /// How long the client stays in dedicated-call mode after a
    /// state-transfer fault
    pub dedicated_call_window_secs: u64,
    /// Rows requested per reader chunk
    pub reader_chunk_size: usize,
    /// Use the client-held key distribution map to shard bulk operations
    pub import_hashmap: bool,
    /// Compress serialized payloads above the threshold
    pub compression_enabled: bool,
    /// Minimum payload size for compression
    pub compression_threshold_bytes: u64,
    /// Application name reported to the server
    pub app_name: Option<String>,
    /// Deliver notifications on background tasks
    pub notify_async: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 90_000,
            connection_timeout_ms: 5_000,
            dedicated_call_window_secs: 60,
            reader_chunk_size: 1_000,
            import_hashmap: true,
            compression_enabled: false,
            compression_threshold_bytes: 1024,
            app_name: None,
            notify_async: true,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject settings the client cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            return Err(Error::Config("operation_timeout_ms must be > 0".into()));
        }
        if self.reader_chunk_size == 0 {
            return Err(Error::Config("reader_chunk_size must be > 0".into()));
        }
        if self.dedicated_call_window_secs == 0 {
            return Err(Error::Config(
                "dedicated_call_window_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn dedicated_call_window(&self) -> Duration {
        Duration::from_secs(self.dedicated_call_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.dedicated_call_window(), Duration::from_secs(60));
        assert_eq!(config.operation_timeout(), Duration::from_secs(90));
        assert!(config.import_hashmap);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ClientConfig::from_yaml_str(
            "operation_timeout_ms: 2500\ncompression_enabled: true\napp_name: billing\n",
        )
        .unwrap();

        assert_eq!(config.operation_timeout(), Duration::from_millis(2500));
        assert!(config.compression_enabled);
        assert_eq!(config.app_name.as_deref(), Some("billing"));
        assert_eq!(config.reader_chunk_size, 1_000);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let result = ClientConfig::from_yaml_str("reader_chunk_size: 0\n");
        assert_matches!(result, Err(Error::Config(_)));
    }
}
