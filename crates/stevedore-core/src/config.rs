//! Tunnel configuration
//!
//! Stored in `~/.config/stevedore/tunnel.yaml`. Every field is optional:
//!
//! ```yaml
//! namespace: zarf
//! podReadyTimeout: 30s
//! maxAttempts: 3
//! retryDelay: 10s
//! autoOpen: false
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::target::SYSTEM_NAMESPACE;

/// Tunnel behavior settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Namespace used when a target does not name one
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How long to wait for a service to have a ready pod
    #[serde(default = "default_pod_ready_timeout", with = "humantime_serde")]
    pub pod_ready_timeout: Duration,

    /// Total establishment attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit; attempt `n` waits `n * retry_delay` before the next one
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Open the endpoint in a browser for blocking tunnels
    #[serde(default)]
    pub auto_open: bool,
}

fn default_namespace() -> String {
    SYSTEM_NAMESPACE.to_string()
}

fn default_pod_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(10)
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            pod_ready_timeout: default_pod_ready_timeout(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            auto_open: false,
        }
    }
}

impl TunnelConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get default configuration path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| CoreError::InvalidConfig {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("stevedore").join("tunnel.yaml"))
    }

    /// Reject settings the tunnel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidConfig {
                message: "maxAttempts must be at least 1".to_string(),
            });
        }
        if self.namespace.is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "namespace must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.namespace, "zarf");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(10));
        assert_eq!(config.pod_ready_timeout, Duration::from_secs(30));
        assert!(!config.auto_open);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.yaml");
        std::fs::write(&path, "podReadyTimeout: 2m\nautoOpen: true\n").unwrap();

        let config = TunnelConfig::load_from(&path).unwrap();
        assert_eq!(config.pod_ready_timeout, Duration::from_secs(120));
        assert!(config.auto_open);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_load_rejects_zero_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.yaml");
        std::fs::write(&path, "maxAttempts: 0\n").unwrap();

        let err = TunnelConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TunnelConfig::load_from(Path::new("/nonexistent/tunnel.yaml")).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn test_serialize_snapshot() {
        let yaml = serde_yaml::to_string(&TunnelConfig::default()).unwrap();
        insta::assert_snapshot!(yaml, @r"
        namespace: zarf
        podReadyTimeout: 30s
        maxAttempts: 3
        retryDelay: 10s
        autoOpen: false
        ");
    }
}
