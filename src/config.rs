//! Daemon Configuration
//!
//! Loaded from a YAML file; every key is optional and falls back to the
//! defaults below. The binary applies CLI/env overrides on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Configuration of the resource manager daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Plugin modules to load at startup
    pub installed_plugins: Vec<String>,
    /// Seconds between `update_scan` calls
    pub plugin_default_update_period: u64,
    /// Scan loop backoff bounds, in seconds
    pub retry_delay_min_secs: u64,
    pub retry_delay_max_secs: u64,
    /// Plugins whose commits are logged at info level
    pub debug_plugins: Vec<String>,
    /// JSON snapshot file for the store; in-memory when unset
    pub snapshot_path: Option<PathBuf>,
    /// Control RPC bind address
    pub control_addr: String,
    /// How often the scan daemon looks for new scannable records
    pub new_session_poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            installed_plugins: vec!["linux".into(), "linux_network".into()],
            plugin_default_update_period: 5,
            retry_delay_min_secs: 1,
            retry_delay_max_secs: 256,
            debug_plugins: Vec::new(),
            snapshot_path: None,
            control_addr: "127.0.0.1:8095".into(),
            new_session_poll_secs: 5,
        }
    }
}

impl DaemonConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), plugins = ?config.installed_plugins, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_default_update_period == 0 {
            return Err(Error::Configuration(
                "plugin_default_update_period must be positive".into(),
            ));
        }
        if self.retry_delay_min_secs == 0 || self.retry_delay_min_secs > self.retry_delay_max_secs {
            return Err(Error::Configuration(format!(
                "invalid retry delay bounds {}..{}",
                self.retry_delay_min_secs, self.retry_delay_max_secs
            )));
        }
        self.control_socket_addr()?;
        Ok(())
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.plugin_default_update_period)
    }

    pub fn retry_delay_min(&self) -> Duration {
        Duration::from_secs(self.retry_delay_min_secs)
    }

    pub fn retry_delay_max(&self) -> Duration {
        Duration::from_secs(self.retry_delay_max_secs)
    }

    pub fn new_session_poll(&self) -> Duration {
        Duration::from_secs(self.new_session_poll_secs.max(1))
    }

    pub fn control_socket_addr(&self) -> Result<SocketAddr> {
        self.control_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid control address {}: {}", self.control_addr, e)))
    }

    pub fn is_debug_plugin(&self, plugin: &str) -> bool {
        self.debug_plugins.iter().any(|p| p == plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.installed_plugins, vec!["linux", "linux_network"]);
        assert_eq!(config.update_period(), Duration::from_secs(5));
        assert_eq!(config.retry_delay_max(), Duration::from_secs(256));
        assert_eq!(config.control_socket_addr().unwrap().port(), 8095);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "installed_plugins: [linux]\ndebug_plugins: [linux]\nsnapshot_path: /var/lib/srm/store.json"
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.installed_plugins, vec!["linux"]);
        assert!(config.is_debug_plugin("linux"));
        assert!(!config.is_debug_plugin("linux_network"));
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/var/lib/srm/store.json")));
        assert_eq!(config.retry_delay_min_secs, 1);
    }

    #[test]
    fn test_invalid_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "retry_delay_min_secs: 10\nretry_delay_max_secs: 2").unwrap();
        assert_matches!(DaemonConfig::from_file(file.path()), Err(Error::Configuration(_)));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "installed_plugins: 7").unwrap();
        assert_matches!(DaemonConfig::from_file(file.path()), Err(Error::YamlParse(_)));

        assert_matches!(
            DaemonConfig::from_file("/nonexistent/srm.yaml"),
            Err(Error::Io(_))
        );
    }
}
