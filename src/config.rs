//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ClusterConfig: Role ("hub" serves, "viewer" runs a headless agent).
//!     - ServerConfig: Bind address and optional state snapshot file.
//!     - PresenceConfig: Sweep interval and heartbeat timeout.
//!     - SyncConfig: Where a viewer finds the hub, and its poll/echo timing.
//!     - CacheConfig: Offline cache namespace, TTL and backing file.
//!     - DeviceEntry / TokenEntry: Known enclosures, owners and tokens.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Hub,
    Viewer,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// json file mirroring actuator state; in-memory only when unset
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PresenceConfig {
    pub sweep_interval_ms: u64,
    pub offline_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub hub_url: String,
    #[serde(default)]
    pub device_id: String,
    pub poll_interval_ms: u64,
    pub echo_window_ms: u64,
    pub request_timeout_ms: u64,
    /// bearer token a headless viewer presents
    #[serde(default)]
    pub token: String,
    /// viewers running on the enclosure itself also send heartbeats
    #[serde(default)]
    pub send_heartbeats: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub namespace: String,
    pub ttl_ms: u64,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:3000".to_string(), snapshot_path: None }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: crate::presence::DEFAULT_SWEEP_INTERVAL_MS,
            offline_timeout_ms: crate::presence::DEFAULT_OFFLINE_TIMEOUT_MS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub_url: "http://127.0.0.1:3000".to_string(),
            device_id: String::new(),
            poll_interval_ms: 5_000,
            echo_window_ms: 3_000,
            request_timeout_ms: 5_000,
            token: String::new(),
            send_heartbeats: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "enclosure-sync".to_string(),
            ttl_ms: crate::cache::DEFAULT_TTL_MS,
            path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// where the running configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    /// no usable file; `rejected` lists files that exist but failed to load
    Defaults { rejected: Vec<(PathBuf, String)> },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!(path = %path.display(), "config loaded"),
            ConfigSource::Defaults { rejected } => {
                for (path, error) in rejected {
                    warn!(path = %path.display(), error = %error, "failed to load config");
                }
                warn!("no usable config file - using defaults (no devices, no tokens)");
            }
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// reject values that would stall or crash a background task
    pub fn validate(&self) -> anyhow::Result<()> {
        let nonzero = [
            ("presence.sweep_interval_ms", self.presence.sweep_interval_ms),
            ("presence.offline_timeout_ms", self.presence.offline_timeout_ms),
            ("sync.poll_interval_ms", self.sync.poll_interval_ms),
            ("sync.request_timeout_ms", self.sync.request_timeout_ms),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }
        Ok(())
    }

    /// Load with default fallback.
    ///
    /// runs before logging is installed, so what happened is returned as a
    /// `ConfigSource` for the caller to log once a subscriber exists.
    pub fn load_or_default() -> (Self, ConfigSource) {
        Self::load_first(&[
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ])
    }

    /// the first candidate that exists and loads, else defaults
    pub fn load_first(paths: &[PathBuf]) -> (Self, ConfigSource) {
        let mut rejected = Vec::new();
        for path in paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => return (config, ConfigSource::File(path.clone())),
                    Err(e) => rejected.push((path.clone(), format!("{:#}", e))),
                }
            }
        }

        (Self::default(), ConfigSource::Defaults { rejected })
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!(
            role = ?self.cluster.role,
            node_id = %self.cluster.node_id,
            bind_addr = %self.server.bind_addr,
            devices = self.devices.len(),
            sweep_interval_ms = self.presence.sweep_interval_ms,
            offline_timeout_ms = self.presence.offline_timeout_ms,
            poll_interval_ms = self.sync.poll_interval_ms,
            "host configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = HostConfig::parse("").unwrap();
        assert_eq!(config.cluster.role, Role::Hub);
        assert_eq!(config.presence.sweep_interval_ms, 30_000);
        assert_eq!(config.presence.offline_timeout_ms, 90_000);
        assert_eq!(config.sync.echo_window_ms, 3_000);
        assert_eq!(config.cache.ttl_ms, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_parses_devices_and_tokens() {
        let config = HostConfig::parse(
            r#"
            [cluster]
            role = "viewer"
            node_id = "kitchen-tablet"

            [sync]
            hub_url = "http://hub.local:3000"
            device_id = "ESP32-AA"
            poll_interval_ms = 2000
            echo_window_ms = 3000
            request_timeout_ms = 4000

            [[devices]]
            id = "ESP32-AA"
            members = ["alice", "bob"]

            [[tokens]]
            token = "tok-alice"
            user_id = "alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.role, Role::Viewer);
        assert_eq!(config.sync.device_id, "ESP32-AA");
        assert_eq!(config.devices[0].members, vec!["alice", "bob"]);
        assert_eq!(config.tokens[0].user_id, "alice");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = HostConfig::parse("[presence]\noffline_timeout_ms = 5000\n").unwrap();
        assert_eq!(config.presence.offline_timeout_ms, 5_000);
        assert_eq!(config.presence.sweep_interval_ms, 30_000);
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join("host.toml");
        let config = HostConfig::load(path).unwrap();
        assert_eq!(config.cluster.role, Role::Hub);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.tokens.len(), 2);
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for toml in [
            "[presence]\nsweep_interval_ms = 0\n",
            "[presence]\noffline_timeout_ms = 0\n",
            "[sync]\npoll_interval_ms = 0\n",
            "[sync]\nrequest_timeout_ms = 0\n",
        ] {
            let err = HostConfig::parse(toml).unwrap_err();
            assert!(format!("{:#}", err).contains("greater than zero"), "{}", toml);
        }
    }

    #[test]
    fn test_bad_file_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        let missing = dir.path().join("missing.toml");
        std::fs::write(&bad, "[presence]\nsweep_interval_ms = \"soon\"\n").unwrap();

        let (config, source) = HostConfig::load_first(&[missing, bad.clone()]);
        assert!(config.devices.is_empty());
        match source {
            ConfigSource::Defaults { rejected } => {
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].0, bad);
                assert!(rejected[0].1.contains("Failed to parse config"));
            }
            other => panic!("expected defaults, got {:?}", other),
        }
    }

    #[test]
    fn test_first_loadable_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("host.toml");
        std::fs::write(&good, "[cluster]\nrole = \"viewer\"\n").unwrap();

        let (config, source) = HostConfig::load_first(&[dir.path().join("nope.toml"), good.clone()]);
        assert_eq!(config.cluster.role, Role::Viewer);
        assert_eq!(source, ConfigSource::File(good));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = HostConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
