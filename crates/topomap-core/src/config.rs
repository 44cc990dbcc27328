//! Configuration system for topomap.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TOPOMAP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/topomap/config.toml
//!   3. ~/.config/topomap/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{
    AGGREGATE_INTERVAL_SECS, MAX_DATAGRAM, MULTICAST_GROUP, NEIGHBOUR_TIMEOUT_SECS,
    PROTOCOL_PORT, REAP_INTERVAL_SECS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopomapConfig {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interfaces to listen on, one listener each. Empty = one unbound listener.
    pub interfaces: Vec<String>,
    /// Multicast group joined by every listener.
    pub multicast_group: String,
    /// Protocol UDP port.
    pub port: u16,
    /// Receive buffer size per listener, in bytes.
    pub recv_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Silence after which a neighbour is evicted.
    pub neighbour_timeout_secs: u64,
    /// Interval between liveness sweeps.
    pub reap_interval_secs: u64,
    /// Interval between aggregation passes.
    pub aggregate_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Local HTTP port for the snapshot API.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            multicast_group: MULTICAST_GROUP.to_string(),
            port: PROTOCOL_PORT,
            recv_buffer: MAX_DATAGRAM,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            neighbour_timeout_secs: NEIGHBOUR_TIMEOUT_SECS,
            reap_interval_secs: REAP_INTERVAL_SECS,
            aggregate_interval_secs: AGGREGATE_INTERVAL_SECS,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8000,
        }
    }
}

impl NetworkConfig {
    /// The multicast group as an address. Must be an IPv6 multicast address.
    pub fn group(&self) -> Result<Ipv6Addr, ConfigError> {
        match self.multicast_group.parse::<Ipv6Addr>() {
            Ok(addr) if addr.is_multicast() => Ok(addr),
            _ => Err(ConfigError::InvalidMulticastGroup(
                self.multicast_group.clone(),
            )),
        }
    }
}

impl TimingConfig {
    pub fn neighbour_timeout(&self) -> Duration {
        Duration::from_secs(self.neighbour_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs(self.aggregate_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("topomap")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("not an IPv6 multicast group: {0}")]
    InvalidMulticastGroup(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TopomapConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TopomapConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TOPOMAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TopomapConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Interface names given on the command line replace the configured list.
    pub fn apply_interface_args(&mut self, args: Vec<String>) {
        if !args.is_empty() {
            self.network.interfaces = args;
        }
    }

    /// Apply TOPOMAP_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TOPOMAP_NETWORK__INTERFACES") {
            self.network.interfaces = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("TOPOMAP_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = lookup("TOPOMAP_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Some(v) = lookup("TOPOMAP_API__ENABLED") {
            self.api.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("TOPOMAP_TIMING__NEIGHBOUR_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.timing.neighbour_timeout_secs = secs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = TopomapConfig::default();
        assert!(config.network.interfaces.is_empty());
        assert_eq!(config.network.port, 8231);
        assert_eq!(config.network.group().unwrap(), "ff02::11".parse::<Ipv6Addr>().unwrap());
        assert_eq!(config.timing.neighbour_timeout(), Duration::from_secs(105));
        assert_eq!(config.timing.reap_interval(), Duration::from_secs(30));
        assert_eq!(config.timing.aggregate_interval(), Duration::from_secs(7));
        assert!(config.api.enabled);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = TopomapConfig::from_toml(
            r#"
            [network]
            interfaces = ["eth0", "wlan0"]

            [timing]
            neighbour_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.network.interfaces, vec!["eth0", "wlan0"]);
        assert_eq!(config.network.port, 8231);
        assert_eq!(config.timing.neighbour_timeout_secs, 60);
        assert_eq!(config.timing.reap_interval_secs, 30);
        assert_eq!(config.api.port, 8000);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TOPOMAP_NETWORK__INTERFACES", "eth0, eth1,"),
            ("TOPOMAP_API__ENABLED", "0"),
            ("TOPOMAP_API__PORT", "9100"),
            ("TOPOMAP_NETWORK__PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();

        let mut config = TopomapConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.interfaces, vec!["eth0", "eth1"]);
        assert!(!config.api.enabled);
        assert_eq!(config.api.port, 9100);
        assert_eq!(config.network.port, 8231, "unparsable port is ignored");
    }

    #[test]
    fn interface_args_replace_configured_list() {
        let mut config = TopomapConfig::default();
        config.network.interfaces = vec!["eth0".into()];

        config.apply_interface_args(Vec::new());
        assert_eq!(config.network.interfaces, vec!["eth0"]);

        config.apply_interface_args(vec!["br-lan".into()]);
        assert_eq!(config.network.interfaces, vec!["br-lan"]);
    }

    #[test]
    fn non_multicast_group_is_rejected() {
        let mut config = TopomapConfig::default();
        config.network.multicast_group = "fe80::1".into();
        assert!(matches!(
            config.network.group(),
            Err(ConfigError::InvalidMulticastGroup(_))
        ));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("topomap-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("TOPOMAP_CONFIG", config_path.to_str().unwrap());
        }

        let path = TopomapConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let text = std::fs::read_to_string(&path).unwrap();
        let config = TopomapConfig::from_toml(&text).expect("default config should parse");
        assert_eq!(config.network.port, 8231);

        unsafe {
            std::env::remove_var("TOPOMAP_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
