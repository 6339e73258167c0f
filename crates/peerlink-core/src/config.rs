//! Configuration system for peerlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerlink/config.toml
//!   3. ~/.config/peerlink/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{DEFAULT_COUNTER_MODULUS, DEFAULT_READ_BUFFER};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub discovery: DiscoveryConfig,
    pub link: LinkConfig,
    pub reactor: ReactorConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Name published by responders and matched by initiators.
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Shared passphrase handed to the provisioning layer. Never negotiated.
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Address the per-peer listening sockets bind to. Port is always ephemeral.
    pub bind_addr: IpAddr,
    /// Bytes read per readiness event.
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound streams opened per linked peer.
    pub streams: usize,
    /// Delay between counter writes.
    pub write_interval_ms: u64,
    pub counter_modulus: u32,
}

impl ClientConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms.max(1))
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_name: "peerlink".to_string(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            passphrase: "peerlinktest".to_string(),
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            streams: 1,
            write_interval_ms: 100,
            counter_modulus: DEFAULT_COUNTER_MODULUS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerlink")
}

fn dirs_or_home() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a specific file, falling back to defaults if it does not exist.
    /// Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_at(&path)?;
        Ok(path)
    }

    /// Write the default config to `path` unless something is already there.
    pub fn write_default_at(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&Self::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply PEERLINK_* overrides. `lookup` resolves a variable name.
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PEERLINK_DISCOVERY__SERVICE_NAME") {
            self.discovery.service_name = v;
        }
        if let Some(v) = lookup("PEERLINK_LINK__PASSPHRASE") {
            self.link.passphrase = v;
        }
        if let Some(v) = lookup("PEERLINK_REACTOR__BIND_ADDR") {
            if let Ok(addr) = v.parse() {
                self.reactor.bind_addr = addr;
            }
        }
        if let Some(v) = lookup("PEERLINK_REACTOR__READ_BUFFER_SIZE") {
            if let Ok(n) = v.parse() {
                self.reactor.read_buffer_size = n;
            }
        }
        if let Some(v) = lookup("PEERLINK_CLIENT__STREAMS") {
            if let Ok(n) = v.parse() {
                self.client.streams = n;
            }
        }
        if let Some(v) = lookup("PEERLINK_CLIENT__WRITE_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.client.write_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("PEERLINK_CLIENT__COUNTER_MODULUS") {
            if let Ok(n) = v.parse() {
                self.client.counter_modulus = n;
            }
        }
    }
}
