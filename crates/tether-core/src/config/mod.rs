//! Configuration management for Tether.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/tether/config.toml` |
//! | macOS | `~/Library/Application Support/Tether/config.toml` |
//! | Windows | `%APPDATA%\Tether\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("ADB port: {}", config.link.adb_port);
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bytes of payload headroom above one chunk (path and offsets of a write).
const PAYLOAD_HEADROOM: usize = 64 * 1024;

/// Main configuration struct for Tether.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport settings
    pub link: LinkConfig,
    /// Wire protocol settings
    pub protocol: ProtocolConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// Transport configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local port the host-side tunnel forwards
    pub adb_port: u16,
    /// Loopback address of the simulation host
    pub simulation_addr: SocketAddr,
    /// Allow falling back to the simulation transport
    pub simulation_enabled: bool,
    /// Time allowed for one transport open
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            adb_port: crate::DEFAULT_HOST_PORT,
            simulation_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, crate::DEFAULT_HOST_PORT)),
            simulation_enabled: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Wire protocol configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest payload accepted or produced in one frame
    pub max_payload_size: usize,
    /// Timeout applied to control requests
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Requests allowed in flight at once
    pub max_in_flight: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024 + PAYLOAD_HEADROOM,
            default_timeout: Duration::from_secs(5),
            max_in_flight: 256,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for transfers
    pub chunk_size: usize,
    /// Transfers running at the same time
    pub max_concurrent: usize,
    /// Time allowed for one chunk acknowledgment
    #[serde(with = "humantime_serde")]
    pub chunk_timeout: Duration,
    /// Persist the task list so it survives a restart
    pub persist_tasks: bool,
    /// Override for the task store directory
    pub state_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            max_concurrent: crate::DEFAULT_MAX_CONCURRENT_TRANSFERS,
            chunk_timeout: Duration::from_secs(15),
            persist_tasks: true,
            state_dir: None,
        }
    }
}

impl TransferConfig {
    /// Directory holding the persisted task list.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "tether", "Tether").map_or_else(
                || PathBuf::from(".tether"),
                |dirs| dirs.data_dir().to_path_buf(),
            )
        })
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(&path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))
    }

    /// Check values that would make the core misbehave.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be greater than zero"));
        }
        if self.transfer.max_concurrent == 0 {
            return Err(invalid("transfer.max_concurrent", "must be greater than zero"));
        }
        if self.protocol.max_in_flight == 0 {
            return Err(invalid("protocol.max_in_flight", "must be greater than zero"));
        }
        if self.protocol.max_payload_size < self.transfer.chunk_size + PAYLOAD_HEADROOM {
            return Err(invalid(
                "protocol.max_payload_size",
                "must hold one chunk plus 64 KiB of request headroom",
            ));
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tether", "Tether")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
