//! Configuration system for MoreChunks.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MORECHUNKS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/morechunks/config.toml
//!   3. ~/.config/morechunks/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoreChunksConfig {
    pub network: NetworkConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the chunk protocol listens on.
    pub listen_addr: String,
    /// Local HTTP status port. 0 = disabled.
    pub status_port: u16,
    /// Largest single message accepted from a client, in bytes.
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on chunks sent per second to any one client.
    pub max_chunks_per_second: u32,
    /// Accepted `mod.version` values. Absent = any version is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_versions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the disk backend.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:44444";
pub const DEFAULT_STATUS_PORT: u16 = 44445;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS_PER_SECOND: u32 = 80;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            status_port: DEFAULT_STATUS_PORT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_second: DEFAULT_MAX_CHUNKS_PER_SECOND,
            allowed_versions: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Disk,
            path: data_dir().join("chunks"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("morechunks")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("morechunks")
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

impl MoreChunksConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse the file at `path`, or defaults if it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MORECHUNKS_CONFIG")
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
            let text = toml::to_string_pretty(&Self::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MORECHUNKS_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MORECHUNKS_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("MORECHUNKS_NETWORK__STATUS_PORT") {
            if let Ok(p) = v.parse() {
                self.network.status_port = p;
            }
        }
        if let Some(v) = lookup("MORECHUNKS_LIMITS__MAX_CHUNKS_PER_SECOND") {
            if let Ok(r) = v.parse() {
                self.limits.max_chunks_per_second = r;
            }
        }
        if let Some(v) = lookup("MORECHUNKS_LIMITS__ALLOWED_VERSIONS") {
            let versions: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            self.limits.allowed_versions = if versions.is_empty() {
                None
            } else {
                Some(versions)
            };
        }
        if let Some(v) = lookup("MORECHUNKS_STORAGE__BACKEND") {
            match v.as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "disk" => self.storage.backend = StorageBackend::Disk,
                _ => {}
            }
        }
        if let Some(v) = lookup("MORECHUNKS_STORAGE__PATH") {
            self.storage.path = PathBuf::from(v);
        }
    }
}
