//! Configuration system for vicinity.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VICINITY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vicinity/config.toml
//!   3. ~/.config/vicinity/config.toml

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VicinityConfig {
    pub lbn: LbnConfig,
    pub network: NetworkConfig,
    pub identity: IdentityConfig,
    pub neighborhood: NeighborhoodConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LbnConfig {
    /// TCP endpoint of the LBN node's local-service interface.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IPv4 or IPv6 address this server announces to the LBN.
    pub server_interface: IpAddr,
    /// TCP port of the primary role interface.
    pub primary_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborhoodConfig {
    /// Hard cap on the number of neighbors this server tracks.
    pub max_size: usize,
    /// Byte length of node identifiers. SHA-256, so 32.
    pub identifier_length: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for VicinityConfig {
    fn default() -> Self {
        Self {
            lbn: LbnConfig::default(),
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            neighborhood: NeighborhoodConfig::default(),
        }
    }
}

impl Default for LbnConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:16982".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_interface: IpAddr::from([0, 0, 0, 0]),
            primary_port: 16987,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NeighborhoodConfig {
    fn default() -> Self {
        Self {
            max_size: 110,
            identifier_length: 32,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vicinity")
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

impl VicinityConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            VicinityConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VICINITY_CONFIG")
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
            let text = toml::to_string_pretty(&VicinityConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VICINITY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VICINITY_LBN__ENDPOINT") {
            self.lbn.endpoint = v;
        }
        if let Ok(v) = std::env::var("VICINITY_NETWORK__SERVER_INTERFACE") {
            if let Ok(addr) = v.parse() {
                self.network.server_interface = addr;
            }
        }
        if let Ok(v) = std::env::var("VICINITY_NETWORK__PRIMARY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.primary_port = p;
            }
        }
        if let Ok(v) = std::env::var("VICINITY_NEIGHBORHOOD__MAX_SIZE") {
            if let Ok(n) = v.parse() {
                self.neighborhood.max_size = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = VicinityConfig::default();
        assert_eq!(config.lbn.endpoint, "127.0.0.1:16982");
        assert_eq!(config.network.primary_port, 16987);
        assert_eq!(config.neighborhood.max_size, 110);
        assert_eq!(config.neighborhood.identifier_length, 32);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = VicinityConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: VicinityConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.lbn.endpoint, config.lbn.endpoint);
        assert_eq!(back.neighborhood.max_size, config.neighborhood.max_size);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: VicinityConfig =
            toml::from_str("[neighborhood]\nmax_size = 4\n").unwrap();
        assert_eq!(config.neighborhood.max_size, 4);
        assert_eq!(config.neighborhood.identifier_length, 32);
        assert_eq!(config.network.primary_port, 16987);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir()
            .join(format!("vicinity-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        std::env::set_var("VICINITY_CONFIG", config_path.to_str().unwrap());

        let path = VicinityConfig::write_default_if_missing().expect("write failed");
        assert!(path.exists());

        let config = VicinityConfig::load().expect("load should succeed");
        assert_eq!(config.neighborhood.max_size, 110);

        std::env::remove_var("VICINITY_CONFIG");
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
