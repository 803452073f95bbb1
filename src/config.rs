//! Relay configuration file
//!
//! All broker addresses, topics, credentials and paths live in one TOML file so
//! nothing environment-specific is compiled in. A missing file falls back to the
//! defaults below; a malformed one is an error.

use crate::agent::AgentConfig;
use crate::mqtt::config::MqttConfig;
use crate::publisher::PublisherConfig;
use crate::web::RatesConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "mqtt-relay";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Refusing to overwrite existing configuration at {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub mqtt: MqttConfig,
    pub publisher: PublisherConfig,
    pub rates: RatesConfig,
    pub agent: AgentConfig,
}

impl RelayConfig {
    /// `<config dir>/mqtt-relay/config.toml`, or the working directory when the
    /// platform has no config dir
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            warn!(
                "No configuration at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Writes the defaults to `path`, creating parent directories
    pub async fn write_default(path: &Path, force: bool) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if !force && tokio::fs::try_exists(path).await.map_err(write_err)? {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let text = toml::to_string_pretty(&Self::default())?;
        tokio::fs::write(path, text).await.map_err(write_err)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [mqtt]
            host = "192.168.8.16"
            fallback_hosts = []

            [agent.ssh]
            host = "192.168.8.16"
            user = "operator"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.host, "192.168.8.16");
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.mqtt.fallback_hosts.is_empty());
        assert_eq!(config.agent.ssh.user, "operator");
        assert_eq!(config.agent.command_topic, "expo/test");
        assert_eq!(config.rates, RatesConfig::default());
    }

    #[tokio::test]
    async fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_or_default(&dir.path().join("none.toml"))
            .await
            .unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[tokio::test]
    async fn written_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        RelayConfig::write_default(&path, false).await.unwrap();
        assert_eq!(
            RelayConfig::load_or_default(&path).await.unwrap(),
            RelayConfig::default()
        );
        assert!(matches!(
            RelayConfig::write_default(&path, false).await,
            Err(ConfigError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[mqtt]\nport = \"not a number\"\n")
            .await
            .unwrap();
        assert!(matches!(
            RelayConfig::load_or_default(&path).await,
            Err(ConfigError::Parse { .. })
        ));
    }
}
