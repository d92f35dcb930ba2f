use crate::mqtt::config::{BrokerConfig, SessionSettings, TopicConfig};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const USERNAME_ENV: &str = "PETFEEDER_MQTT_USERNAME";
pub const PASSWORD_ENV: &str = "PETFEEDER_MQTT_PASSWORD";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PanelConfig {
    pub broker: BrokerConfig,
    pub session: SessionSettings,
    pub topics: TopicConfig,
    pub series: SeriesConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SeriesConfig {
    pub dir: PathBuf,
    pub default_capacity: usize,
    /// Per-series overrides of `default_capacity`
    pub capacities: BTreeMap<String, usize>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            dir: get_base_dir().join("series"),
            default_capacity: 10,
            capacities: BTreeMap::new(),
        }
    }
}

impl PanelConfig {
    /// Loads `~/.config/petfeeder/panel.toml`, writing defaults first if it
    /// does not exist yet. Credentials from the environment win over the file.
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::ensure_default_config(&path).await?;
        let mut config = Self::load_from(&path).await;
        config.apply_credentials(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file: {}", e))?
        {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(&PanelConfig::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config: {}", e))?;
        info!("Default config written to {}", path.display());
        Ok(())
    }

    /// Reads `path`; an unreadable or corrupt file yields the defaults.
    pub async fn load_from(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => {
                debug!("Config loaded from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Config {} is invalid: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn apply_credentials(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(username) = lookup(USERNAME_ENV) {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.broker.password = Some(password);
        }
    }
}

pub fn config_path() -> PathBuf {
    get_base_dir().join("panel.toml")
}

fn get_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        })
        .join(".config")
        .join("petfeeder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn default_config_is_written_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("panel.toml");

        PanelConfig::ensure_default_config(&path).await.unwrap();
        assert_eq!(PanelConfig::load_from(&path).await, PanelConfig::default());

        std::fs::write(&path, "[session]\nsend_timeout_ms = 500\n").unwrap();
        PanelConfig::ensure_default_config(&path).await.unwrap();
        let config = PanelConfig::load_from(&path).await;
        assert_eq!(config.session.send_timeout_ms, 500);
        assert_eq!(config.session.reconnect_delay_ms, 3000);
        assert_eq!(config.topics, TopicConfig::default());
    }

    #[tokio::test]
    async fn corrupt_or_missing_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("panel.toml");
        assert_eq!(PanelConfig::load_from(&path).await, PanelConfig::default());

        std::fs::write(&path, "[broker\nport = ").unwrap();
        assert_eq!(PanelConfig::load_from(&path).await, PanelConfig::default());
    }

    #[test]
    fn environment_credentials_override_file() {
        let mut config: PanelConfig = toml::from_str(
            "[broker]\nhost = \"broker.local\"\nusername = \"file-user\"\npassword = \"file-pw\"\n",
        )
        .unwrap();
        config.apply_credentials(|key| match key {
            PASSWORD_ENV => Some("env-pw".to_string()),
            _ => None,
        });

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.username.as_deref(), Some("file-user"));
        assert_eq!(config.broker.password.as_deref(), Some("env-pw"));
    }

    #[tokio::test]
    async fn series_capacities_survive_a_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("panel.toml");
        std::fs::write(
            &path,
            "[series]\ndefault_capacity = 12\n\n[series.capacities]\nwaterLevel = 20\n",
        )
        .unwrap();

        let config = PanelConfig::load_from(&path).await;
        assert_eq!(config.series.default_capacity, 12);
        assert_eq!(config.series.capacities.get("waterLevel"), Some(&20));
        assert!(config.series.dir.ends_with("petfeeder/series"));

        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<PanelConfig>(&text).unwrap(), config);
    }

    #[test]
    fn defaults_match_the_device() {
        let config = PanelConfig::default();
        assert_eq!(config.series.default_capacity, 10);
        assert!(config.series.capacities.is_empty());
        assert!(config.series.dir.ends_with("petfeeder/series"));
        assert_eq!(config.session.send_timeout_ms, 3000);
        assert!(config.broker.username.is_none());
    }
}
