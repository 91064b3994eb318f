//! Client configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{DEVICE_NODE_PREFIX, NODE_CANDIDATES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
    /// Device nodes are `<node_prefix><index>`
    #[serde(default = "ClientSettings::default_node_prefix")]
    pub node_prefix: String,
    /// Node indices tried by connect, starting at 0
    #[serde(default = "ClientSettings::default_candidates")]
    pub candidates: u32,
}

impl ClientSettings {
    fn default_node_prefix() -> String {
        DEVICE_NODE_PREFIX.to_string()
    }

    fn default_candidates() -> u32 {
        NODE_CANDIDATES
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                log_level: "info".to_string(),
                node_prefix: ClientSettings::default_node_prefix(),
                candidates: ClientSettings::default_candidates(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/wixusb/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // logging is not up yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("wixusb").join("client.toml")
        } else {
            PathBuf::from(".config/wixusb/client.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.client.node_prefix.is_empty() {
            return Err(anyhow!("node_prefix must not be empty"));
        }

        if self.client.candidates == 0 {
            return Err(anyhow!("candidates must be at least 1"));
        }

        Ok(())
    }
}

/// Load a configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "info");
        assert_eq!(config.client.node_prefix, "/dev/wixusb-dev");
        assert_eq!(config.client.candidates, 10);
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.client.log_level, parsed.client.log_level);
        assert_eq!(config.client.candidates, parsed.client.candidates);
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.client.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.client.log_level = "debug".to_string();
        config.client.candidates = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client.toml");

        let mut config = ClientConfig::default();
        config.client.candidates = 3;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.candidates, 3);
    }
}
