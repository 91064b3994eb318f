//! Host configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{DEFAULT_PRODUCT_ID, DEVICE_NODE_PREFIX, VENDOR_ID};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::registry::DEFAULT_MAX_MINORS;
use crate::usb::IdTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// `run` publishes each minor as a socket at `<node_prefix><minor>`
    #[serde(default = "HostSettings::default_node_prefix")]
    pub node_prefix: String,
}

impl HostSettings {
    fn default_node_prefix() -> String {
        DEVICE_NODE_PREFIX.to_string()
    }
}

/// Which devices to bind, and how
///
/// # Example Configuration
/// ```toml
/// [usb]
/// vendor_id = "0x1209"
/// product_ids = ["0x0001", "0x0002"]  # empty = any product of the vendor
/// interface = 0
/// max_minors = 16
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    pub vendor_id: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub interface: u8,
    #[serde(default = "UsbSettings::default_max_minors")]
    pub max_minors: usize,
}

impl UsbSettings {
    fn default_max_minors() -> usize {
        DEFAULT_MAX_MINORS
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
                node_prefix: HostSettings::default_node_prefix(),
            },
            usb: UsbSettings {
                vendor_id: format!("0x{:04x}", VENDOR_ID),
                product_ids: vec![format!("0x{:04x}", DEFAULT_PRODUCT_ID)],
                interface: 0,
                max_minors: DEFAULT_MAX_MINORS,
            },
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/wixusb/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("wixusb").join("host.toml")
        } else {
            PathBuf::from(".config/wixusb/host.toml")
        }
    }

    /// Id table built from the `[usb]` section
    pub fn id_table(&self) -> Result<IdTable> {
        let vendor_id = parse_hex_id(&self.usb.vendor_id, "vendor_id")?;
        let product_ids = self
            .usb
            .product_ids
            .iter()
            .map(|pid| parse_hex_id(pid, "product_id"))
            .collect::<Result<Vec<_>>>()?;
        Ok(IdTable::new(vendor_id, product_ids))
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.host.node_prefix.is_empty() {
            return Err(anyhow!("node_prefix must not be empty"));
        }

        if self.usb.max_minors == 0 {
            return Err(anyhow!("max_minors must be at least 1"));
        }

        self.id_table()?;
        Ok(())
    }
}

/// Parse a `0x`-prefixed 16-bit id
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1209')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load a configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.host.node_prefix, "/dev/wixusb-dev");
        assert_eq!(config.usb.max_minors, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_id_table() {
        let ids = HostConfig::default().id_table().unwrap();
        assert!(ids.matches(0x1209, 0x0001));
        assert!(!ids.matches(0x1209, 0x0002));
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x1209", "vid").unwrap(), 0x1209);
        assert_eq!(parse_hex_id("0XABCD", "vid").unwrap(), 0xABCD);
        assert!(parse_hex_id("1209", "vid").is_err());
        assert!(parse_hex_id("0x", "vid").is_err());
        assert!(parse_hex_id("0x12345", "vid").is_err());
        assert!(parse_hex_id("0xGHIJ", "vid").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.host.log_level, parsed.host.log_level);
        assert_eq!(config.usb.product_ids, parsed.usb.product_ids);
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed: HostConfig = toml::from_str(
            r#"
            [host]
            log_level = "debug"

            [usb]
            vendor_id = "0x1209"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.host.node_prefix, "/dev/wixusb-dev");
        assert!(parsed.usb.product_ids.is_empty());
        assert_eq!(parsed.usb.interface, 0);
        assert_eq!(parsed.usb.max_minors, 16);
        assert!(parsed.id_table().unwrap().matches(0x1209, 0x7777));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HostConfig::default();
        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.usb.max_minors = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.usb.product_ids.push("bogus".to_string());
        assert!(config.validate().is_err());
    }
}
