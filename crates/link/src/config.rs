//! Link configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub general: GeneralSettings,
    pub usb: UsbSettings,
    /// Transfer and permission timing
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns; empty means every device is visible
    #[serde(default)]
    pub filters: Vec<String>,
    /// Enumeration polling interval for attach/detach detection
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Ask for access as soon as a device attaches
    #[serde(default)]
    pub auto_request_permission: bool,
    /// Hide root hubs (vendor 0x1d6b, class 9)
    #[serde(default = "UsbSettings::default_skip_root_hubs")]
    pub skip_root_hubs: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            poll_interval_ms: Self::default_poll_interval(),
            auto_request_permission: false,
            skip_root_hubs: Self::default_skip_root_hubs(),
        }
    }
}

impl UsbSettings {
    fn default_poll_interval() -> u64 {
        500
    }

    fn default_skip_root_hubs() -> bool {
        true
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Timeout for a single bulk transfer
    #[serde(default = "TransferSettings::default_timeout")]
    pub default_timeout_ms: u64,
    /// Buffer size used when receiving without an explicit limit
    #[serde(default = "TransferSettings::default_receive_buffer")]
    pub receive_buffer_size: usize,
    /// How long a caller waits for the asynchronous grant/deny
    #[serde(default = "TransferSettings::default_permission_timeout")]
    pub permission_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout(),
            receive_buffer_size: Self::default_receive_buffer(),
            permission_timeout_ms: Self::default_permission_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_timeout() -> u64 {
        1000
    }

    fn default_receive_buffer() -> usize {
        1024
    }

    fn default_permission_timeout() -> u64 {
        30_000
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            general: GeneralSettings {
                log_level: "info".to_string(),
            },
            usb: UsbSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-link/link.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: LinkConfig = toml::from_str(&content)
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
            config_dir.join("usb-link").join("link.toml")
        } else {
            PathBuf::from(".config/usb-link/link.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }
        if self.transfer.default_timeout_ms == 0 {
            return Err(anyhow!("default_timeout_ms must be greater than 0"));
        }
        if self.transfer.receive_buffer_size == 0 {
            return Err(anyhow!("receive_buffer_size must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<LinkConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    LinkConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert!(!config.usb.auto_request_permission);
        assert!(config.usb.skip_root_hubs);
        assert_eq!(config.transfer.transfer_timeout(), Duration::from_millis(1000));
        assert_eq!(config.transfer.receive_buffer_size, 1024);
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(LinkConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(LinkConfig::validate_filter("0x1234:*").is_ok());
        assert!(LinkConfig::validate_filter("*:0x5678").is_ok());
        assert!(LinkConfig::validate_filter("*:*").is_ok());
        assert!(LinkConfig::validate_filter("0XABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(LinkConfig::validate_filter("1234:5678").is_err());
        assert!(LinkConfig::validate_filter("0x1234").is_err());
        assert!(LinkConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(LinkConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(LinkConfig::validate_filter("0x12345:0x5678").is_err());
        assert!(LinkConfig::validate_filter("0x:0x5678").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timing() {
        let mut config = LinkConfig::default();
        assert!(config.validate().is_ok());

        config.transfer.default_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.transfer.default_timeout_ms = 1000;
        config.usb.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = LinkConfig::default();
        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.general.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }
}
