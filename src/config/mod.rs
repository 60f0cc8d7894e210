use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bluetooth::XRP_NAME_PREFIX;
use crate::repl::ReplSettings;
use crate::serial::{DeviceFilter, BAUD_RATE, XRP_BETA_FILTER, XRP_FILTER};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Link settings, stored as JSON. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    /// USB identities accepted as an XRP, all of equal priority.
    pub device_filters: Vec<DeviceFilter>,
    /// Ports the user already picked once; auto-connect only opens these.
    pub authorized_ports: Vec<String>,
    pub repl_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub send_block_size: usize,
    pub read_chunk_size: usize,
    /// Only BLE peripherals whose name starts with this are offered.
    pub ble_name_prefix: String,
    pub ble_scan_ms: u64,
    /// How long to try re-establishing a dropped BLE link.
    pub ble_reconnect_timeout_ms: u64,
    pub log_level: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            device_filters: vec![XRP_FILTER, XRP_BETA_FILTER],
            authorized_ports: Vec::new(),
            repl_timeout_ms: 3000,
            open_timeout_ms: 2000,
            poll_interval_ms: 1000,
            send_block_size: 250,
            read_chunk_size: 256,
            ble_name_prefix: XRP_NAME_PREFIX.to_string(),
            ble_scan_ms: 3000,
            ble_reconnect_timeout_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: LinkConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::debug!("Loaded link configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".into()));
        }
        if self.device_filters.is_empty() {
            return Err(ConfigError::Invalid("at least one device filter is required".into()));
        }
        if self.send_block_size == 0 || self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("block and chunk sizes must be positive".into()));
        }
        Ok(())
    }

    pub fn repl_timeout(&self) -> Duration {
        Duration::from_millis(self.repl_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ble_scan_duration(&self) -> Duration {
        Duration::from_millis(self.ble_scan_ms)
    }

    pub fn ble_reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.ble_reconnect_timeout_ms)
    }

    pub fn repl_settings(&self) -> ReplSettings {
        ReplSettings {
            timeout: self.repl_timeout(),
            send_block_size: self.send_block_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_xrp_firmware() {
        let config = LinkConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.device_filters, vec![DeviceFilter::new(6991, 70), DeviceFilter::new(11914, 5)]);
        assert_eq!(config.repl_settings().send_block_size, 250);
        assert_eq!(config.repl_timeout(), Duration::from_secs(3));
        assert_eq!(config.ble_name_prefix, "XRP");
        assert_eq!(config.ble_reconnect_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "authorized_ports": ["/dev/ttyACM0"], "repl_timeout_ms": 500 }"#).unwrap();
        assert_eq!(config.authorized_ports, vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(config.repl_timeout(), Duration::from_millis(500));
        assert_eq!(config.baud_rate, BAUD_RATE);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = LinkConfig {
            device_filters: Vec::new(),
            ..LinkConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("xrp-link-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("link.json");
        let config = LinkConfig {
            authorized_ports: vec!["COM4".into()],
            log_level: "debug".into(),
            ..LinkConfig::default()
        };

        config.save(&path).unwrap();
        assert_eq!(LinkConfig::load(&path).unwrap(), config);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("xrp-link-missing-{}.json", uuid::Uuid::new_v4()));
        assert_eq!(LinkConfig::load_or_default(&path).unwrap(), LinkConfig::default());
        assert!(matches!(LinkConfig::load(&path), Err(ConfigError::Io(_))));
    }
}
