//! Registry configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorError, DescriptorTable, DeviceDescriptor};

/// Configuration for a session registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Timeout of a single interrupt transfer.
    pub answer_timeout_ms: u64,
    /// Overall timeout when waiting for a terminated answer.
    pub receive_timeout_ms: u64,
    /// Attempts per chunk before a write fails.
    pub write_attempts: u32,
    /// Attempts per packet when a read transfer errors.
    pub read_attempts: u32,
    /// USB configuration value selected on open.
    pub configuration: u8,
    /// Upper bound on packets discarded by a purge.
    pub purge_packet_limit: usize,
    /// Devices in addition to the built-in table.
    pub extra_devices: Vec<DeviceDescriptor>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 20,
            receive_timeout_ms: 2000,
            write_attempts: 3,
            read_attempts: 1,
            configuration: 1,
            purge_packet_limit: 64,
            extra_devices: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RegistryConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Built-in descriptors plus `extra_devices`.
    pub fn descriptor_table(&self) -> Result<DescriptorTable, DescriptorError> {
        DescriptorTable::with_extra(&self.extra_devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.answer_timeout(), Duration::from_millis(20));
        assert_eq!(config.write_attempts, 3);
        assert_eq!(config.read_attempts, 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RegistryConfig = toml::from_str(
            r#"
            answer_timeout_ms = 50

            [[extra_devices]]
            name = "Test-0"
            vendor_id = 0x1111
            product_id = 0x2222
            interface = 1
            input_endpoint = 0x81
            output_endpoint = 0x01
            max_packet_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.answer_timeout_ms, 50);
        assert_eq!(config.receive_timeout_ms, 2000);
        let table = config.descriptor_table().unwrap();
        assert_eq!(table.find("Test-0").unwrap().vendor_id, 0x1111);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RegistryConfig {
            write_attempts: 5,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: RegistryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
