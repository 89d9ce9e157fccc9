//! TOML-loadable configuration for the companion stack.

use anyhow::Context;
use carlink_core::link::{
    LinkConfig, DEFAULT_ADVERTISEMENT_CHARACTERISTIC, DEFAULT_ADVERTISEMENT_DATA_UUID,
    DEFAULT_ASSOCIATION_SERVICE, DEFAULT_CLIENT_WRITE_CHARACTERISTIC,
    DEFAULT_RECONNECTION_SERVICE, DEFAULT_SERVER_WRITE_CHARACTERISTIC,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::AnyResult;

/// Top-level configuration.
///
/// Everything has a default, so an empty file is a valid configuration.
/// `device_id` is generated fresh when absent; persist the configuration if
/// the identity must survive reinstalls.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CompanionConfig {
    /// Stable 128-bit identity of this phone
    pub device_id: Uuid,
    /// Name reported to the head unit by the system feature
    #[validate(length(min = 1, max = 64))]
    pub device_name: String,
    /// App name reported to the head unit; queries answer unsuccessfully
    /// when unset
    pub app_name: Option<String>,
    /// Prefix for display names derived from hex advertisement blobs
    #[validate(length(max = 16))]
    pub name_prefix: String,
    /// Service advertised by cars open for association
    pub association_service_uuid: Uuid,
    /// Fixed service advertised by associated cars
    pub reconnection_service_uuid: Uuid,
    /// Data UUID keying the reconnection advertisement blob
    pub advertisement_data_uuid: Uuid,
    /// Characteristic the phone writes to
    pub client_write_characteristic: Uuid,
    /// Characteristic the phone subscribes to
    pub server_write_characteristic: Uuid,
    /// Characteristic the reconnection blob can be read from
    pub advertisement_characteristic: Uuid,
    /// Budget in seconds for each awaited protocol step
    #[validate(range(min = 1, max = 600))]
    pub step_timeout_secs: u64,
    /// Trusted-device feature settings
    pub trusted_device: TrustedDeviceConfig,
}

/// Settings of the trusted-device feature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedDeviceConfig {
    /// Keep a log of successful unlocks. Turning this off wipes the log.
    pub unlock_history_enabled: bool,
    /// Refuse to enroll or unlock unless the phone has a passcode set
    pub passcode_required: bool,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        CompanionConfig {
            device_id: Uuid::new_v4(),
            device_name: "Phone".to_string(),
            app_name: None,
            name_prefix: "Vehicle ".to_string(),
            association_service_uuid: DEFAULT_ASSOCIATION_SERVICE,
            reconnection_service_uuid: DEFAULT_RECONNECTION_SERVICE,
            advertisement_data_uuid: DEFAULT_ADVERTISEMENT_DATA_UUID,
            client_write_characteristic: DEFAULT_CLIENT_WRITE_CHARACTERISTIC,
            server_write_characteristic: DEFAULT_SERVER_WRITE_CHARACTERISTIC,
            advertisement_characteristic: DEFAULT_ADVERTISEMENT_CHARACTERISTIC,
            step_timeout_secs: 15,
            trusted_device: TrustedDeviceConfig::default(),
        }
    }
}

impl Default for TrustedDeviceConfig {
    fn default() -> Self {
        TrustedDeviceConfig {
            unlock_history_enabled: true,
            passcode_required: true,
        }
    }
}

impl CompanionConfig {
    /// Load and validate a TOML configuration file
    pub async fn load(path: &Path) -> AnyResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Could not read config at {}", path.display()))?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML configuration text
    pub fn parse(contents: &str) -> AnyResult<Self> {
        let config: CompanionConfig =
            toml::from_str(contents).context("Could not parse the configuration")?;
        config
            .validate()
            .context("Configuration failed validation")?;
        Ok(config)
    }

    /// The slice of this configuration the protocol core needs
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            association_service: self.association_service_uuid,
            reconnection_service: self.reconnection_service_uuid,
            advertisement_data_uuid: self.advertisement_data_uuid,
            client_write_characteristic: self.client_write_characteristic,
            server_write_characteristic: self.server_write_characteristic,
            advertisement_characteristic: self.advertisement_characteristic,
            device_id: self.device_id,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = CompanionConfig::parse("").unwrap();
        assert_eq!(config.device_name, "Phone");
        assert_eq!(
            config.association_service_uuid,
            DEFAULT_ASSOCIATION_SERVICE
        );
        assert!(config.trusted_device.unlock_history_enabled);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = CompanionConfig::parse(
            r#"
            device_name = "Pixel"
            app_name = "Companion"
            step_timeout_secs = 30

            [trusted_device]
            unlock_history_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.device_name, "Pixel");
        assert_eq!(config.app_name.as_deref(), Some("Companion"));
        assert_eq!(config.link_config().step_timeout.as_secs(), 30);
        assert!(!config.trusted_device.unlock_history_enabled);
        assert!(config.trusted_device.passcode_required);
    }

    #[test]
    fn test_validation_rejects_empty_device_name() {
        assert!(CompanionConfig::parse("device_name = \"\"").is_err());
        assert!(CompanionConfig::parse("step_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_fresh_device_ids_differ() {
        let a = CompanionConfig::default();
        let b = CompanionConfig::default();
        assert_ne!(a.device_id, b.device_id);
    }
}
