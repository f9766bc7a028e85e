//! Bridge configuration.
//!
//! Read from a YAML file (`ERD_BRIDGE_CONFIG`, default `erd-bridge.yaml`).
//! A missing file means all defaults. A few settings can be overridden from
//! the environment:
//!
//!   ERD_BRIDGE_MQTT_HOST, ERD_BRIDGE_MQTT_PORT, ERD_BRIDGE_DEVICE_ID

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bridge::BridgeSettings;
use crate::erd::{BROADCAST_ADDRESS, DEFAULT_CLIENT_ADDRESS};
use crate::erd_client::SimulatedApplianceConfig;
use crate::error::BridgeError;
use crate::mqtt::MqttConfig;

pub const CONFIG_PATH_ENV: &str = "ERD_BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "erd-bridge.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Used in MQTT topics
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// The bridge's own address on the appliance bus
    #[serde(default = "default_client_address")]
    pub client_address: u8,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    /// YAML catalog replacing the built-in one
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub appliance: SimulatedApplianceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_device_id() -> String {
    "appliance".to_string()
}

fn default_client_address() -> u8 {
    DEFAULT_CLIENT_ADDRESS
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("erd-bridge.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            client_address: default_client_address(),
            mqtt: MqttConfig::default(),
            bridge: BridgeSettings::default(),
            storage: StorageConfig::default(),
            catalog_path: None,
            appliance: SimulatedApplianceConfig::default(),
        }
    }
}

impl Config {
    /// Load from the path named by `ERD_BRIDGE_CONFIG`, then apply env overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), BridgeError> {
        if let Some(host) = lookup("ERD_BRIDGE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("ERD_BRIDGE_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid ERD_BRIDGE_MQTT_PORT: {}", port)))?;
        }
        if let Some(device_id) = lookup("ERD_BRIDGE_DEVICE_ID") {
            self.device_id = device_id;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.device_id.is_empty() || self.device_id.contains(['/', '+', '#']) {
            return Err(BridgeError::Config(format!(
                "device_id {:?} is not usable in an MQTT topic",
                self.device_id
            )));
        }
        if self.client_address == BROADCAST_ADDRESS || self.client_address == self.appliance.address {
            return Err(BridgeError::Config(format!(
                "client_address 0x{:02X} collides with the broadcast or appliance address",
                self.client_address
            )));
        }
        if self.bridge.retry_delay_ms == 0 {
            return Err(BridgeError::Config("bridge.retry_delay_ms must be non-zero".into()));
        }
        if self.bridge.appliance_lost_timeout_ms <= self.bridge.retry_delay_ms {
            return Err(BridgeError::Config(
                "bridge.appliance_lost_timeout_ms must be longer than bridge.retry_delay_ms".into(),
            ));
        }
        if self.bridge.polling_list_capacity == 0 {
            return Err(BridgeError::Config("bridge.polling_list_capacity must be non-zero".into()));
        }
        Ok(())
    }
}
