//! Service configuration
//!
//! Loaded in layers through figment: defaults, then an optional YAML/TOML/JSON
//! file, then `BRIDGESRV_*` environment variables (`__` separates nesting,
//! e.g. `BRIDGESRV_BUS__MQTT__HOST=broker`).

use std::collections::HashSet;
use std::path::Path;

use common::LogOptions;
use gridlink_model::{DeviceId, DeviceIdentity, DeviceType, Protocol};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::MqttConfig;
use crate::core::bridge::BridgePolicy;
use crate::core::mapping::{MappingRule, Transformation};
use crate::error::{BridgeError, Result};
use crate::runtime::reconnect::ReconnectPolicy;

pub const ENV_PREFIX: &str = "BRIDGESRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "bridgesrv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process bus, nothing leaves the service
    #[default]
    Memory,
    Mqtt,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub mqtt: MqttConfig,
}

/// One device and the protocol parameters of its adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "type")]
    pub device_type: DeviceType,
    pub protocol: Protocol,
    /// Use a simulated device instead of a real link
    #[serde(default)]
    pub mock_mode: bool,
    /// Protocol specific, deserialized by the protocol's factory
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgePolicy>,
    /// Mapping rules; the device type's defaults apply when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Vec<MappingRule>>,
}

impl DeviceConfig {
    pub fn new(id: DeviceId, device_type: DeviceType, protocol: Protocol) -> Self {
        Self {
            id,
            name: None,
            device_type,
            protocol,
            mock_mode: false,
            parameters: serde_json::Value::Null,
            reconnect: None,
            bridge: None,
            mapping: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.id, self.device_type, self.protocol)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.device_type, self.id))
    }

    /// Configured policy, or the protocol family's default
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
            .clone()
            .unwrap_or_else(|| ReconnectPolicy::for_family(self.protocol.family()))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(policy) = &self.reconnect {
            policy
                .validate()
                .map_err(|e| BridgeError::config(format!("Device {}: {e}", self.id)))?;
        }
        for rule in self.mapping.iter().flatten() {
            if rule.source_field.trim().is_empty() || rule.target_field.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "Device {}: mapping rule with empty field name",
                    self.id
                )));
            }
            if let Transformation::Scale { factor, offset } = rule.transformation {
                if !factor.is_finite() || !offset.is_finite() {
                    return Err(BridgeError::config(format!(
                        "Device {}: non-finite scale on {}",
                        self.id, rule.source_field
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub logging: LogOptions,
    pub bus: BusConfig,
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Load and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = common::load_layered(path, ENV_PREFIX)?;
        config.validate()?;
        debug!("Configuration loaded: {} devices", config.devices.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(BridgeError::config("service.name is empty"));
        }
        if self.bus.kind == BusKind::Mqtt && self.bus.mqtt.host.trim().is_empty() {
            return Err(BridgeError::config("bus.mqtt.host is empty"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(BridgeError::config(format!(
                    "Duplicate device id {}",
                    device.id
                )));
            }
            device.validate()?;
        }
        Ok(())
    }

    /// Example configuration printed by `--print-default-config`
    pub fn example() -> Self {
        let mut battery = DeviceConfig::new(1, DeviceType::Battery, Protocol::Modbus);
        battery.name = Some("battery-1".to_string());
        battery.mock_mode = true;
        battery.parameters = serde_json::json!({
            "host": "192.168.1.50",
            "port": 502,
            "unit_id": 1,
            "scan_interval_ms": 1000,
            "registers": [
                {"name": "state_of_charge", "address": 0, "data_type": "uint16"},
                {"name": "power_watts", "address": 2, "data_type": "float32", "byte_order": "CDAB"},
                {"name": "temp_celsius", "address": 4, "data_type": "int16", "scale": 0.1}
            ]
        });

        let mut charger = DeviceConfig::new(2, DeviceType::EvCharger, Protocol::Ocpp);
        charger.mock_mode = true;
        charger.parameters = serde_json::json!({"charge_point_id": "CP001", "connectors": 2});

        let mut heat_pump = DeviceConfig::new(3, DeviceType::HeatPump, Protocol::Eebus);
        heat_pump.mock_mode = true;

        Self {
            devices: vec![battery, charger, heat_pump],
            ..Self::default()
        }
    }
}
