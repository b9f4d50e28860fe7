//! Device identity and classification
//!
//! Device types and protocols are closed enums so topic and rule selection is an
//! exhaustive match instead of a string comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Numeric device identifier used in topics and envelopes
pub type DeviceId = u32;

/// Kind of energy asset behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    SolarInverter,
    Battery,
    EvCharger,
    HeatPump,
    Meter,
    LoadController,
}

impl DeviceType {
    pub const ALL: [DeviceType; 6] = [
        DeviceType::SolarInverter,
        DeviceType::Battery,
        DeviceType::EvCharger,
        DeviceType::HeatPump,
        DeviceType::Meter,
        DeviceType::LoadController,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SolarInverter => "solar_inverter",
            Self::Battery => "battery",
            Self::EvCharger => "ev_charger",
            Self::HeatPump => "heat_pump",
            Self::Meter => "meter",
            Self::LoadController => "load_controller",
        }
    }

    /// Root segment of the type-specific topics, if this type has any
    pub fn topic_prefix(&self) -> Option<&'static str> {
        match self {
            Self::SolarInverter => Some("solar"),
            Self::Battery => Some("battery"),
            Self::EvCharger => Some("evcharger"),
            Self::HeatPump => Some("heatpump"),
            Self::Meter => Some("meter"),
            Self::LoadController => None,
        }
    }

    /// Whether a late subscriber needs the last known value of this device type
    pub fn retains_last_value(&self) -> bool {
        match self {
            Self::Battery | Self::Meter | Self::SolarInverter => true,
            Self::EvCharger | Self::HeatPump | Self::LoadController => false,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ModelError::UnknownDeviceType(s.to_string()))
    }
}

/// Field protocol spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Ocpp,
    Eebus,
    Tcpip,
    Sunspec,
}

/// Adapter family a protocol is served by
///
/// SunSpec is a register model on top of Modbus and shares its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Modbus,
    Ocpp,
    Eebus,
    Tcpip,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modbus => "modbus",
            Self::Ocpp => "ocpp",
            Self::Eebus => "eebus",
            Self::Tcpip => "tcpip",
            Self::Sunspec => "sunspec",
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        match self {
            Self::Modbus | Self::Sunspec => ProtocolFamily::Modbus,
            Self::Ocpp => ProtocolFamily::Ocpp,
            Self::Eebus => ProtocolFamily::Eebus,
            Self::Tcpip => ProtocolFamily::Tcpip,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ModelError;

    /// Accepts common aliases such as `modbus_tcp` or `tcp`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', '-', '/'], "");
        match normalized.as_str() {
            "modbus" | "modbustcp" => Ok(Self::Modbus),
            "ocpp" | "ocpp16" | "ocppj" => Ok(Self::Ocpp),
            "eebus" | "ship" => Ok(Self::Eebus),
            "tcpip" | "tcp" => Ok(Self::Tcpip),
            "sunspec" => Ok(Self::Sunspec),
            _ => Err(ModelError::UnknownProtocol(s.to_string())),
        }
    }
}

impl ProtocolFamily {
    pub const ALL: [ProtocolFamily; 4] = [Self::Modbus, Self::Ocpp, Self::Eebus, Self::Tcpip];
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Modbus => "modbus",
            Self::Ocpp => "ocpp",
            Self::Eebus => "eebus",
            Self::Tcpip => "tcpip",
        };
        f.write_str(name)
    }
}

/// Immutable identity of one device for the lifetime of its adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub protocol: Protocol,
}

impl DeviceIdentity {
    pub fn new(device_id: DeviceId, device_type: DeviceType, protocol: Protocol) -> Self {
        Self {
            device_id,
            device_type,
            protocol,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dev{} ({}, {})",
            self.device_id, self.device_type, self.protocol
        )
    }
}

/// Device status carried in status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Standby,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Standby => "standby",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trip_names() {
        for t in DeviceType::ALL {
            assert_eq!(t.as_str().parse::<DeviceType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_topic_prefixes() {
        assert_eq!(DeviceType::Battery.topic_prefix(), Some("battery"));
        assert_eq!(DeviceType::EvCharger.topic_prefix(), Some("evcharger"));
        assert_eq!(DeviceType::HeatPump.topic_prefix(), Some("heatpump"));
        assert_eq!(DeviceType::SolarInverter.topic_prefix(), Some("solar"));
        assert_eq!(DeviceType::LoadController.topic_prefix(), None);
    }

    #[test]
    fn test_retention_defaults() {
        assert!(DeviceType::Battery.retains_last_value());
        assert!(DeviceType::Meter.retains_last_value());
        assert!(DeviceType::SolarInverter.retains_last_value());
        assert!(!DeviceType::EvCharger.retains_last_value());
        assert!(!DeviceType::HeatPump.retains_last_value());
    }

    #[test]
    fn test_protocol_aliases_and_family() {
        assert_eq!("modbus_tcp".parse::<Protocol>().unwrap(), Protocol::Modbus);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcpip);
        assert_eq!("sunspec".parse::<Protocol>().unwrap(), Protocol::Sunspec);
        assert_eq!(Protocol::Sunspec.family(), ProtocolFamily::Modbus);
        assert_eq!(Protocol::Ocpp.family(), ProtocolFamily::Ocpp);
        assert!("bacnet".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_identity_serde() {
        let identity = DeviceIdentity::new(7, DeviceType::HeatPump, Protocol::Eebus);
        let value = serde_json::to_value(identity).unwrap();
        assert_eq!(value["deviceId"], 7);
        assert_eq!(value["deviceType"], "heat_pump");
        assert_eq!(value["protocol"], "eebus");
    }
}
