//! Bus topic builders
//!
//! Canonical topics live under `devices/{id}/...`; narrower type-specific topics
//! live under the device type's prefix (see [`DeviceType::topic_prefix`]).

use crate::device::{DeviceId, DeviceType};

/// Subscription filter matching command requests for every device
pub const COMMAND_REQUEST_FILTER: &str = "devices/+/commands/request";

pub fn telemetry(id: DeviceId) -> String {
    format!("devices/{}/telemetry", id)
}

pub fn status(id: DeviceId) -> String {
    format!("devices/{}/status", id)
}

pub fn command_request(id: DeviceId) -> String {
    format!("devices/{}/commands/request", id)
}

pub fn command_response(id: DeviceId) -> String {
    format!("devices/{}/commands/response", id)
}

/// Type-specific status topic, e.g. `battery/7/status`
pub fn type_status(device_type: DeviceType, id: DeviceId) -> Option<String> {
    device_type
        .topic_prefix()
        .map(|prefix| format!("{}/{}/status", prefix, id))
}

pub fn battery_soc(id: DeviceId) -> String {
    format!("battery/{}/soc", id)
}

pub fn battery_power(id: DeviceId) -> String {
    format!("battery/{}/power", id)
}

pub fn meter_reading(id: DeviceId) -> String {
    format!("meter/{}/reading", id)
}

pub fn meter_power(id: DeviceId) -> String {
    format!("meter/{}/power", id)
}

pub fn heatpump_temperature(id: DeviceId) -> String {
    format!("heatpump/{}/temperature", id)
}

pub fn solar_production(id: DeviceId) -> String {
    format!("solar/{}/production", id)
}

pub fn evcharger_session(id: DeviceId, connector_id: u32) -> String {
    format!("evcharger/{}/connector/{}/session", id, connector_id)
}

/// Extract the device id from a `devices/{id}/commands/request` topic
pub fn parse_command_request(topic: &str) -> Option<DeviceId> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("devices"), Some(id), Some("commands"), Some("request"), None) => id.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_canonical_topics() {
        assert_eq!(telemetry(5), "devices/5/telemetry");
        assert_eq!(status(5), "devices/5/status");
        assert_eq!(command_request(5), "devices/5/commands/request");
        assert_eq!(command_response(5), "devices/5/commands/response");
    }

    #[test]
    fn test_type_specific_topics() {
        assert_eq!(battery_soc(1), "battery/1/soc");
        assert_eq!(meter_reading(2), "meter/2/reading");
        assert_eq!(heatpump_temperature(3), "heatpump/3/temperature");
        assert_eq!(solar_production(4), "solar/4/production");
        assert_eq!(evcharger_session(9, 2), "evcharger/9/connector/2/session");
        assert_eq!(
            type_status(DeviceType::Battery, 1).as_deref(),
            Some("battery/1/status")
        );
        assert_eq!(type_status(DeviceType::LoadController, 1), None);
    }

    #[test]
    fn test_parse_command_request() {
        assert_eq!(parse_command_request("devices/42/commands/request"), Some(42));
        assert_eq!(parse_command_request("devices/42/commands/response"), None);
        assert_eq!(parse_command_request("devices/x/commands/request"), None);
        assert_eq!(parse_command_request("devices/42/commands/request/extra"), None);
    }
}
