//! Canonical bus envelope
//!
//! Every message on the bus shares the envelope
//! `{messageType, timestamp, deviceId, ...body, qos}`. The retain flag travels
//! with the message as a publish option and is not part of the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::{DeviceId, DeviceIdentity, DeviceStatus, DeviceType, Protocol};
use crate::error::ModelError;
use crate::reading::FieldValue;

/// Delivery guarantee of a published message
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    /// Fire and forget, for high-frequency non-critical samples
    AtMostOnce,
    /// Default for commands and status
    #[default]
    AtLeastOnce,
    /// Safety or financially relevant values
    ExactlyOnce,
}

impl QoS {
    pub fn level(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl From<QoS> for u8 {
    fn from(q: QoS) -> u8 {
        q.level()
    }
}

impl TryFrom<u8> for QoS {
    type Error = ModelError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ModelError::InvalidQos(other)),
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Telemetry,
    Status,
    CommandRequest,
    CommandResponse,
}

/// Telemetry metadata: where the readings came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMetadata {
    pub source: Protocol,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBody {
    pub readings: BTreeMap<String, FieldValue>,
    pub metadata: TelemetryMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Canonical command as received on `devices/{id}/commands/request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            command_id: None,
            command: command.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Type-specific part of the envelope
///
/// Variants are distinguished by their required fields, so the order below is
/// the order deserialization tries them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Telemetry(TelemetryBody),
    Status(StatusBody),
    CommandResponse(CommandResponseBody),
    CommandRequest(CommandRequest),
    /// Single-field republish on a type-specific topic
    Signal(BTreeMap<String, serde_json::Value>),
}

/// Message handed to the bus; ownership passes to the bus on publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub qos: QoS,
    #[serde(skip)]
    pub retain: bool,
}

impl CanonicalMessage {
    pub fn telemetry(
        identity: &DeviceIdentity,
        readings: BTreeMap<String, FieldValue>,
        timestamp: DateTime<Utc>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            message_type: MessageType::Telemetry,
            timestamp,
            device_id: identity.device_id,
            body: MessageBody::Telemetry(TelemetryBody {
                readings,
                metadata: TelemetryMetadata {
                    source: identity.protocol,
                    device_type: identity.device_type,
                },
            }),
            qos,
            retain,
        }
    }

    pub fn status(
        device_id: DeviceId,
        status: DeviceStatus,
        details: Option<serde_json::Value>,
        qos: QoS,
    ) -> Self {
        Self {
            message_type: MessageType::Status,
            timestamp: Utc::now(),
            device_id,
            body: MessageBody::Status(StatusBody { status, details }),
            qos,
            retain: true,
        }
    }

    pub fn command_response(device_id: DeviceId, body: CommandResponseBody, qos: QoS) -> Self {
        Self {
            message_type: MessageType::CommandResponse,
            timestamp: Utc::now(),
            device_id,
            body: MessageBody::CommandResponse(body),
            qos,
            retain: false,
        }
    }

    pub fn command_request(device_id: DeviceId, request: CommandRequest) -> Self {
        Self {
            message_type: MessageType::CommandRequest,
            timestamp: Utc::now(),
            device_id,
            body: MessageBody::CommandRequest(request),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    /// Telemetry message carrying exactly one field, for type-specific topics
    pub fn signal(
        device_id: DeviceId,
        field: &str,
        value: serde_json::Value,
        timestamp: DateTime<Utc>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value);
        Self {
            message_type: MessageType::Telemetry,
            timestamp,
            device_id,
            body: MessageBody::Signal(fields),
            qos,
            retain,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn battery() -> DeviceIdentity {
        DeviceIdentity::new(12, DeviceType::Battery, Protocol::Modbus)
    }

    #[test]
    fn test_qos_serializes_as_level() {
        assert_eq!(serde_json::to_string(&QoS::ExactlyOnce).unwrap(), "2");
        assert_eq!(serde_json::from_str::<QoS>("0").unwrap(), QoS::AtMostOnce);
        assert!(serde_json::from_str::<QoS>("3").is_err());
    }

    #[test]
    fn test_telemetry_envelope_shape() {
        let mut readings = BTreeMap::new();
        readings.insert("soc".to_string(), FieldValue::Number(85.0));
        let msg =
            CanonicalMessage::telemetry(&battery(), readings, Utc::now(), QoS::AtLeastOnce, true);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["messageType"], "telemetry");
        assert_eq!(value["deviceId"], 12);
        assert_eq!(value["qos"], 1);
        assert_eq!(value["readings"]["soc"], 85.0);
        assert_eq!(value["metadata"]["source"], "modbus");
        assert_eq!(value["metadata"]["deviceType"], "battery");
        assert!(value.get("retain").is_none());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_status_envelope_round_trip() {
        let msg = CanonicalMessage::status(
            3,
            DeviceStatus::Error,
            Some(serde_json::json!({"reason": "max_attempts_exceeded"})),
            QoS::AtLeastOnce,
        );
        assert!(msg.retain);
        let bytes = msg.to_json().unwrap();
        let parsed: CanonicalMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.message_type, MessageType::Status);
        match parsed.body {
            MessageBody::Status(body) => {
                assert_eq!(body.status, DeviceStatus::Error);
                assert_eq!(body.details.unwrap()["reason"], "max_attempts_exceeded");
            },
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_command_request_defaults() {
        let req: CommandRequest = serde_json::from_str(r#"{"command": "read"}"#).unwrap();
        assert_eq!(req.command, "read");
        assert!(req.command_id.is_none());
        assert!(req.params.is_null());
    }

    #[test]
    fn test_command_response_omits_empty_fields() {
        let body = CommandResponseBody {
            command_id: Some("c-1".into()),
            command: "set_target_temperature".into(),
            success: false,
            result: None,
            error: Some("out of range".into()),
        };
        let value =
            serde_json::to_value(CanonicalMessage::command_response(4, body, QoS::AtLeastOnce))
                .unwrap();
        assert_eq!(value["messageType"], "command_response");
        assert_eq!(value["commandId"], "c-1");
        assert_eq!(value["success"], false);
        assert!(value.get("result").is_none());
    }
}
