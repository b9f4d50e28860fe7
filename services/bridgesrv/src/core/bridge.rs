//! Protocol bridge
//!
//! Converts native readings and events of one device into canonical messages
//! and publishes them. Besides the canonical topics
//! (`devices/{id}/telemetry|status|commands/response`) a bridge republishes
//! selected mapped fields on type-specific topics:
//!
//! | device type    | field        | topic                          | QoS | retain |
//! |----------------|--------------|--------------------------------|-----|--------|
//! | battery        | soc          | battery/{id}/soc               | 2   | yes    |
//! | battery        | power        | battery/{id}/power             | 0   | no     |
//! | meter          | energy       | meter/{id}/reading             | 1   | yes    |
//! | meter          | power        | meter/{id}/power               | 0   | no     |
//! | heat pump      | temperature  | heatpump/{id}/temperature      | 1   | no     |
//! | solar inverter | production   | solar/{id}/production          | 1   | yes    |
//!
//! EV charging sessions go to `evcharger/{id}/connector/{n}/session` through
//! [`ProtocolBridge::bridge_session`] (QoS 2, not retained).

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use gridlink_model::{
    topics, CanonicalMessage, CommandResponseBody, DeviceIdentity, DeviceStatus, DeviceType,
    FieldValue, QoS, Reading,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{MessageBus, PublishOptions};
use crate::core::mapping::MappingEngine;
use crate::error::Result;

/// Per-device publish policy for canonical telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgePolicy {
    pub qos: QoS,
    /// Defaults to the device type's retain-last-value rule
    pub retain: Option<bool>,
}

struct SecondarySignal {
    topic: String,
    field: &'static str,
    qos: QoS,
    retain: bool,
}

pub struct ProtocolBridge {
    identity: DeviceIdentity,
    bus: Arc<dyn MessageBus>,
    mapping: MappingEngine,
    qos: QoS,
    retain: bool,
}

impl ProtocolBridge {
    pub fn new(
        identity: DeviceIdentity,
        bus: Arc<dyn MessageBus>,
        mapping: MappingEngine,
        policy: BridgePolicy,
    ) -> Self {
        let retain = policy
            .retain
            .unwrap_or_else(|| identity.device_type.retains_last_value());
        Self {
            identity,
            bus,
            mapping,
            qos: policy.qos,
            retain,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn mapping(&self) -> &MappingEngine {
        &self.mapping
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    async fn publish(&self, topic: &str, message: &CanonicalMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.bus
            .publish(
                topic,
                Bytes::from(payload),
                PublishOptions::new(message.qos, message.retain),
            )
            .await
    }

    /// Map and publish one native reading
    ///
    /// Returns the mapped field set.
    pub async fn bridge_telemetry(&self, reading: &Reading) -> Result<BTreeMap<String, FieldValue>> {
        let mapped = self.mapping.apply(reading);
        let message = CanonicalMessage::telemetry(
            &self.identity,
            mapped.clone(),
            reading.timestamp,
            self.qos,
            self.retain,
        );
        self.publish(&topics::telemetry(self.identity.device_id), &message)
            .await?;

        for signal in self.secondary_signals() {
            let Some(value) = mapped.get(signal.field) else {
                continue;
            };
            let message = CanonicalMessage::signal(
                self.identity.device_id,
                signal.field,
                serde_json::to_value(value)?,
                reading.timestamp,
                signal.qos,
                signal.retain,
            );
            if let Err(e) = self.publish(&signal.topic, &message).await {
                // the canonical message already went out
                warn!("{} signal {} not published: {}", self.identity, signal.topic, e);
            }
        }

        debug!("{} telemetry bridged ({} fields)", self.identity, mapped.len());
        Ok(mapped)
    }

    /// Publish a retained status message, mirrored on the type status topic
    pub async fn bridge_status(
        &self,
        status: DeviceStatus,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        let message = CanonicalMessage::status(
            self.identity.device_id,
            status,
            details,
            QoS::AtLeastOnce,
        );
        self.publish(&topics::status(self.identity.device_id), &message)
            .await?;

        if let Some(topic) = topics::type_status(self.identity.device_type, self.identity.device_id)
        {
            self.publish(&topic, &message).await?;
        }
        debug!("{} status {}", self.identity, status);
        Ok(())
    }

    pub async fn bridge_command_response(&self, body: CommandResponseBody) -> Result<()> {
        let message =
            CanonicalMessage::command_response(self.identity.device_id, body, QoS::AtLeastOnce);
        self.publish(&topics::command_response(self.identity.device_id), &message)
            .await
    }

    /// Publish a charging session update for one connector
    pub async fn bridge_session(&self, connector_id: u32, session: serde_json::Value) -> Result<()> {
        let message = CanonicalMessage::signal(
            self.identity.device_id,
            "session",
            session,
            Utc::now(),
            QoS::ExactlyOnce,
            false,
        );
        self.publish(
            &topics::evcharger_session(self.identity.device_id, connector_id),
            &message,
        )
        .await
    }

    fn secondary_signals(&self) -> Vec<SecondarySignal> {
        let id = self.identity.device_id;
        let signal = |topic: String, field: &'static str, qos: QoS, retain: bool| SecondarySignal {
            topic,
            field,
            qos,
            retain,
        };
        match self.identity.device_type {
            DeviceType::Battery => vec![
                signal(topics::battery_soc(id), "soc", QoS::ExactlyOnce, true),
                signal(topics::battery_power(id), "power", QoS::AtMostOnce, false),
            ],
            DeviceType::Meter => vec![
                signal(topics::meter_reading(id), "energy", QoS::AtLeastOnce, true),
                signal(topics::meter_power(id), "power", QoS::AtMostOnce, false),
            ],
            DeviceType::HeatPump => vec![signal(
                topics::heatpump_temperature(id),
                "temperature",
                QoS::AtLeastOnce,
                false,
            )],
            DeviceType::SolarInverter => vec![signal(
                topics::solar_production(id),
                "production",
                QoS::AtLeastOnce,
                true,
            )],
            // sessions are event driven, see bridge_session
            DeviceType::EvCharger | DeviceType::LoadController => Vec::new(),
        }
    }
}
