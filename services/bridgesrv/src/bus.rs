//! Message bus clients
//!
//! The bridge only needs four operations from a bus: publish with QoS and retain,
//! subscribe to a filter, unsubscribe, close. `MemoryBus` serves single-process
//! deployments and tests, `MqttBus` talks to an MQTT broker.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use bytes::Bytes;
use gridlink_model::QoS;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemoryBus;
pub use mqtt::{MqttBus, MqttConfig};

/// Delivery options for one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn new(qos: QoS, retain: bool) -> Self {
        Self { qos, retain }
    }
}

/// A message as seen by a subscriber (or recorded by the memory bus)
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl BusMessage {
    /// Decode the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Receiving side of a subscription; dropping it ends the subscription lazily
pub type Subscription = mpsc::UnboundedReceiver<BusMessage>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()>;

    /// Subscribe to a topic filter (`+` and `#` wildcards supported)
    async fn subscribe(&self, filter: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// MQTT topic filter matching
///
/// `+` matches exactly one level, `#` matches the remaining levels (including none)
/// and must be the last level of the filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {},
            (Some(f), Some(t)) if f == t => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}
