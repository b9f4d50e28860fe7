//! MQTT bus client on top of rumqttc
//!
//! One background task drives the rumqttc event loop. Incoming publishes are
//! fanned out to local subscriptions by filter; filters are re-sent to the
//! broker after every ConnAck so a broker restart does not lose them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gridlink_model::QoS;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{topic_matches, BusMessage, MessageBus, PublishOptions, Subscription};
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Request channel capacity between client handle and event loop
    pub capacity: usize,
    /// Pause after an event loop error before polling again
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "gridlink-bridgesrv".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
            capacity: 100,
            reconnect_delay_ms: 2000,
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

struct Subscriber {
    filter: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

pub struct MqttBus {
    client: AsyncClient,
    subscribers: Subscribers,
    shutdown: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start the event loop task
    ///
    /// The broker connection itself is established lazily by the event loop.
    pub fn start(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(config.clean_session);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, config.capacity.max(10));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&subscribers),
            shutdown.clone(),
            Duration::from_millis(config.reconnect_delay_ms),
        ));

        info!("MQTT bus targeting {}:{}", config.host, config.port);
        Self {
            client,
            subscribers,
            shutdown,
            event_task: Mutex::new(Some(task)),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscribers: Subscribers,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT broker connected");
                let filters: Vec<String> = subscribers
                    .lock()
                    .iter()
                    .map(|s| s.filter.clone())
                    .collect();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(&filter, rumqttc::QoS::AtLeastOnce) {
                        warn!("MQTT resubscribe {} failed: {}", filter, e);
                    }
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: from_mqtt_qos(publish.qos),
                    retain: publish.retain,
                };
                subscribers.lock().retain(|sub| {
                    if !topic_matches(&sub.filter, &message.topic) {
                        return !sub.sender.is_closed();
                    }
                    sub.sender.send(message.clone()).is_ok()
                });
            },
            Ok(_) => {},
            Err(e) => {
                warn!("MQTT event loop error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {},
                }
            },
        }
    }
    debug!("MQTT event loop stopped");
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()> {
        self.client
            .publish(topic, to_mqtt_qos(options.qos), options.retain, payload.to_vec())
            .await
            .map_err(|e| BridgeError::bus(format!("MQTT publish to {topic} failed: {e}")))
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            filter: filter.to_string(),
            sender,
        });
        self.client
            .subscribe(filter, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::bus(format!("MQTT subscribe to {filter} failed: {e}")))?;
        Ok(receiver)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscribers.lock().retain(|s| s.filter != filter);
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BridgeError::bus(format!("MQTT unsubscribe from {filter} failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request not delivered: {}", e);
        }
        self.shutdown.cancel();
        let task = self.event_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("MQTT event task ended abnormally: {}", e);
            }
        }
        self.subscribers.lock().clear();
        Ok(())
    }
}
