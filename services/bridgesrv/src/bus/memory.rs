//! In-process bus with retained-message semantics
//!
//! Every publish is recorded so callers can inspect what went out.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{topic_matches, BusMessage, MessageBus, PublishOptions, Subscription};
use crate::error::{BridgeError, Result};

struct Subscriber {
    filter: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<BusMessage>>,
    retained: DashMap<String, BusMessage>,
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in publish order
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Current retained message for a topic
    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.retained.get(topic).map(|m| m.value().clone())
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::bus("Bus is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()> {
        self.ensure_open()?;

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            qos: options.qos,
            retain: options.retain,
        };

        if options.retain {
            // An empty retained payload clears the topic
            if message.payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), message.clone());
            }
        }

        self.subscribers.lock().retain(|sub| {
            if !topic_matches(&sub.filter, topic) {
                return !sub.sender.is_closed();
            }
            sub.sender.send(message.clone()).is_ok()
        });

        debug!("Published {} ({}, retain={})", topic, options.qos, options.retain);
        self.published.lock().push(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        for entry in self.retained.iter() {
            if topic_matches(filter, entry.key()) {
                let _ = sender.send(entry.value().clone());
            }
        }

        self.subscribers.lock().push(Subscriber {
            filter: filter.to_string(),
            sender,
        });
        Ok(receiver)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscribers.lock().retain(|sub| sub.filter != filter);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.subscribers.lock().clear();
        Ok(())
    }
}
