//! Service runtime
//!
//! Builds the device registry from configuration, connects every device and
//! serves canonical command requests from the bus until shut down.

use std::sync::Arc;

use bytes::Bytes;
use gridlink_model::{
    topics, CanonicalMessage, CommandRequest, CommandResponseBody, DeviceId, QoS,
};
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, MessageBus, PublishOptions, Subscription};
use crate::core::config::AppConfig;
use crate::core::manager::DeviceRegistry;
use crate::error::{BridgeError, Result};
use crate::protocols::{create_default_registry, AdapterContext, AdapterFactoryRegistry};
use crate::storage::ReadingSink;

/// Answered by the dispatcher itself for every device
pub const DEVICE_INFO_COMMAND: &str = "get_device_info";

pub struct BridgeService {
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn MessageBus>,
    token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeService {
    /// Start with the built-in protocol factories
    pub async fn start(
        config: &AppConfig,
        bus: Arc<dyn MessageBus>,
        sink: Arc<dyn ReadingSink>,
    ) -> Result<Self> {
        let context = AdapterContext::new(bus).with_sink(sink);
        Self::start_with(config, create_default_registry(), context).await
    }

    pub async fn start_with(
        config: &AppConfig,
        factories: AdapterFactoryRegistry,
        context: AdapterContext,
    ) -> Result<Self> {
        let bus = Arc::clone(&context.bus);
        let registry = Arc::new(DeviceRegistry::new(factories, context));

        // Subscribe before devices come up so no early request is lost
        let subscription = bus.subscribe(topics::COMMAND_REQUEST_FILTER).await?;

        let mut added = 0usize;
        for device in &config.devices {
            match registry.add_device(device).await {
                Ok(true) => added += 1,
                Ok(false) => {},
                Err(e) => error!("Dev{} skipped: {}", device.id, e),
            }
        }

        let token = CancellationToken::new();
        let dispatcher = CommandDispatcher {
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
        };
        let handle = tokio::spawn(dispatcher.run(subscription, token.clone()));

        info!(
            "{} started: {}/{} device(s)",
            config.service.name,
            added,
            config.devices.len()
        );
        Ok(Self {
            registry,
            bus,
            token,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Stop command dispatch, then disconnect every device
    ///
    /// The bus itself stays open; it belongs to the caller.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Command dispatcher ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.bus.unsubscribe(topics::COMMAND_REQUEST_FILTER).await {
            debug!("Unsubscribe on shutdown: {}", e);
        }
        self.registry.shutdown().await;
        info!("Bridge service stopped");
    }
}

/// Routes `devices/{id}/commands/request` to adapters
#[derive(Clone)]
struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    bus: Arc<dyn MessageBus>,
}

impl CommandDispatcher {
    async fn run(self, mut subscription: Subscription, token: CancellationToken) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => {
                        let dispatcher = self.clone();
                        in_flight.spawn(async move { dispatcher.handle(message).await });
                    },
                    None => {
                        warn!("Command subscription closed");
                        break;
                    },
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {},
            }
        }
        in_flight.shutdown().await;
        debug!("Command dispatcher stopped");
    }

    async fn handle(&self, message: BusMessage) {
        let Some(device_id) = topics::parse_command_request(&message.topic) else {
            warn!("Command on unexpected topic {}", message.topic);
            return;
        };
        // A bare request and a canonical envelope both carry these fields at top level
        let mut request: CommandRequest = match message.json() {
            Ok(request) => request,
            Err(e) => {
                warn!("Dev{} malformed command: {}", device_id, e);
                return;
            },
        };
        let command_id = request
            .command_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        debug!("Dev{} command {} ({})", device_id, request.command, command_id);

        let Some(adapter) = self.registry.get(device_id) else {
            let err = BridgeError::DeviceNotFound(device_id);
            warn!("{}", err);
            let body = failure(&request, &err);
            if let Err(e) = self.respond_unrouted(device_id, body).await {
                error!("Dev{} response publish err: {}", device_id, e);
            }
            return;
        };

        let outcome = if request.command == DEVICE_INFO_COMMAND {
            serde_json::to_value(adapter.device_info()).map_err(BridgeError::from)
        } else {
            adapter
                .execute_command(&request.command, &request.params)
                .await
        };
        let body = match outcome {
            Ok(result) => CommandResponseBody {
                command_id: request.command_id.clone(),
                command: request.command.clone(),
                success: true,
                result: Some(result),
                error: None,
            },
            Err(e) => {
                warn!("Dev{} command {} failed: {}", device_id, request.command, e);
                failure(&request, &e)
            },
        };
        if let Err(e) = adapter.bridge().bridge_command_response(body).await {
            error!("Dev{} response publish err: {}", device_id, e);
        }
    }

    /// Response for a device without an adapter, straight onto the bus
    async fn respond_unrouted(&self, device_id: DeviceId, body: CommandResponseBody) -> Result<()> {
        let message = CanonicalMessage::command_response(device_id, body, QoS::AtLeastOnce);
        let payload = Bytes::from(message.to_json()?);
        self.bus
            .publish(
                &topics::command_response(device_id),
                payload,
                PublishOptions::new(message.qos, false),
            )
            .await
    }
}

fn failure(request: &CommandRequest, err: &BridgeError) -> CommandResponseBody {
    CommandResponseBody {
        command_id: request.command_id.clone(),
        command: request.command.clone(),
        success: false,
        result: None,
        error: Some(err.to_string()),
    }
}
