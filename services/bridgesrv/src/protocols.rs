//! Protocol adapters
//!
//! One adapter instance per device. Every adapter owns:
//! - a [`ConnectionController`] driving connect, backoff and cooldown
//! - a [`ProtocolBridge`] publishing its readings and status
//! - zero or more periodic tasks (polling, metering) started on connect
//!
//! Families: `modbus` (also serves SunSpec), `ocpp`, `eebus`, `tcpip`.

pub mod eebus;
pub mod modbus;
pub mod ocpp;
pub mod registry;
pub mod tcpip;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridlink_model::{DeviceIdentity, DeviceStatus, FieldValue, Reading};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::bridge::ProtocolBridge;
use crate::error::{BridgeError, Result};
use crate::runtime::reconnect::{
    ConnectionController, Connector, LifecycleObserver, LifecycleSnapshot, ReconnectPolicy,
};
use crate::storage::ReadingSink;

pub use registry::{create_default_registry, AdapterContext, AdapterFactory, AdapterFactoryRegistry};

// ============================================================================
// Adapter trait
// ============================================================================

/// Uniform device surface used by managers and the command dispatcher
///
/// @lifecycle connect → periodic reads / commands → disconnect
/// @errors connection-class errors feed the controller, validation errors go
///         back to the caller unchanged
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn identity(&self) -> DeviceIdentity;

    fn name(&self) -> &str;

    fn bridge(&self) -> &Arc<ProtocolBridge>;

    fn is_connected(&self) -> bool;

    /// Start the connection lifecycle and periodic tasks
    ///
    /// A failed first attempt is returned but retries continue in the background.
    async fn connect(&self) -> Result<()>;

    /// Stop periodic tasks and pending retries, then close the link
    async fn disconnect(&self) -> Result<()>;

    /// Fetch one native reading from the device
    async fn read_data(&self) -> Result<Reading>;

    /// Protocol-specific write
    async fn write_data(&self, params: &serde_json::Value) -> Result<()>;

    /// Named command; unknown names are validation errors
    async fn execute_command(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    fn device_info(&self) -> DeviceInfo;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    pub name: String,
    pub connected: bool,
    pub lifecycle: LifecycleSnapshot,
    pub details: serde_json::Value,
}

// ============================================================================
// Shared adapter plumbing
// ============================================================================

/// Publishes lifecycle transitions as status messages
pub struct BridgeObserver {
    bridge: Arc<ProtocolBridge>,
    sink: Arc<dyn ReadingSink>,
}

impl BridgeObserver {
    pub fn new(bridge: Arc<ProtocolBridge>, sink: Arc<dyn ReadingSink>) -> Self {
        Self { bridge, sink }
    }

    async fn report(&self, status: DeviceStatus, details: Option<serde_json::Value>) {
        let identity = *self.bridge.identity();
        if let Err(e) = self.sink.store_status(&identity, status).await {
            warn!("{} status not stored: {}", identity, e);
        }
        if let Err(e) = self.bridge.bridge_status(status, details).await {
            warn!("{} status not published: {}", identity, e);
        }
    }
}

#[async_trait]
impl LifecycleObserver for BridgeObserver {
    async fn on_connected(&self) {
        self.report(DeviceStatus::Online, None).await;
    }

    async fn on_disconnected(&self) {
        self.report(DeviceStatus::Offline, None).await;
    }

    async fn on_exhausted(&self, attempts: u32, cooldown: Duration) {
        let error = BridgeError::exhausted(attempts, cooldown.as_millis() as u64);
        self.report(
            DeviceStatus::Error,
            Some(serde_json::json!({
                "reason": "max_attempts_exceeded",
                "code": error.error_code(),
                "message": error.to_string(),
                "attempts": attempts,
                "cooldownMs": cooldown.as_millis() as u64,
            })),
        )
        .await;
    }
}

/// State every adapter carries regardless of protocol
pub struct AdapterCore {
    pub identity: DeviceIdentity,
    pub name: String,
    pub bridge: Arc<ProtocolBridge>,
    pub sink: Arc<dyn ReadingSink>,
    pub controller: ConnectionController,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl AdapterCore {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<ProtocolBridge>,
        sink: Arc<dyn ReadingSink>,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let identity = *bridge.identity();
        let observer = Arc::new(BridgeObserver::new(Arc::clone(&bridge), Arc::clone(&sink)));
        let controller =
            ConnectionController::new(identity.to_string(), policy, connector, observer);
        Self {
            identity,
            name: name.into(),
            bridge,
            sink,
            controller,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    pub fn ensure_connected(&self) -> Result<()> {
        if self.controller.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::not_connected())
        }
    }

    /// Persist and bridge one reading; sink failures are logged only
    pub async fn publish_reading(&self, reading: &Reading) -> Result<BTreeMap<String, FieldValue>> {
        if let Err(e) = self.sink.store_reading(&self.identity, reading).await {
            warn!("{} reading not stored: {}", self.identity, e);
        }
        self.bridge.bridge_telemetry(reading).await
    }

    /// Route an operation error: connection-class errors restart the lifecycle
    pub async fn report_error(&self, context: &str, err: &BridgeError) {
        if err.is_connection_class() {
            self.controller
                .handle_link_failure(&format!("{context}: {err}"))
                .await;
        } else {
            warn!("{} {} failed: {}", self.identity, context, err);
        }
    }

    /// Spawn the adapter's background tasks unless they already run
    ///
    /// `spawn` is only called while holding the task list, so racing
    /// connects start one set of tasks.
    pub fn start_tasks<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> Vec<PeriodicTask>,
    {
        let mut running = self.tasks.lock();
        if !running.is_empty() {
            debug!("{} periodic tasks already running", self.identity);
            return false;
        }
        *running = spawn();
        true
    }

    pub fn tasks_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub async fn stop_tasks(&self) {
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
    }

    /// Standard `read` command: read, publish, return the mapped fields
    pub async fn read_command(&self, reading: Reading) -> Result<serde_json::Value> {
        let mapped = self.publish_reading(&reading).await?;
        Ok(serde_json::to_value(mapped)?)
    }

    pub fn info(&self, details: serde_json::Value) -> DeviceInfo {
        DeviceInfo {
            identity: self.identity,
            name: self.name.clone(),
            connected: self.controller.is_connected(),
            lifecycle: self.controller.snapshot(),
            details,
        }
    }
}

// ============================================================================
// Periodic tasks
// ============================================================================

/// Interval-driven background job, stopped through a cancellation token
pub struct PeriodicTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `tick` every `period`, skipping missed ticks
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Task {} started, period {:?}", task_name, period);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("Task {} stopped", task_name);
        });
        Self {
            name,
            token,
            handle,
        }
    }

    /// Long-running job that watches the token itself
    pub fn spawn_with_token<F, Fut>(name: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(job(token.clone()));
        Self {
            name: name.into(),
            token,
            handle,
        }
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Task {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

pub(crate) fn param_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| BridgeError::validation(format!("Missing string parameter '{key}'")))
}

pub(crate) fn param_f64(params: &serde_json::Value, key: &str) -> Result<f64> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| BridgeError::validation(format!("Missing numeric parameter '{key}'")))
}

pub(crate) fn param_u32(params: &serde_json::Value, key: &str) -> Result<u32> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BridgeError::validation(format!("Missing integer parameter '{key}'")))
}
