//! EEBus appliance adapter
//!
//! Mode oriented: a heat pump exposes an operation mode and a temperature
//! set-point. Both setters validate before anything is sent or stored, so a
//! rejected request leaves the appliance state untouched and publishes
//! nothing.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridlink_model::{DeviceIdentity, DeviceStatus, Reading};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::core::bridge::ProtocolBridge;
use crate::error::{BridgeError, ErrorExt, Result};
use crate::protocols::{param_f64, param_str, AdapterCore, DeviceAdapter, DeviceInfo, PeriodicTask};
use crate::runtime::reconnect::{Connector, ReconnectPolicy};
use crate::storage::ReadingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Off,
    #[default]
    Auto,
    Heat,
    Cool,
    Eco,
}

impl OperationMode {
    pub const ALL: [OperationMode; 5] = [
        OperationMode::Off,
        OperationMode::Auto,
        OperationMode::Heat,
        OperationMode::Cool,
        OperationMode::Eco,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Eco => "eco",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                BridgeError::validation(format!(
                    "Invalid operation mode '{s}', expected one of off, auto, heat, cool, eco"
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EebusParams {
    pub host: String,
    pub port: u16,
    /// Subject key identifier of the remote SHIP node
    pub ski: String,
    pub poll_interval_ms: u64,
    pub min_temperature: f64,
    pub max_temperature: f64,
}

impl Default for EebusParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4712,
            ski: String::new(),
            poll_interval_ms: 5000,
            min_temperature: 10.0,
            max_temperature: 30.0,
        }
    }
}

impl EebusParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let params: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone())
                .config_error("Invalid EEBus parameters")?
        };
        if !params.min_temperature.is_finite()
            || !params.max_temperature.is_finite()
            || params.min_temperature >= params.max_temperature
        {
            return Err(BridgeError::config(format!(
                "Temperature range {}..{} is empty",
                params.min_temperature, params.max_temperature
            )));
        }
        if params.poll_interval_ms == 0 {
            return Err(BridgeError::config("poll_interval_ms must be positive"));
        }
        Ok(params)
    }

    pub fn check_temperature(&self, celsius: f64) -> Result<()> {
        if celsius.is_finite() && (self.min_temperature..=self.max_temperature).contains(&celsius) {
            Ok(())
        } else {
            Err(BridgeError::validation(format!(
                "Target temperature {celsius} outside {}..={} °C",
                self.min_temperature, self.max_temperature
            )))
        }
    }
}

// ============================================================================
// Appliance link
// ============================================================================

/// Measurements reported by the appliance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceState {
    pub current_temperature: f64,
    pub target_temperature: f64,
    pub operation_mode: OperationMode,
    pub power_consumption: f64,
}

/// SHIP/SPINE session to one appliance
#[async_trait]
pub trait ApplianceLink: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self);

    async fn read_state(&self) -> Result<ApplianceState>;

    async fn write_operation_mode(&self, mode: OperationMode) -> Result<()>;

    async fn write_setpoint(&self, celsius: f64) -> Result<()>;
}

/// Heat pump model that moves toward its set-point on every read
pub struct SimulatedHeatPump {
    state: Mutex<ApplianceState>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    connect_failures: AtomicU32,
    writes: AtomicU32,
}

impl Default for SimulatedHeatPump {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHeatPump {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ApplianceState {
                current_temperature: 20.0,
                target_temperature: 21.0,
                operation_mode: OperationMode::Auto,
                power_consumption: 0.0,
            }),
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ApplianceState {
        self.state.lock().clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Number of accepted writes
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::connection("SHIP connection closed"))
        }
    }
}

fn mode_power(mode: OperationMode, delta: f64) -> f64 {
    match mode {
        OperationMode::Off => 0.0,
        OperationMode::Eco => 600.0 + 150.0 * delta.abs(),
        OperationMode::Auto | OperationMode::Heat | OperationMode::Cool => {
            1200.0 + 400.0 * delta.abs()
        },
    }
}

#[async_trait]
impl ApplianceLink for SimulatedHeatPump {
    async fn open(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("appliance unreachable"));
        }
        let pending = self.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::connection("simulated SHIP handshake failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_state(&self) -> Result<ApplianceState> {
        self.check_link()?;
        let mut state = self.state.lock();
        let delta = state.target_temperature - state.current_temperature;
        let step = match state.operation_mode {
            OperationMode::Off => 0.0,
            OperationMode::Heat => delta.clamp(0.0, 0.5),
            OperationMode::Cool => delta.clamp(-0.5, 0.0),
            OperationMode::Auto | OperationMode::Eco => delta.clamp(-0.5, 0.5),
        };
        state.current_temperature += step;
        state.power_consumption = if step == 0.0 && state.operation_mode != OperationMode::Off {
            // holding temperature
            mode_power(state.operation_mode, 0.0) * 0.25
        } else {
            mode_power(state.operation_mode, delta)
        };
        Ok(state.clone())
    }

    async fn write_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.check_link()?;
        self.state.lock().operation_mode = mode;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_setpoint(&self, celsius: f64) -> Result<()> {
        self.check_link()?;
        self.state.lock().target_temperature = celsius;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Adapter
// ============================================================================

struct LinkConnector {
    link: Arc<dyn ApplianceLink>,
}

#[async_trait]
impl Connector for LinkConnector {
    async fn connect_link(&self) -> Result<()> {
        self.link.open().await
    }

    async fn disconnect_link(&self) {
        self.link.close().await;
    }
}

#[derive(Debug, Clone, Copy)]
struct Setpoints {
    mode: OperationMode,
    target_temperature: f64,
}

struct Inner {
    core: AdapterCore,
    link: Arc<dyn ApplianceLink>,
    params: EebusParams,
    setpoints: Mutex<Setpoints>,
    /// One setter at a time
    ops: tokio::sync::Mutex<()>,
}

pub struct EebusAdapter {
    inner: Arc<Inner>,
}

impl EebusAdapter {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<ProtocolBridge>,
        sink: Arc<dyn ReadingSink>,
        policy: ReconnectPolicy,
        params: EebusParams,
        link: Arc<dyn ApplianceLink>,
    ) -> Self {
        let connector = Arc::new(LinkConnector {
            link: Arc::clone(&link),
        });
        let target_temperature = 21.0_f64.clamp(params.min_temperature, params.max_temperature);
        Self {
            inner: Arc::new(Inner {
                core: AdapterCore::new(name, bridge, sink, policy, connector),
                link,
                params,
                setpoints: Mutex::new(Setpoints {
                    mode: OperationMode::default(),
                    target_temperature,
                }),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn current_mode(&self) -> OperationMode {
        self.inner.setpoints.lock().mode
    }

    pub fn target_temperature(&self) -> f64 {
        self.inner.setpoints.lock().target_temperature
    }

    pub async fn set_operation_mode(&self, mode: &str) -> Result<()> {
        let mode: OperationMode = mode.parse()?;
        self.inner.set_operation_mode(mode).await
    }

    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.inner.set_target_temperature(celsius).await
    }

    fn poll_task(&self) -> PeriodicTask {
        let inner = Arc::clone(&self.inner);
        PeriodicTask::spawn(
            format!("eebus-poll-{}", inner.core.identity.device_id),
            Duration::from_millis(inner.params.poll_interval_ms),
            move || {
                let inner = Arc::clone(&inner);
                async move { inner.poll_once().await }
            },
        )
    }
}

impl Inner {
    async fn link_call<T>(
        &self,
        context: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = call.await;
        if let Err(e) = &result {
            self.core.report_error(context, e).await;
        }
        result
    }

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.core.ensure_connected()?;
        let _ops = self.ops.lock().await;
        self.link_call("set mode", self.link.write_operation_mode(mode))
            .await?;
        self.setpoints.lock().mode = mode;
        info!("{} operation mode -> {}", self.core.identity, mode);
        self.publish_setpoints().await;
        Ok(())
    }

    async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.params.check_temperature(celsius)?;
        self.core.ensure_connected()?;
        let _ops = self.ops.lock().await;
        self.link_call("set setpoint", self.link.write_setpoint(celsius))
            .await?;
        self.setpoints.lock().target_temperature = celsius;
        info!("{} target temperature -> {} °C", self.core.identity, celsius);
        self.publish_setpoints().await;
        Ok(())
    }

    async fn publish_setpoints(&self) {
        let setpoints = *self.setpoints.lock();
        let details = json!({
            "operationMode": setpoints.mode,
            "targetTemperature": setpoints.target_temperature,
        });
        if let Err(e) = self
            .core
            .bridge
            .bridge_status(DeviceStatus::Online, Some(details))
            .await
        {
            warn!("{} set-point status not published: {}", self.core.identity, e);
        }
    }

    async fn read_all(&self) -> Result<Reading> {
        let state = self.link.read_state().await?;
        Ok(Reading::new()
            .with_field("current_temperature", state.current_temperature)
            .with_field("target_temperature", state.target_temperature)
            .with_field("operation_mode", state.operation_mode.as_str())
            .with_field("power_consumption", state.power_consumption))
    }

    async fn poll_once(&self) {
        if !self.core.is_connected() {
            return;
        }
        match self.read_all().await {
            Ok(reading) => {
                if let Err(e) = self.core.publish_reading(&reading).await {
                    warn!("{} reading not published: {}", self.core.identity, e);
                }
            },
            Err(e) => self.core.report_error("poll", &e).await,
        }
    }
}

#[async_trait]
impl DeviceAdapter for EebusAdapter {
    fn identity(&self) -> DeviceIdentity {
        self.inner.core.identity
    }

    fn name(&self) -> &str {
        &self.inner.core.name
    }

    fn bridge(&self) -> &Arc<ProtocolBridge> {
        &self.inner.core.bridge
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    async fn connect(&self) -> Result<()> {
        let result = self.inner.core.controller.connect().await;
        self.inner.core.start_tasks(|| vec![self.poll_task()]);
        result
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.core.stop_tasks().await;
        self.inner.core.controller.disconnect().await
    }

    async fn read_data(&self) -> Result<Reading> {
        self.inner.core.ensure_connected()?;
        self.inner.link_call("read", self.inner.read_all()).await
    }

    /// `{"mode"?: m, "targetTemperature"?: t}`; everything is validated first
    async fn write_data(&self, params: &serde_json::Value) -> Result<()> {
        let mode = match params.get("mode").and_then(|v| v.as_str()) {
            Some(mode) => Some(mode.parse::<OperationMode>()?),
            None => None,
        };
        let target = params.get("targetTemperature").and_then(|v| v.as_f64());
        if let Some(celsius) = target {
            self.inner.params.check_temperature(celsius)?;
        }
        if mode.is_none() && target.is_none() {
            return Err(BridgeError::validation(
                "Expected 'mode' and/or 'targetTemperature'",
            ));
        }

        if let Some(mode) = mode {
            self.inner.set_operation_mode(mode).await?;
        }
        if let Some(celsius) = target {
            self.inner.set_target_temperature(celsius).await?;
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match command {
            "set_operation_mode" => {
                let mode = param_str(params, "mode")?;
                self.set_operation_mode(mode).await?;
                Ok(json!({ "operationMode": self.current_mode() }))
            },
            "set_target_temperature" => {
                let celsius = param_f64(params, "temperature")?;
                self.set_target_temperature(celsius).await?;
                Ok(json!({ "targetTemperature": self.target_temperature() }))
            },
            "read" => {
                let reading = self.read_data().await?;
                self.inner.core.read_command(reading).await
            },
            other => Err(BridgeError::validation(format!(
                "Unsupported EEBus command '{other}'"
            ))),
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let setpoints = *self.inner.setpoints.lock();
        let params = &self.inner.params;
        self.inner.core.info(json!({
            "host": params.host,
            "port": params.port,
            "ski": params.ski,
            "operationMode": setpoints.mode,
            "targetTemperature": setpoints.target_temperature,
            "temperatureRange": [params.min_temperature, params.max_temperature],
        }))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::core::bridge::BridgePolicy;
    use crate::core::mapping::MappingEngine;
    use crate::storage::NullSink;
    use gridlink_model::{DeviceType, Protocol};

    fn adapter(bus: Arc<MemoryBus>, pump: Arc<SimulatedHeatPump>) -> EebusAdapter {
        let identity = DeviceIdentity::new(41, DeviceType::HeatPump, Protocol::Eebus);
        let bridge = Arc::new(ProtocolBridge::new(
            identity,
            bus,
            MappingEngine::for_device_type(DeviceType::HeatPump),
            BridgePolicy::default(),
        ));
        EebusAdapter::new(
            "heatpump-41",
            bridge,
            Arc::new(NullSink),
            ReconnectPolicy::default(),
            EebusParams {
                poll_interval_ms: 60_000,
                ..EebusParams::default()
            },
            pump,
        )
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("ECO".parse::<OperationMode>().unwrap(), OperationMode::Eco);
        assert!("turbo".parse::<OperationMode>().unwrap_err().is_validation());
    }

    #[test]
    fn test_params_reject_empty_range() {
        let err = EebusParams::from_value(&json!({"min_temperature": 30, "max_temperature": 10}))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_setters_apply_and_publish() {
        let bus = Arc::new(MemoryBus::new());
        let pump = Arc::new(SimulatedHeatPump::new());
        let adapter = adapter(bus.clone(), pump.clone());
        adapter.connect().await.unwrap();
        let before = bus.published_on("devices/41/status").len();

        adapter.set_operation_mode("heat").await.unwrap();
        adapter.set_target_temperature(23.5).await.unwrap();
        assert_eq!(adapter.current_mode(), OperationMode::Heat);
        assert_eq!(pump.state().target_temperature, 23.5);
        assert_eq!(bus.published_on("devices/41/status").len(), before + 2);

        let status: serde_json::Value = bus.retained("devices/41/status").unwrap().json().unwrap();
        assert_eq!(status["details"]["operationMode"], "heat");
        assert_eq!(status["details"]["targetTemperature"], 23.5);

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_mode_changes_nothing() {
        let bus = Arc::new(MemoryBus::new());
        let pump = Arc::new(SimulatedHeatPump::new());
        let adapter = adapter(bus.clone(), pump.clone());
        adapter.connect().await.unwrap();
        let published = bus.published_on("devices/41/status").len();

        let err = adapter
            .execute_command("set_operation_mode", &json!({"mode": "turbo"}))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        // mixed write: the bad temperature blocks the valid mode too
        let err = adapter
            .write_data(&json!({"mode": "cool", "targetTemperature": 5.0}))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(adapter.current_mode(), OperationMode::Auto);
        assert_eq!(pump.writes(), 0);
        assert_eq!(bus.published_on("devices/41/status").len(), published);

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_maps_heat_pump_fields() {
        let bus = Arc::new(MemoryBus::new());
        let pump = Arc::new(SimulatedHeatPump::new());
        let adapter = adapter(bus.clone(), pump);
        adapter.connect().await.unwrap();

        let mapped = adapter
            .execute_command("read", &serde_json::Value::Null)
            .await
            .unwrap();
        assert!(mapped["temperature"].as_f64().is_some());
        assert!(mapped["power"].as_f64().is_some());
        assert_eq!(mapped["operation_mode"], "auto");
        assert!(!bus.published_on("heatpump/41/temperature").is_empty());

        adapter.disconnect().await.unwrap();
    }
}
