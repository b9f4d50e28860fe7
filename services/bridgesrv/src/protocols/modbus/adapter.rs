//! Modbus device adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridlink_comlink::{
    decode, decode_coils, decode_scaled, encode_f64, encode_scaled, encode_string, ByteOrder,
    DataType,
};
use gridlink_model::{FieldValue, Reading};
use serde_json::json;
use tracing::{debug, warn};

use super::{ModbusParams, RegisterKind, RegisterSpec, RegisterTransport};
use crate::core::bridge::ProtocolBridge;
use crate::error::{BridgeError, ErrorExt, Result};
use crate::protocols::{
    param_f64, param_str, AdapterCore, DeviceAdapter, DeviceInfo, PeriodicTask,
};
use crate::runtime::reconnect::{Connector, ReconnectPolicy};
use crate::storage::ReadingSink;

/// Opens and closes the register transport for the lifecycle controller
struct TransportConnector {
    transport: Arc<dyn RegisterTransport>,
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect_link(&self) -> Result<()> {
        self.transport.open().await
    }

    async fn disconnect_link(&self) {
        self.transport.close().await;
    }
}

struct Inner {
    core: AdapterCore,
    transport: Arc<dyn RegisterTransport>,
    params: ModbusParams,
}

/// Register-map driven Modbus TCP / SunSpec adapter
pub struct ModbusAdapter {
    inner: Arc<Inner>,
}

impl ModbusAdapter {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<ProtocolBridge>,
        sink: Arc<dyn ReadingSink>,
        policy: ReconnectPolicy,
        params: ModbusParams,
        transport: Arc<dyn RegisterTransport>,
    ) -> Self {
        let connector = Arc::new(TransportConnector {
            transport: Arc::clone(&transport),
        });
        Self {
            inner: Arc::new(Inner {
                core: AdapterCore::new(name, bridge, sink, policy, connector),
                transport,
                params,
            }),
        }
    }

    pub fn params(&self) -> &ModbusParams {
        &self.inner.params
    }

    fn scan_task(&self) -> PeriodicTask {
        let inner = Arc::clone(&self.inner);
        PeriodicTask::spawn(
            format!("modbus-scan-{}", inner.core.identity.device_id),
            Duration::from_millis(inner.params.scan_interval_ms),
            move || {
                let inner = Arc::clone(&inner);
                async move { inner.scan_once().await }
            },
        )
    }
}

impl Inner {
    async fn scan_once(&self) {
        if !self.core.is_connected() {
            return;
        }
        match self.read_all().await {
            Ok(reading) if reading.is_empty() => {
                debug!("{} scan produced no values", self.core.identity);
            },
            Ok(reading) => {
                if let Err(e) = self.core.publish_reading(&reading).await {
                    warn!("{} scan not published: {}", self.core.identity, e);
                }
            },
            Err(e) => self.core.report_error("scan", &e).await,
        }
    }

    /// Read every configured register
    ///
    /// Protocol errors skip the register; a connection-class error aborts the
    /// whole read.
    async fn read_all(&self) -> Result<Reading> {
        let mut reading = Reading::new();
        for spec in &self.params.registers {
            match self.read_register(spec).await {
                Ok(value) => reading.insert(spec.name.clone(), value),
                Err(e) if e.is_connection_class() => return Err(e),
                Err(e) => warn!(
                    "{} register {}@{} skipped: {}",
                    self.core.identity, spec.name, spec.address, e
                ),
            }
        }
        Ok(reading)
    }

    async fn read_register(&self, spec: &RegisterSpec) -> Result<FieldValue> {
        if spec.kind == RegisterKind::Coil {
            let coils = self.transport.read_coils(spec.address, 1).await?;
            return match decode_coils(&coils)? {
                gridlink_comlink::RegisterValue::Bool(b) => Ok(FieldValue::Bool(b)),
                other => Err(BridgeError::protocol(format!("unexpected coil value {other}"))),
            };
        }

        let words = self
            .transport
            .read_registers(spec.kind, spec.address, spec.register_count())
            .await?;
        match spec.data_type {
            DataType::String => {
                let text = decode(&words, spec.data_type, spec.byte_order)?;
                Ok(FieldValue::Text(text.to_string()))
            },
            DataType::Coil => Ok(FieldValue::Bool(words.first().is_some_and(|w| *w != 0))),
            data_type => Ok(FieldValue::Number(decode_scaled(
                &words,
                data_type,
                spec.byte_order,
                spec.effective_scale(),
                spec.offset,
            )?)),
        }
    }

    async fn write_register(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        self.core.ensure_connected()?;
        let spec = self
            .params
            .register(name)
            .ok_or_else(|| BridgeError::validation(format!("Unknown register '{name}'")))?;
        if !spec.writable || spec.kind == RegisterKind::Input {
            return Err(BridgeError::validation(format!(
                "Register '{name}' is read-only"
            )));
        }

        let field = FieldValue::from_json(value)
            .ok_or_else(|| BridgeError::validation(format!("No value for register '{name}'")))?;

        let result = if spec.kind == RegisterKind::Coil {
            let on = field
                .as_bool()
                .ok_or_else(|| BridgeError::validation(format!("'{field}' is not a boolean")))?;
            self.transport.write_coil(spec.address, on).await
        } else {
            let words = match spec.data_type {
                DataType::String => {
                    let text = field.to_string();
                    encode_string(&text, spec.register_count() as usize, spec.byte_order)?
                },
                data_type => {
                    let number = field.as_f64().ok_or_else(|| {
                        BridgeError::validation(format!("'{field}' is not numeric"))
                    })?;
                    encode_scaled(
                        number,
                        data_type,
                        spec.byte_order,
                        spec.effective_scale(),
                        spec.offset,
                    )?
                },
            };
            self.transport.write_registers(spec.address, &words).await
        };

        if let Err(e) = &result {
            self.core.report_error("write", e).await;
        } else {
            debug!("{} wrote {} = {}", self.core.identity, name, field);
        }
        result
    }

    /// Write a raw value at an address outside the register map
    async fn write_address(&self, params: &serde_json::Value) -> Result<()> {
        self.core.ensure_connected()?;
        let address = params
            .get("address")
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| BridgeError::validation("Invalid parameter 'address'"))?;
        let data_type: DataType = match params.get("type") {
            Some(v) => serde_json::from_value(v.clone())
                .validation_error("Invalid parameter 'type'")?,
            None => DataType::Uint16,
        };
        let order: ByteOrder = match params.get("byteOrder") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
                BridgeError::validation(format!("Invalid parameter 'byteOrder': {e}"))
            })?,
            None => ByteOrder::BigEndian,
        };
        let field = params
            .get("value")
            .and_then(FieldValue::from_json)
            .ok_or_else(|| BridgeError::validation("Missing parameter 'value'"))?;

        let result = match data_type {
            DataType::Coil => {
                let on = field
                    .as_bool()
                    .ok_or_else(|| BridgeError::validation(format!("'{field}' is not a boolean")))?;
                self.transport.write_coil(address, on).await
            },
            DataType::String => {
                let text = field.to_string();
                let words = encode_string(&text, text.len().div_ceil(2).max(1), order)?;
                self.transport.write_registers(address, &words).await
            },
            numeric => {
                let number = field
                    .as_f64()
                    .ok_or_else(|| BridgeError::validation(format!("'{field}' is not numeric")))?;
                let words = encode_f64(number, numeric, order)?;
                self.transport.write_registers(address, &words).await
            },
        };
        if let Err(e) = &result {
            self.core.report_error("write", e).await;
        }
        result
    }

    /// Write a canonical field by reversing its mapping rule
    async fn write_field(&self, field: &str, value: f64) -> Result<String> {
        let (register, raw) = match self.core.bridge.mapping().reverse(field, value) {
            Some(target) => target,
            None if self.params.register(field).is_some() => (field.to_string(), value),
            None => {
                return Err(BridgeError::validation(format!(
                    "Field '{field}' is not writable"
                )))
            },
        };
        self.write_register(&register, &json!(raw)).await?;
        Ok(register)
    }
}

#[async_trait]
impl DeviceAdapter for ModbusAdapter {
    fn identity(&self) -> gridlink_model::DeviceIdentity {
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
        // the scan idles until the controller reports a link
        self.inner.core.start_tasks(|| vec![self.scan_task()]);
        result
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.core.stop_tasks().await;
        self.inner.core.controller.disconnect().await
    }

    async fn read_data(&self) -> Result<Reading> {
        self.inner.core.ensure_connected()?;
        match self.inner.read_all().await {
            Ok(reading) => Ok(reading),
            Err(e) => {
                self.inner.core.report_error("read", &e).await;
                Err(e)
            },
        }
    }

    /// Accepted shapes:
    /// - `{"address": a, "value": v, "type"?: t, "byteOrder"?: o}` raw write
    /// - `{"register": name, "value": v}` configured register
    /// - `{"field": name, "value": v}` canonical field
    async fn write_data(&self, params: &serde_json::Value) -> Result<()> {
        if params.get("address").is_some() {
            return self.inner.write_address(params).await;
        }
        let value = params
            .get("value")
            .ok_or_else(|| BridgeError::validation("Missing parameter 'value'"))?;
        if let Some(register) = params.get("register").and_then(|v| v.as_str()) {
            return self.inner.write_register(register, value).await;
        }
        let field = param_str(params, "field")?;
        let number = param_f64(params, "value")?;
        self.inner.write_field(field, number).await.map(|_| ())
    }

    async fn execute_command(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match command {
            "read" => {
                let reading = self.read_data().await?;
                self.inner.core.read_command(reading).await
            },
            "read_register" => {
                self.inner.core.ensure_connected()?;
                let name = param_str(params, "register")?;
                let spec = self.inner.params.register(name).ok_or_else(|| {
                    BridgeError::validation(format!("Unknown register '{name}'"))
                })?;
                let value = match self.inner.read_register(spec).await {
                    Ok(value) => value,
                    Err(e) => {
                        self.inner.core.report_error("read_register", &e).await;
                        return Err(e);
                    },
                };
                Ok(json!({ "register": name, "value": value }))
            },
            "write" => {
                self.write_data(params).await?;
                Ok(json!({ "written": true }))
            },
            "write_field" => {
                let field = param_str(params, "field")?;
                let value = param_f64(params, "value")?;
                let register = self.inner.write_field(field, value).await?;
                Ok(json!({ "written": true, "register": register }))
            },
            other => Err(BridgeError::validation(format!(
                "Unsupported Modbus command '{other}'"
            ))),
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let params = &self.inner.params;
        self.inner.core.info(json!({
            "host": params.host,
            "port": params.port,
            "unitId": params.unit_id,
            "scanIntervalMs": params.scan_interval_ms,
            "registers": params.registers.len(),
            "scanning": self.inner.core.tasks_running(),
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
    use crate::protocols::modbus::SimulatedRegisters;
    use crate::storage::MemorySink;
    use gridlink_model::{DeviceIdentity, DeviceStatus, DeviceType, Protocol};

    struct Fixture {
        adapter: ModbusAdapter,
        bank: Arc<SimulatedRegisters>,
        bus: Arc<MemoryBus>,
    }

    fn battery_params() -> ModbusParams {
        ModbusParams {
            scan_interval_ms: 60_000,
            registers: vec![
                RegisterSpec::new("state_of_charge", 0, DataType::Uint16),
                RegisterSpec::new("power_watts", 2, DataType::Float32)
                    .with_byte_order(ByteOrder::BigEndianSwap),
                RegisterSpec::new("temp_celsius", 4, DataType::Int16).with_scale(0.1, 0.0),
                RegisterSpec::new("running", 1, DataType::Coil).with_kind(RegisterKind::Coil),
            ],
            ..ModbusParams::default()
        }
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let identity = DeviceIdentity::new(7, DeviceType::Battery, Protocol::Modbus);
        let bridge = Arc::new(ProtocolBridge::new(
            identity,
            bus.clone(),
            MappingEngine::for_device_type(DeviceType::Battery),
            BridgePolicy::default(),
        ));
        let bank = Arc::new(SimulatedRegisters::new());
        bank.set_holding(0, &[8532]);
        bank.set_holding(
            2,
            &encode_f64(2500.0, DataType::Float32, ByteOrder::BigEndianSwap).unwrap(),
        );
        bank.set_holding(4, &encode_f64(215.0, DataType::Int16, ByteOrder::BigEndian).unwrap());
        bank.set_coil(1, true);

        let adapter = ModbusAdapter::new(
            "battery-7",
            bridge,
            Arc::new(MemorySink::new()),
            ReconnectPolicy::default(),
            battery_params(),
            bank.clone(),
        );
        Fixture { adapter, bank, bus }
    }

    #[tokio::test]
    async fn test_read_decodes_register_map() {
        let f = fixture();
        f.adapter.connect().await.unwrap();

        let reading = f.adapter.read_data().await.unwrap();
        assert_eq!(reading.get_f64("state_of_charge"), Some(8532.0));
        assert_eq!(reading.get_f64("power_watts"), Some(2500.0));
        assert!((reading.get_f64("temp_celsius").unwrap() - 21.5).abs() < 1e-9);
        assert_eq!(reading.get("running"), Some(&FieldValue::Bool(true)));

        let result = f
            .adapter
            .execute_command("read", &serde_json::Value::Null)
            .await
            .unwrap();
        assert!((result["soc"].as_f64().unwrap() - 85.32).abs() < 1e-9);
        assert!((result["power"].as_f64().unwrap() - 2.5).abs() < 1e-9);

        f.adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_skips_register() {
        let f = fixture();
        f.adapter.connect().await.unwrap();
        f.bank.set_exception(4);

        let reading = f.adapter.read_data().await.unwrap();
        assert!(reading.get("temp_celsius").is_none());
        assert!(reading.get("state_of_charge").is_some());
        assert!(f.adapter.is_connected());

        f.adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_field_reverses_mapping() {
        let f = fixture();
        f.adapter.connect().await.unwrap();

        // 3.0 kW canonical -> 3000 W native, float32 CDAB
        let result = f
            .adapter
            .execute_command("write_field", &json!({"field": "power", "value": 3.0}))
            .await
            .unwrap();
        assert_eq!(result["register"], "power_watts");
        let words = [f.bank.holding(2).unwrap(), f.bank.holding(3).unwrap()];
        let value = decode(&words, DataType::Float32, ByteOrder::BigEndianSwap)
            .unwrap()
            .as_f64()
            .unwrap();
        assert!((value - 3000.0).abs() < 1e-3);

        // register scale is reversed too
        f.adapter
            .write_data(&json!({"register": "temp_celsius", "value": 19.5}))
            .await
            .unwrap();
        assert_eq!(f.bank.holding(4), Some(195));

        f.adapter
            .execute_command(
                "write",
                &json!({"address": 40, "value": 70000, "type": "uint32", "byteOrder": "DCBA"}),
            )
            .await
            .unwrap();
        let words = [f.bank.holding(40).unwrap(), f.bank.holding(41).unwrap()];
        let value = decode(&words, DataType::Uint32, ByteOrder::LittleEndian).unwrap();
        assert_eq!(value.as_f64(), Some(70000.0));

        f.adapter
            .write_data(&json!({"register": "running", "value": false}))
            .await
            .unwrap();
        assert_eq!(f.bank.coil(1), Some(false));

        f.adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let f = fixture();
        let err = f
            .adapter
            .write_data(&json!({"register": "power_watts", "value": 1.0}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionError(_)));

        f.adapter.connect().await.unwrap();
        let err = f
            .adapter
            .execute_command("write_field", &json!({"field": "nope", "value": 1.0}))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = f
            .adapter
            .write_data(&json!({"register": "state_of_charge", "value": 70000}))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = f
            .adapter
            .execute_command("reboot", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        f.adapter.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_reconnects() {
        let f = fixture();
        f.adapter.connect().await.unwrap();
        assert_eq!(f.bank.connect_calls(), 1);

        f.bank.drop_link();
        let err = f.adapter.read_data().await.unwrap_err();
        assert!(err.is_connection_class());
        assert!(!f.adapter.is_connected());

        let status: serde_json::Value = f.bus.retained("devices/7/status").unwrap().json().unwrap();
        assert_eq!(status["status"], DeviceStatus::Offline.as_str());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.adapter.is_connected());
        assert_eq!(f.bank.connect_calls(), 2);

        f.adapter.disconnect().await.unwrap();
        assert!(!f.adapter.device_info().connected);
    }
}
