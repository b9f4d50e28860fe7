//! Adapter factories
//!
//! One factory per protocol builds adapters from device configuration. The
//! registry is keyed by protocol; SunSpec is served by the Modbus factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gridlink_model::Protocol;
use tracing::{debug, info};

use super::eebus::{EebusAdapter, EebusParams, SimulatedHeatPump};
use super::modbus::{ModbusAdapter, ModbusParams, SimulatedRegisters, TcpRegisterTransport};
use super::ocpp::{OcppAdapter, OcppParams, SimulatedChargePoint};
use super::tcpip::{tcp_link, EchoStream, TcpAdapter, TcpParams};
use super::DeviceAdapter;
use crate::bus::MessageBus;
use crate::core::bridge::ProtocolBridge;
use crate::core::config::DeviceConfig;
use crate::core::mapping::{CustomFn, MappingEngine};
use crate::error::{BridgeError, Result};
use crate::storage::{NullSink, ReadingSink};

/// Shared collaborators handed to every factory
#[derive(Clone)]
pub struct AdapterContext {
    pub bus: Arc<dyn MessageBus>,
    pub sink: Arc<dyn ReadingSink>,
    /// Custom mapping functions available to rules, besides the built-ins
    pub functions: HashMap<String, CustomFn>,
}

impl AdapterContext {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            sink: Arc::new(NullSink),
            functions: HashMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReadingSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_function(mut self, name: impl Into<String>, function: CustomFn) -> Self {
        self.functions.insert(name.into(), function);
        self
    }

    /// Bridge for one device: configured rules or the device type's defaults
    pub fn bridge_for(&self, config: &DeviceConfig) -> Result<Arc<ProtocolBridge>> {
        let mapping = match &config.mapping {
            Some(rules) => MappingEngine::with_functions(rules.clone(), self.functions.clone())?,
            None => MappingEngine::for_device_type(config.device_type),
        };
        Ok(Arc::new(ProtocolBridge::new(
            config.identity(),
            Arc::clone(&self.bus),
            mapping,
            config.bridge.unwrap_or_default(),
        )))
    }
}

/// Builds adapters for one or more protocols
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    fn protocols(&self) -> &'static [Protocol];

    /// Check protocol parameters without building anything
    fn validate(&self, config: &DeviceConfig) -> Result<()>;

    async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>>;
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct AdapterFactoryRegistry {
    factories: DashMap<Protocol, Arc<dyn AdapterFactory>>,
}

impl AdapterFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn AdapterFactory>) {
        for protocol in factory.protocols() {
            self.factories.insert(*protocol, Arc::clone(&factory));
            debug!("Registered adapter factory for {}", protocol);
        }
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(&protocol).map(|f| Arc::clone(f.value()))
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.factories.iter().map(|e| *e.key()).collect();
        protocols.sort_by_key(|p| p.as_str());
        protocols
    }

    fn factory(&self, protocol: Protocol) -> Result<Arc<dyn AdapterFactory>> {
        self.get(protocol)
            .ok_or_else(|| BridgeError::config(format!("No adapter factory for protocol {protocol}")))
    }

    pub fn validate(&self, config: &DeviceConfig) -> Result<()> {
        self.factory(config.protocol)?.validate(config)
    }

    pub async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>> {
        let factory = self.factory(config.protocol)?;
        factory.validate(config)?;
        let adapter = factory.create(config, ctx).await?;
        info!(
            "Created {} adapter for {}{}",
            config.protocol,
            adapter.identity(),
            if config.mock_mode { " (mock)" } else { "" }
        );
        Ok(adapter)
    }
}

/// Registry with the built-in Modbus/SunSpec, OCPP, EEBus and TCP factories
pub fn create_default_registry() -> AdapterFactoryRegistry {
    let registry = AdapterFactoryRegistry::new();
    registry.register(Arc::new(ModbusFactory));
    registry.register(Arc::new(OcppFactory));
    registry.register(Arc::new(EebusFactory));
    registry.register(Arc::new(TcpFactory));
    registry
}

fn simulated_only(config: &DeviceConfig, stack: &str) -> Result<()> {
    if config.mock_mode {
        Ok(())
    } else {
        Err(BridgeError::config(format!(
            "Device {}: no {stack} transport is built in, enable mock_mode",
            config.id
        )))
    }
}

// ============================================================================
// Built-in factories
// ============================================================================

pub struct ModbusFactory;

#[async_trait]
impl AdapterFactory for ModbusFactory {
    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Modbus, Protocol::Sunspec]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        ModbusParams::from_value(&config.parameters).map(|_| ())
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>> {
        let params = ModbusParams::from_value(&config.parameters)?;
        let transport: Arc<dyn super::modbus::RegisterTransport> = if config.mock_mode {
            Arc::new(SimulatedRegisters::seeded(&params.registers))
        } else {
            Arc::new(TcpRegisterTransport::new(
                params.host.clone(),
                params.port,
                params.unit_id,
                Duration::from_millis(params.request_timeout_ms),
            ))
        };
        Ok(Arc::new(ModbusAdapter::new(
            config.display_name(),
            ctx.bridge_for(config)?,
            Arc::clone(&ctx.sink),
            config.reconnect_policy(),
            params,
            transport,
        )))
    }
}

pub struct OcppFactory;

#[async_trait]
impl AdapterFactory for OcppFactory {
    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Ocpp]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        OcppParams::from_value(&config.parameters)?;
        simulated_only(config, "OCPP-J")
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>> {
        let params = OcppParams::from_value(&config.parameters)?;
        simulated_only(config, "OCPP-J")?;
        let link = Arc::new(SimulatedChargePoint::new(params.connectors, params.max_power_w));
        Ok(Arc::new(OcppAdapter::new(
            config.display_name(),
            ctx.bridge_for(config)?,
            Arc::clone(&ctx.sink),
            config.reconnect_policy(),
            params,
            link,
        )))
    }
}

pub struct EebusFactory;

#[async_trait]
impl AdapterFactory for EebusFactory {
    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Eebus]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        EebusParams::from_value(&config.parameters)?;
        simulated_only(config, "SHIP/SPINE")
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>> {
        let params = EebusParams::from_value(&config.parameters)?;
        simulated_only(config, "SHIP/SPINE")?;
        Ok(Arc::new(EebusAdapter::new(
            config.display_name(),
            ctx.bridge_for(config)?,
            Arc::clone(&ctx.sink),
            config.reconnect_policy(),
            params,
            Arc::new(SimulatedHeatPump::new()),
        )))
    }
}

pub struct TcpFactory;

#[async_trait]
impl AdapterFactory for TcpFactory {
    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Tcpip]
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        TcpParams::from_value(&config.parameters).map(|_| ())
    }

    async fn create(
        &self,
        config: &DeviceConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn DeviceAdapter>> {
        let params = TcpParams::from_value(&config.parameters)?;
        let link: Arc<dyn super::tcpip::StreamLink> = if config.mock_mode {
            Arc::new(EchoStream::new())
        } else {
            Arc::new(tcp_link(&params))
        };
        Ok(Arc::new(TcpAdapter::new(
            config.display_name(),
            ctx.bridge_for(config)?,
            Arc::clone(&ctx.sink),
            config.reconnect_policy(),
            params,
            link,
        )))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::core::mapping::MappingRule;
    use gridlink_model::{DeviceType, FieldValue, Reading};

    fn device(id: u32, device_type: DeviceType, protocol: Protocol) -> DeviceConfig {
        DeviceConfig {
            mock_mode: true,
            ..DeviceConfig::new(id, device_type, protocol)
        }
    }

    #[test]
    fn test_default_registry_covers_all_protocols() {
        let registry = create_default_registry();
        assert_eq!(registry.protocols().len(), 5);
        assert!(registry.get(Protocol::Sunspec).is_some());
    }

    #[tokio::test]
    async fn test_sunspec_uses_modbus_adapter() {
        let registry = create_default_registry();
        let ctx = AdapterContext::new(Arc::new(MemoryBus::new()));
        let config = device(3, DeviceType::SolarInverter, Protocol::Sunspec);
        let adapter = registry.create(&config, &ctx).await.unwrap();
        assert_eq!(adapter.identity().protocol, Protocol::Sunspec);
        assert_eq!(adapter.device_info().details["port"], 502);
    }

    #[tokio::test]
    async fn test_real_mode_requires_transport() {
        let registry = create_default_registry();
        let ctx = AdapterContext::new(Arc::new(MemoryBus::new()));
        let config = DeviceConfig::new(4, DeviceType::EvCharger, Protocol::Ocpp);
        let err = registry.create(&config, &ctx).await.err().unwrap();
        assert!(matches!(err, BridgeError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_injected_function_and_bad_rules() {
        let registry = create_default_registry();
        let double: CustomFn = Arc::new(|v: &FieldValue| v.as_f64().map(|n| FieldValue::Number(n * 2.0)));
        let ctx = AdapterContext::new(Arc::new(MemoryBus::new())).with_function("double", double);

        let mut config = device(5, DeviceType::Meter, Protocol::Tcpip);
        config.mapping = Some(vec![MappingRule::custom("raw", "doubled", "double")]);
        let adapter = registry.create(&config, &ctx).await.unwrap();
        let mapped = adapter
            .bridge()
            .mapping()
            .apply(&Reading::new().with_field("raw", 21.0));
        assert_eq!(mapped.get("doubled"), Some(&FieldValue::Number(42.0)));

        config.mapping = Some(vec![MappingRule::custom("raw", "x", "missing_fn")]);
        let err = registry.create(&config, &ctx).await.err().unwrap();
        assert!(matches!(err, BridgeError::ConfigError(_)));
    }
}
