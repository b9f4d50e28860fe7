//! Shared fixtures for integration tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use bridgesrv::bus::MemoryBus;
use bridgesrv::core::bridge::{BridgePolicy, ProtocolBridge};
use bridgesrv::core::mapping::MappingEngine;
use gridlink_model::{DeviceId, DeviceIdentity, DeviceType, Protocol};

pub fn bridge(
    bus: &Arc<MemoryBus>,
    device_id: DeviceId,
    device_type: DeviceType,
    protocol: Protocol,
) -> Arc<ProtocolBridge> {
    Arc::new(ProtocolBridge::new(
        DeviceIdentity::new(device_id, device_type, protocol),
        bus.clone(),
        MappingEngine::for_device_type(device_type),
        BridgePolicy::default(),
    ))
}

/// `status` field of every status message published for the device, in order
pub fn statuses(bus: &MemoryBus, device_id: DeviceId) -> Vec<String> {
    bus.published_on(&gridlink_model::topics::status(device_id))
        .iter()
        .map(|m| {
            let body: serde_json::Value = m.json().unwrap();
            body["status"].as_str().unwrap().to_string()
        })
        .collect()
}

pub fn count(statuses: &[String], status: &str) -> usize {
    statuses.iter().filter(|s| s.as_str() == status).count()
}

/// Advance paused time in small steps until `done` holds
pub async fn advance_until(step: Duration, limit: Duration, mut done: impl FnMut() -> bool) {
    let mut waited = Duration::ZERO;
    while !done() {
        assert!(waited < limit, "condition not reached within {limit:?}");
        tokio::time::sleep(step).await;
        waited += step;
    }
}

pub fn approx(value: &serde_json::Value, expected: f64) -> bool {
    value
        .as_f64()
        .map(|v| (v - expected).abs() < 1e-9)
        .unwrap_or(false)
}
