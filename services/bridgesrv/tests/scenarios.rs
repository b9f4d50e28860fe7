//! End-to-end device scenarios
//!
//! Each test drives a real adapter against a simulated device and observes
//! only what reaches the bus.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod support;

use std::sync::Arc;
use std::time::Duration;

use bridgesrv::bus::MemoryBus;
use bridgesrv::protocols::eebus::{EebusAdapter, EebusParams, OperationMode, SimulatedHeatPump};
use bridgesrv::protocols::modbus::{ModbusAdapter, ModbusParams, RegisterSpec, SimulatedRegisters};
use bridgesrv::protocols::DeviceAdapter;
use bridgesrv::runtime::reconnect::{ConnectionPhase, ReconnectPolicy};
use bridgesrv::storage::{MemorySink, NullSink};
use bridgesrv::BridgeError;
use gridlink_comlink::{encode_f64, ByteOrder, DataType};
use gridlink_model::{topics, DeviceStatus, DeviceType, Protocol, QoS};
use support::{advance_until, approx, bridge, count, statuses};

fn battery_params() -> ModbusParams {
    ModbusParams {
        scan_interval_ms: 60_000,
        registers: vec![
            RegisterSpec::new("state_of_charge", 0, DataType::Uint16),
            RegisterSpec::new("power_watts", 2, DataType::Int32),
            RegisterSpec::new("temp_celsius", 4, DataType::Int16).with_scale(0.1, 0.0),
        ],
        ..ModbusParams::default()
    }
}

#[tokio::test]
async fn battery_telemetry_is_scaled_and_soc_retained() {
    let bus = Arc::new(MemoryBus::new());
    let bank = Arc::new(SimulatedRegisters::new());
    bank.set_holding(0, &[8532]);
    bank.set_holding(
        2,
        &encode_f64(-2500.0, DataType::Int32, ByteOrder::BigEndian).unwrap(),
    );
    bank.set_holding(4, &encode_f64(255.0, DataType::Int16, ByteOrder::BigEndian).unwrap());

    let sink = Arc::new(MemorySink::new());
    let adapter = ModbusAdapter::new(
        "battery-1",
        bridge(&bus, 1, DeviceType::Battery, Protocol::Modbus),
        sink.clone(),
        ReconnectPolicy::default(),
        battery_params(),
        bank,
    );
    adapter.connect().await.unwrap();
    adapter
        .execute_command("read", &serde_json::Value::Null)
        .await
        .unwrap();

    let telemetry = bus.published_on(&topics::telemetry(1));
    let message: serde_json::Value = telemetry.last().unwrap().json().unwrap();
    assert_eq!(message["messageType"], "telemetry");
    assert_eq!(message["deviceId"], 1);
    assert_eq!(message["metadata"]["source"], "modbus");
    assert_eq!(message["metadata"]["deviceType"], "battery");
    assert!(approx(&message["readings"]["soc"], 85.32));
    assert!(approx(&message["readings"]["power"], -2.5));
    assert!(approx(&message["readings"]["temperature"], 25.5));

    let soc = bus.retained(&topics::battery_soc(1)).unwrap();
    assert!(soc.retain);
    assert_eq!(soc.qos, QoS::ExactlyOnce);
    let soc: serde_json::Value = soc.json().unwrap();
    assert!(approx(&soc["soc"], 85.32));

    // the native reading went to the sink untouched
    let stored = sink.readings_for(1);
    assert_eq!(stored.last().unwrap().get_f64("state_of_charge"), Some(8532.0));
    assert_eq!(sink.latest_status(1), Some(DeviceStatus::Online));

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhaustion_is_reported_once_per_run_then_attempts_reset() {
    let bus = Arc::new(MemoryBus::new());
    let bank = Arc::new(SimulatedRegisters::new());
    bank.set_unreachable(true);

    let policy = ReconnectPolicy {
        max_attempts: 5,
        base_backoff_ms: 1000,
        max_backoff_ms: 2000,
        ..ReconnectPolicy::default()
    };
    let adapter = ModbusAdapter::new(
        "battery-2",
        bridge(&bus, 2, DeviceType::Battery, Protocol::Modbus),
        Arc::new(NullSink),
        policy,
        battery_params(),
        bank.clone(),
    );

    let err = adapter.connect().await.unwrap_err();
    assert!(err.is_connection_class());

    let step = Duration::from_millis(100);
    let limit = Duration::from_secs(60);

    // first run: four failures, nothing reported yet
    advance_until(step, limit, || bank.connect_calls() >= 4).await;
    assert_eq!(count(&statuses(&bus, 2), "error"), 0);

    // the fifth failure ends the run: one error status, cooldown of 4 s
    advance_until(step, limit, || {
        adapter.device_info().lifecycle.phase == ConnectionPhase::CoolingDown
    })
    .await;
    assert_eq!(bank.connect_calls(), 5);
    assert_eq!(count(&statuses(&bus, 2), "error"), 1);

    let status = bus.retained(&topics::status(2)).unwrap();
    let status: serde_json::Value = status.json().unwrap();
    assert_eq!(status["details"]["reason"], "max_attempts_exceeded");
    assert_eq!(status["details"]["attempts"], 5);
    assert_eq!(status["details"]["cooldownMs"], 4000);

    // after the cooldown the counter starts over
    advance_until(step, limit, || bank.connect_calls() >= 6).await;
    assert_eq!(adapter.device_info().lifecycle.attempts, 1);

    advance_until(step, limit, || bank.connect_calls() >= 9).await;
    assert_eq!(count(&statuses(&bus, 2), "error"), 1);
    assert_eq!(adapter.device_info().lifecycle.stats.exhaustions, 1);

    // the fresh run is bounded the same way
    advance_until(step, limit, || {
        bank.connect_calls() >= 10
            && adapter.device_info().lifecycle.phase == ConnectionPhase::CoolingDown
    })
    .await;
    assert_eq!(bank.connect_calls(), 10);
    assert_eq!(count(&statuses(&bus, 2), "error"), 2);
    assert_eq!(adapter.device_info().lifecycle.stats.exhaustions, 2);

    // the device recovers once reachable again
    bank.set_unreachable(false);
    advance_until(step, limit, || adapter.is_connected()).await;
    assert_eq!(statuses(&bus, 2).last().unwrap(), "online");

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn out_of_range_setpoint_changes_nothing() {
    let bus = Arc::new(MemoryBus::new());
    let heat_pump = Arc::new(SimulatedHeatPump::new());
    let adapter = EebusAdapter::new(
        "heat-pump-3",
        bridge(&bus, 3, DeviceType::HeatPump, Protocol::Eebus),
        Arc::new(NullSink),
        ReconnectPolicy::default(),
        EebusParams {
            poll_interval_ms: 60_000,
            ..EebusParams::default()
        },
        heat_pump.clone(),
    );
    adapter.connect().await.unwrap();
    adapter.set_operation_mode("heat").await.unwrap();

    let status_count = statuses(&bus, 3).len();
    let writes = heat_pump.writes();
    let target = adapter.target_temperature();

    let err = adapter.set_target_temperature(35.0).await.unwrap_err();
    assert!(matches!(err, BridgeError::ValidationError(_)));

    assert_eq!(adapter.current_mode(), OperationMode::Heat);
    assert_eq!(adapter.target_temperature(), target);
    assert_eq!(statuses(&bus, 3).len(), status_count);
    assert_eq!(heat_pump.writes(), writes);
    assert!(adapter.is_connected());

    adapter.disconnect().await.unwrap();
}
