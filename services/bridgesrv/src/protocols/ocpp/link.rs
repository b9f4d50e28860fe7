//! Charge point links
//!
//! The adapter drives a charge point through `ChargePointLink`. The OCPP-J
//! websocket stack lives behind this trait; `SimulatedChargePoint` stands in
//! for it in mock mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{BridgeError, Result};

#[async_trait]
pub trait ChargePointLink: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self);

    async fn remote_start(&self, connector_id: u32, id_tag: &str) -> Result<()>;

    async fn remote_stop(&self, connector_id: u32) -> Result<()>;

    /// Cumulative energy register of a connector, Wh
    async fn meter_value(&self, connector_id: u32) -> Result<f64>;

    async fn change_configuration(&self, key: &str, value: &str) -> Result<()>;
}

struct ConnectorMeter {
    energy_wh: f64,
    charging: bool,
    last_sample: Instant,
}

/// In-process charge point that accrues energy while connectors charge
pub struct SimulatedChargePoint {
    power_w: f64,
    meters: Mutex<HashMap<u32, ConnectorMeter>>,
    configuration: Mutex<HashMap<String, String>>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    connect_failures: AtomicU32,
    reject_starts: AtomicBool,
}

impl SimulatedChargePoint {
    pub fn new(connectors: u32, power_w: f64) -> Self {
        let now = Instant::now();
        let meters = (1..=connectors)
            .map(|id| {
                (
                    id,
                    ConnectorMeter {
                        energy_wh: 0.0,
                        charging: false,
                        last_sample: now,
                    },
                )
            })
            .collect();
        Self {
            power_w,
            meters: Mutex::new(meters),
            configuration: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            reject_starts: AtomicBool::new(false),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Remote start requests are refused while set
    pub fn set_reject_starts(&self, reject: bool) {
        self.reject_starts.store(reject, Ordering::SeqCst);
    }

    /// Drop the websocket as if the charge point went away
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn configuration(&self, key: &str) -> Option<String> {
        self.configuration.lock().get(key).cloned()
    }

    fn check_link(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::connection("charge point link closed"))
        }
    }

    fn with_meter<T>(
        &self,
        connector_id: u32,
        f: impl FnOnce(&mut ConnectorMeter) -> T,
    ) -> Result<T> {
        let mut meters = self.meters.lock();
        let meter = meters
            .get_mut(&connector_id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown connector {connector_id}")))?;
        let now = Instant::now();
        if meter.charging {
            let hours = now.duration_since(meter.last_sample).as_secs_f64() / 3600.0;
            meter.energy_wh += self.power_w * hours;
        }
        meter.last_sample = now;
        Ok(f(meter))
    }
}

#[async_trait]
impl ChargePointLink for SimulatedChargePoint {
    async fn open(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("charge point unreachable"));
        }
        let pending = self.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::connection("simulated websocket handshake failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn remote_start(&self, connector_id: u32, id_tag: &str) -> Result<()> {
        self.check_link()?;
        if self.reject_starts.load(Ordering::SeqCst) {
            return Err(BridgeError::protocol(format!(
                "RemoteStartTransaction rejected for {id_tag}"
            )));
        }
        self.with_meter(connector_id, |meter| meter.charging = true)
    }

    async fn remote_stop(&self, connector_id: u32) -> Result<()> {
        self.check_link()?;
        self.with_meter(connector_id, |meter| meter.charging = false)
    }

    async fn meter_value(&self, connector_id: u32) -> Result<f64> {
        self.check_link()?;
        self.with_meter(connector_id, |meter| meter.energy_wh)
    }

    async fn change_configuration(&self, key: &str, value: &str) -> Result<()> {
        self.check_link()?;
        self.configuration
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
