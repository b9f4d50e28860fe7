//! Register transports
//!
//! `TcpRegisterTransport` speaks Modbus TCP through tokio-modbus.
//! `SimulatedRegisters` is an in-memory register bank used for mock mode and
//! tests, with failure injection for connect and read paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gridlink_comlink::{encode_f64, encode_scaled, DataType};
use parking_lot::Mutex;
use rand::Rng;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use super::{RegisterKind, RegisterSpec};
use crate::error::{BridgeError, Result};

/// Word-level access to a Modbus device
///
/// Transport failures are connection-class errors; Modbus exceptions and
/// short responses are protocol errors.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self);

    async fn read_registers(&self, kind: RegisterKind, address: u16, count: u16)
        -> Result<Vec<u16>>;

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>>;

    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()>;

    async fn write_coil(&self, address: u16, value: bool) -> Result<()>;
}

// ============================================================================
// Modbus TCP
// ============================================================================

pub struct TcpRegisterTransport {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    context: tokio::sync::Mutex<Option<client::Context>>,
}

impl TcpRegisterTransport {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
            context: tokio::sync::Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.unit_id)
    }
}

/// Flatten tokio-modbus' nested result into the bridge error classes
fn classify<T>(
    endpoint: &str,
    op: &str,
    result: std::result::Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T> {
    match result {
        Err(_) => Err(BridgeError::timeout(format!("{endpoint} {op} timed out"))),
        Ok(Err(e)) => Err(BridgeError::connection(format!("{endpoint} {op}: {e}"))),
        Ok(Ok(Err(exception))) => Err(BridgeError::protocol(format!(
            "{endpoint} {op}: exception {exception:?}"
        ))),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

#[async_trait]
impl RegisterTransport for TcpRegisterTransport {
    async fn open(&self) -> Result<()> {
        let socket_addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| BridgeError::connection(format!("Resolve {} failed: {e}", self.host)))?
            .next()
            .ok_or_else(|| BridgeError::connection(format!("No address for {}", self.host)))?;

        let ctx = tcp::connect_slave(socket_addr, Slave(self.unit_id))
            .await
            .map_err(|e| BridgeError::connection(format!("{}: {e}", self.endpoint())))?;

        *self.context.lock().await = Some(ctx);
        info!("Modbus link up: {}", self.endpoint());
        Ok(())
    }

    async fn close(&self) {
        // dropping the context closes the socket
        if self.context.lock().await.take().is_some() {
            debug!("Modbus link closed: {}", self.endpoint());
        }
    }

    async fn read_registers(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(BridgeError::not_connected)?;
        let endpoint = self.endpoint();
        let words = match kind {
            RegisterKind::Holding => classify(
                &endpoint,
                "read holding",
                tokio::time::timeout(self.timeout, ctx.read_holding_registers(address, count))
                    .await,
            )?,
            RegisterKind::Input => classify(
                &endpoint,
                "read input",
                tokio::time::timeout(self.timeout, ctx.read_input_registers(address, count)).await,
            )?,
            RegisterKind::Coil => {
                return Err(BridgeError::internal("coils are read with read_coils"));
            },
        };
        if words.len() < count as usize {
            return Err(BridgeError::protocol(format!(
                "{endpoint} returned {} of {count} registers at {address}",
                words.len()
            )));
        }
        Ok(words)
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(BridgeError::not_connected)?;
        classify(
            &self.endpoint(),
            "read coils",
            tokio::time::timeout(self.timeout, ctx.read_coils(address, count)).await,
        )
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(BridgeError::not_connected)?;
        let endpoint = self.endpoint();
        match values {
            [single] => classify(
                &endpoint,
                "write register",
                tokio::time::timeout(self.timeout, ctx.write_single_register(address, *single))
                    .await,
            ),
            many => classify(
                &endpoint,
                "write registers",
                tokio::time::timeout(self.timeout, ctx.write_multiple_registers(address, many))
                    .await,
            ),
        }
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or_else(BridgeError::not_connected)?;
        classify(
            &self.endpoint(),
            "write coil",
            tokio::time::timeout(self.timeout, ctx.write_single_coil(address, value)).await,
        )
    }
}

// ============================================================================
// Simulated register bank
// ============================================================================

#[derive(Default)]
pub struct SimulatedRegisters {
    holding: Mutex<HashMap<u16, u16>>,
    input: Mutex<HashMap<u16, u16>>,
    coils: Mutex<HashMap<u16, bool>>,
    exceptions: Mutex<HashSet<u16>>,
    connected: AtomicBool,
    unreachable: AtomicBool,
    connect_failures: AtomicU32,
    drop_on_next_read: AtomicBool,
    connect_calls: AtomicU32,
}

impl SimulatedRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bank pre-filled with plausible values for each register
    pub fn seeded(registers: &[RegisterSpec]) -> Self {
        let bank = Self::new();
        let mut rng = rand::thread_rng();
        for spec in registers {
            let nominal = plausible_value(&spec.name);
            let value = nominal * rng.gen_range(0.95..=1.05);
            match spec.kind {
                RegisterKind::Coil => bank.set_coil(spec.address, true),
                kind => {
                    let words = match spec.data_type {
                        DataType::String => gridlink_comlink::encode_string(
                            "SIM",
                            spec.register_count() as usize,
                            spec.byte_order,
                        ),
                        DataType::Coil => encode_f64(1.0, DataType::Coil, spec.byte_order),
                        data_type => encode_scaled(
                            value,
                            data_type,
                            spec.byte_order,
                            spec.effective_scale(),
                            spec.offset,
                        ),
                    };
                    if let Ok(words) = words {
                        bank.set_words(kind, spec.address, &words);
                    }
                },
            }
        }
        bank
    }

    pub fn set_words(&self, kind: RegisterKind, address: u16, words: &[u16]) {
        let mut table = match kind {
            RegisterKind::Input => self.input.lock(),
            _ => self.holding.lock(),
        };
        for (i, word) in words.iter().enumerate() {
            table.insert(address.wrapping_add(i as u16), *word);
        }
    }

    pub fn set_holding(&self, address: u16, words: &[u16]) {
        self.set_words(RegisterKind::Holding, address, words);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.holding.lock().get(&address).copied()
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.coils.lock().insert(address, value);
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.lock().get(&address).copied()
    }

    /// Reads starting at `address` fail with a Modbus exception
    pub fn set_exception(&self, address: u16) {
        self.exceptions.lock().insert(address);
    }

    /// Every connect fails while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `n` connects fail
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// The next read reports a broken link
    pub fn drop_link(&self) {
        self.drop_on_next_read.store(true, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<()> {
        if self.drop_on_next_read.swap(false, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(BridgeError::connection("simulated link reset"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BridgeError::not_connected());
        }
        Ok(())
    }
}

fn plausible_value(name: &str) -> f64 {
    let name = name.to_lowercase();
    if name.contains("soc") || name.contains("state_of_charge") {
        80.0
    } else if name.contains("temp") {
        24.0
    } else if name.contains("voltage") {
        230.0
    } else if name.contains("energy") {
        12_500.0
    } else if name.contains("power") {
        2500.0
    } else if name.contains("current") {
        10.0
    } else {
        1.0
    }
}

#[async_trait]
impl RegisterTransport for SimulatedRegisters {
    async fn open(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("simulated device unreachable"));
        }
        let pending = self.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::connection("simulated connect failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_registers(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.check_link()?;
        if self.exceptions.lock().contains(&address) {
            return Err(BridgeError::protocol(format!(
                "exception IllegalDataAddress at {address}"
            )));
        }
        let table = match kind {
            RegisterKind::Input => self.input.lock(),
            _ => self.holding.lock(),
        };
        Ok((0..count)
            .map(|i| {
                table
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        self.check_link()?;
        let coils = self.coils.lock();
        Ok((0..count)
            .map(|i| {
                coils
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.check_link()?;
        self.set_holding(address, values);
        Ok(())
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<()> {
        self.check_link()?;
        self.set_coil(address, value);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use gridlink_comlink::{decode, ByteOrder};

    #[tokio::test]
    async fn test_simulated_failure_injection() {
        let bank = SimulatedRegisters::new();
        bank.fail_next_connects(1);
        assert!(bank.open().await.unwrap_err().is_connection_class());
        bank.open().await.unwrap();
        assert_eq!(bank.connect_calls(), 2);

        bank.set_holding(10, &[42]);
        assert_eq!(
            bank.read_registers(RegisterKind::Holding, 10, 1)
                .await
                .unwrap(),
            vec![42]
        );

        bank.drop_link();
        let err = bank
            .read_registers(RegisterKind::Holding, 10, 1)
            .await
            .unwrap_err();
        assert!(err.is_connection_class());
        assert!(!bank.is_open());
    }

    #[tokio::test]
    async fn test_simulated_exception_is_protocol_error() {
        let bank = SimulatedRegisters::new();
        bank.open().await.unwrap();
        bank.set_exception(99);
        let err = bank
            .read_registers(RegisterKind::Input, 99, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_seeded_values_decode_in_range() {
        let specs = vec![
            RegisterSpec::new("state_of_charge", 0, DataType::Uint16).with_scale(0.01, 0.0),
            RegisterSpec::new("power_watts", 2, DataType::Float32)
                .with_byte_order(ByteOrder::BigEndianSwap),
        ];
        let bank = SimulatedRegisters::seeded(&specs);
        bank.open().await.unwrap();

        let soc_raw = bank
            .read_registers(RegisterKind::Holding, 0, 1)
            .await
            .unwrap();
        let soc = decode(&soc_raw, DataType::Uint16, ByteOrder::BigEndian)
            .unwrap()
            .as_f64()
            .unwrap()
            * 0.01;
        assert!((76.0..=84.0).contains(&soc));

        let power_raw = bank
            .read_registers(RegisterKind::Holding, 2, 2)
            .await
            .unwrap();
        let power = decode(&power_raw, DataType::Float32, ByteOrder::BigEndianSwap)
            .unwrap()
            .as_f64()
            .unwrap();
        assert!((2375.0..=2625.0).contains(&power));
    }
}
