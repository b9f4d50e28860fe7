//! Modbus TCP adapter (also serves SunSpec devices)
//!
//! Register map driven: each configured register is read on every scan and
//! decoded with the register codec into a native reading field.

pub mod adapter;
pub mod transport;

use gridlink_comlink::{ByteOrder, DataType};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, ErrorExt, Result};

pub use adapter::ModbusAdapter;
pub use transport::{RegisterTransport, SimulatedRegisters, TcpRegisterTransport};

/// Modbus register table a value lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
    Coil,
}

/// One register mapping entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    /// Native field name the decoded value is stored under
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub kind: RegisterKind,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Register-level scale, applied before mapping rules (0 or 1 = none)
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Words for `string` registers
    #[serde(default)]
    pub words: Option<u16>,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

impl RegisterSpec {
    pub fn new(name: impl Into<String>, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address,
            kind: RegisterKind::Holding,
            data_type,
            byte_order: ByteOrder::BigEndian,
            scale: 0.0,
            offset: 0.0,
            words: None,
            writable: true,
        }
    }

    pub fn with_kind(mut self, kind: RegisterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn register_count(&self) -> u16 {
        gridlink_comlink::register_count(self.data_type, self.words.unwrap_or(1))
    }

    fn effective_scale(&self) -> f64 {
        if self.scale == 0.0 {
            1.0
        } else {
            self.scale
        }
    }
}

/// Connection and scan parameters of a Modbus device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusParams {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub scan_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub registers: Vec<RegisterSpec>,
}

impl Default for ModbusParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            scan_interval_ms: 1000,
            request_timeout_ms: 3000,
            registers: Vec::new(),
        }
    }
}

impl ModbusParams {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let params: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone())
                .config_error("Invalid Modbus parameters")?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::config("Modbus host is empty"));
        }
        if self.scan_interval_ms == 0 {
            return Err(BridgeError::config("scan_interval_ms must be positive"));
        }
        let mut names = std::collections::HashSet::new();
        for register in &self.registers {
            if !names.insert(register.name.as_str()) {
                return Err(BridgeError::config(format!(
                    "Duplicate register name '{}'",
                    register.name
                )));
            }
            if register.kind == RegisterKind::Coil && register.data_type != DataType::Coil {
                return Err(BridgeError::config(format!(
                    "Register '{}' is a coil but typed {:?}",
                    register.name, register.data_type
                )));
            }
        }
        Ok(())
    }

    pub fn register(&self, name: &str) -> Option<&RegisterSpec> {
        self.registers.iter().find(|r| r.name == name)
    }
}
