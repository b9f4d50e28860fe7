//! Core bridge components
//!
//! - **`config`** - layered service and device configuration
//! - **`mapping`** - native field to canonical field rules
//! - **`bridge`** - canonical message construction and publishing
//! - **`manager`** - per-family adapter managers and the device registry
//! - **`bootstrap`** - command line and startup helpers

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod manager;
pub mod mapping;

pub use bridge::{BridgePolicy, ProtocolBridge};
pub use config::{AppConfig, BusConfig, BusKind, DeviceConfig};
pub use manager::{AdapterManager, DeviceRegistry};
pub use mapping::{MappingEngine, MappingRule, Transformation};
