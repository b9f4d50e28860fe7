//! GridLink Device Bridge (bridgesrv)
//!
//! Connects field devices of an energy site (inverters, batteries, EV
//! chargers, heat pumps, meters) over their native protocols and republishes
//! their data as canonical JSON messages on a publish/subscribe bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────────┐   ┌───────────┐
//! │  AppConfig   │──►│ Factory Registry│──►│  Device Adapters │──►│  Protocol │──► bus
//! │ (figment)    │   │ (per protocol)  │   │ Modbus/OCPP/...  │   │  Bridge   │
//! └──────────────┘   └─────────────────┘   └──────────────────┘   └───────────┘
//!                                                   │                   ▲
//!                                                   ▼                   │
//!                                          ┌──────────────────┐  ┌──────────────┐
//!                                          │ Connection       │  │ Mapping      │
//!                                          │ Controller       │  │ Engine       │
//!                                          └──────────────────┘  └──────────────┘
//! ```
//!
//! - **`protocols`** - one adapter per device, speaking Modbus/SunSpec, OCPP,
//!   EEBus or raw TCP through a swappable link (real or simulated)
//! - **`runtime`** - reconnect backoff with cooldown, service runtime and
//!   command dispatch
//! - **`core`** - configuration, mapping rules, the bridge and the registry
//! - **`bus`** - in-memory and MQTT bus clients
//! - **`storage`** - reading persistence seam
//!
//! # Topics
//!
//! | Topic | Content |
//! |---|---|
//! | `devices/{id}/telemetry` | mapped readings |
//! | `devices/{id}/status` | online / offline / standby / error (retained) |
//! | `devices/{id}/commands/request` | `{commandId?, command, params}` |
//! | `devices/{id}/commands/response` | correlated result |
//! | `battery/{id}/soc`, `meter/{id}/reading`, ... | single-signal republish |

pub mod bus;
pub mod core;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod storage;

pub use error::{BridgeError, ErrorExt, Result};
