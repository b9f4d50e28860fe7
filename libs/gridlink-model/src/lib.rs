//! GridLink Model Library
//!
//! Canonical types shared by every GridLink component:
//!
//! - `device`: device identity, device types, field protocols and device status
//! - `reading`: native readings produced by protocol adapters
//! - `message`: the canonical bus envelope and QoS levels
//! - `topics`: bus topic builders for the canonical and type-specific topics

pub mod device;
pub mod error;
pub mod message;
pub mod reading;
pub mod topics;

// Re-exports for convenience
pub use device::{DeviceId, DeviceIdentity, DeviceStatus, DeviceType, Protocol, ProtocolFamily};
pub use error::{ModelError, Result};
pub use message::{
    CanonicalMessage, CommandRequest, CommandResponseBody, MessageBody, MessageType, QoS,
    StatusBody, TelemetryBody, TelemetryMetadata,
};
pub use reading::{FieldValue, Reading};
