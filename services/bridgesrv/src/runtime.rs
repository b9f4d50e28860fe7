//! Runtime orchestration
//!
//! Connection lifecycle with backoff and cooldown, and the service runtime
//! that wires devices to the bus.

pub mod lifecycle;
pub mod reconnect;

pub use lifecycle::BridgeService;
pub use reconnect::{ConnectionController, ConnectionPhase, Connector, ReconnectPolicy};
