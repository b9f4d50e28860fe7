//! Model error types

use thiserror::Error;

/// Errors raised while parsing model values from external input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Unknown device type name
    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    /// Unknown protocol name
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// QoS level outside 0..=2
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

pub type Result<T> = std::result::Result<T, ModelError>;
