//! Error handling for the Bridge Service
//!
//! Errors fall into four operational classes:
//! - connection class (connection, timeout, not connected, I/O): retried through backoff
//! - protocol: logged, the single read cycle is skipped
//! - validation: returned synchronously to the command caller, never retried
//! - exhaustion: reported through a status message while the device cools down

use gridlink_comlink::CodecError;
use gridlink_model::{DeviceId, ModelError};
use thiserror::Error;

/// Bridge Service Error Type
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport-level failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation timeout (treated like a connection error)
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Malformed or unexpected device response
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Caller-supplied parameter rejected
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Maximum reconnect attempts reached
    #[error("Reconnect attempts exhausted after {attempts} attempt(s), cooling down for {cooldown_ms} ms")]
    ExhaustedError { attempts: u32, cooldown_ms: u64 },

    /// Message bus errors
    #[error("Bus error: {0}")]
    BusError(String),

    /// Device not registered
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Data handling errors (serialization, parsing, conversion)
    #[error("Data error: {0}")]
    DataError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the Bridge Service
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        BridgeError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BridgeError::TimeoutError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        BridgeError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::ProtocolError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BridgeError::ValidationError(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        BridgeError::BusError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        BridgeError::DataError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BridgeError::InternalError(msg.into())
    }

    pub fn not_connected() -> Self {
        BridgeError::ConnectionError("Not connected".to_string())
    }

    pub fn exhausted(attempts: u32, cooldown_ms: u64) -> Self {
        BridgeError::ExhaustedError {
            attempts,
            cooldown_ms,
        }
    }

    /// Errors that mean the link is gone and should feed reconnect/backoff
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::TimeoutError(_) | Self::IoError(_)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationError(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "BRIDGESRV_CONFIG_ERROR",
            Self::ConnectionError(_) => "BRIDGESRV_CONNECTION_ERROR",
            Self::TimeoutError(_) => "BRIDGESRV_TIMEOUT",
            Self::IoError(_) => "BRIDGESRV_IO_ERROR",
            Self::ProtocolError(_) => "BRIDGESRV_PROTOCOL_ERROR",
            Self::ValidationError(_) => "BRIDGESRV_VALIDATION_ERROR",
            Self::ExhaustedError { .. } => "BRIDGESRV_EXHAUSTION_ERROR",
            Self::BusError(_) => "BRIDGESRV_BUS_ERROR",
            Self::DeviceNotFound(_) => "BRIDGESRV_DEVICE_NOT_FOUND",
            Self::DataError(_) => "BRIDGESRV_DATA_ERROR",
            Self::InternalError(_) => "BRIDGESRV_INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::DataError(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::DataError(format!("YAML: {err}"))
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InsufficientData { .. } => BridgeError::ProtocolError(err.to_string()),
            CodecError::OutOfRange { .. } | CodecError::TypeMismatch { .. } => {
                BridgeError::ValidationError(err.to_string())
            },
        }
    }
}

impl From<ModelError> for BridgeError {
    fn from(err: ModelError) -> Self {
        BridgeError::ValidationError(err.to_string())
    }
}

impl From<common::ConfigLoadError> for BridgeError {
    fn from(err: common::ConfigLoadError) -> Self {
        BridgeError::ConfigError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        BridgeError::TimeoutError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn validation_error(self, msg: &str) -> Result<T>;
    fn data_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BridgeError::ConfigError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BridgeError::ConnectionError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BridgeError::ProtocolError(format!("{msg}: {e}")))
    }

    fn validation_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BridgeError::ValidationError(format!("{msg}: {e}")))
    }

    fn data_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BridgeError::DataError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_connection_class() {
        assert!(BridgeError::connection("refused").is_connection_class());
        assert!(BridgeError::timeout("5s").is_connection_class());
        assert!(BridgeError::not_connected().is_connection_class());
        assert!(!BridgeError::protocol("short read").is_connection_class());
        assert!(!BridgeError::validation("35 °C").is_connection_class());
        assert!(!BridgeError::exhausted(5, 60_000).is_connection_class());
    }

    #[test]
    fn test_codec_error_mapping() {
        let short = CodecError::InsufficientData {
            data_type: "float32",
            expected: 2,
            actual: 1,
        };
        assert!(matches!(
            BridgeError::from(short),
            BridgeError::ProtocolError(_)
        ));
        let range = CodecError::OutOfRange {
            value: "70000".into(),
            data_type: "uint16",
        };
        assert!(BridgeError::from(range).is_validation());
    }

    #[test]
    fn test_error_ext_context() {
        let result: std::result::Result<(), &str> = Err("boom");
        let err = result.connection_error("Dev1 connect").unwrap_err();
        assert_eq!(err.to_string(), "Connection error: Dev1 connect: boom");
        assert_eq!(err.error_code(), "BRIDGESRV_CONNECTION_ERROR");
    }

    #[test]
    fn test_exhausted_message() {
        let err = BridgeError::exhausted(5, 60_000);
        assert!(err.to_string().contains("5 attempt"));
        assert_eq!(err.error_code(), "BRIDGESRV_EXHAUSTION_ERROR");
    }
}
