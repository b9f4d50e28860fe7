//! Register codec error types

use thiserror::Error;

/// Result type for gridlink-comlink operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Register codec errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Fewer registers than the data type needs
    #[error("Insufficient data: {data_type} needs {expected} register(s), got {actual}")]
    InsufficientData {
        data_type: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Value cannot be represented by the target data type
    #[error("Value {value} out of range for {data_type}")]
    OutOfRange { value: String, data_type: &'static str },

    /// Value kind does not fit the data type (e.g. text into int16)
    #[error("Type mismatch: cannot encode {value} as {data_type}")]
    TypeMismatch { value: String, data_type: &'static str },
}
