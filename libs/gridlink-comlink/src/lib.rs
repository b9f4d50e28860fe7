//! GridLink Communication Link Library
//!
//! Protocol-agnostic register codec used by register-based adapters.
//!
//! # Architecture
//!
//! - **Bytes Utilities**: byte/word order handling and register ↔ number conversions
//! - **Codec**: typed decode/encode of register blocks (`int16`, `uint16`, `int32`,
//!   `uint32`, `float32`, `coil`, `generic`, fixed-length strings) with optional
//!   linear scaling
//!
//! All functions are pure; malformed input is reported through [`CodecError`],
//! never by panicking.

pub mod bytes;
pub mod codec;
pub mod error;

// Re-export core types
pub use bytes::ByteOrder;
pub use codec::{
    decode, decode_coils, decode_scaled, encode, encode_f64, encode_scaled, encode_string,
    register_count, DataType, RegisterValue,
};
pub use error::{CodecError, Result};
