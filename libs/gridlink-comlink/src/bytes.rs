//! Binary data processing utilities
//!
//! Provides byte order handling and numeric type conversions for
//! register-based protocols.
//!
//! # Design Principles
//!
//! - **Protocol-agnostic**: no Modbus-specific framing
//! - **Type-safe**: `ByteOrder` enum prevents string typos
//! - **Total**: every conversion is defined for every byte order

pub mod byte_order;
pub mod conversions;

pub use byte_order::ByteOrder;
pub use conversions::*;
