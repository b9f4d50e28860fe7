//! Typed register codec
//!
//! Converts blocks of 16-bit registers to and from typed values according to a
//! declared [`DataType`] and [`ByteOrder`]. For every representable value,
//! `decode(&encode(v, t, o)?, t, o)? == v`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bytes::{
    f32_to_regs, i16_to_reg, i32_to_regs, reg_to_i16, reg_to_u16, regs_to_f32, regs_to_i32,
    regs_to_string, regs_to_u32, string_to_regs, u16_to_reg, u32_to_regs, ByteOrder,
};
use crate::error::{CodecError, Result};

/// Declared register data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    /// Boolean; one coil or one register where non-zero means true
    #[serde(alias = "bool", alias = "boolean")]
    Coil,
    /// Raw register value without interpretation
    Generic,
    /// Fixed-length ASCII text, two characters per register
    String,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Float32 => "float32",
            Self::Coil => "coil",
            Self::Generic => "generic",
            Self::String => "string",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::String | Self::Coil)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of registers a value of `data_type` occupies
///
/// `string_words` is only consulted for [`DataType::String`] and is at least 1.
pub fn register_count(data_type: DataType, string_words: u16) -> u16 {
    match data_type {
        DataType::Int16 | DataType::Uint16 | DataType::Coil | DataType::Generic => 1,
        DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
        DataType::String => string_words.max(1),
    }
}

/// Decoded register value
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl RegisterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{:?}", v),
        }
    }
}

fn require(regs: &[u16], data_type: DataType, expected: usize) -> Result<()> {
    if regs.len() < expected {
        return Err(CodecError::InsufficientData {
            data_type: data_type.as_str(),
            expected,
            actual: regs.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a register block
///
/// For [`DataType::String`] every register in `regs` is part of the text.
pub fn decode(regs: &[u16], data_type: DataType, order: ByteOrder) -> Result<RegisterValue> {
    let needed = match data_type {
        DataType::String => 1,
        other => register_count(other, 1) as usize,
    };
    require(regs, data_type, needed)?;

    let value = match data_type {
        DataType::Int16 => RegisterValue::Int(i64::from(reg_to_i16(regs[0], order))),
        DataType::Uint16 => RegisterValue::Int(i64::from(reg_to_u16(regs[0], order))),
        DataType::Generic => RegisterValue::Int(i64::from(regs[0])),
        DataType::Coil => RegisterValue::Bool(regs[0] != 0),
        DataType::Int32 => RegisterValue::Int(i64::from(regs_to_i32(&[regs[0], regs[1]], order))),
        DataType::Uint32 => {
            RegisterValue::Int(i64::from(regs_to_u32(&[regs[0], regs[1]], order)))
        },
        DataType::Float32 => {
            RegisterValue::Float(f64::from(regs_to_f32(&[regs[0], regs[1]], order)))
        },
        DataType::String => RegisterValue::Text(regs_to_string(regs, order)),
    };
    Ok(value)
}

/// Decode and apply `value * scale + offset`
pub fn decode_scaled(
    regs: &[u16],
    data_type: DataType,
    order: ByteOrder,
    scale: f64,
    offset: f64,
) -> Result<f64> {
    let value = decode(regs, data_type, order)?;
    value
        .as_f64()
        .map(|raw| raw * scale + offset)
        .ok_or_else(|| CodecError::TypeMismatch {
            value: value.to_string(),
            data_type: data_type.as_str(),
        })
}

/// Decode the first coil of a coil read
pub fn decode_coils(coils: &[bool]) -> Result<RegisterValue> {
    coils
        .first()
        .map(|c| RegisterValue::Bool(*c))
        .ok_or(CodecError::InsufficientData {
            data_type: "coil",
            expected: 1,
            actual: 0,
        })
}

// ============================================================================
// Encode
// ============================================================================

fn out_of_range(value: impl fmt::Display, data_type: DataType) -> CodecError {
    CodecError::OutOfRange {
        value: value.to_string(),
        data_type: data_type.as_str(),
    }
}

fn integral(value: f64, data_type: DataType, min: f64, max: f64) -> Result<i64> {
    if !value.is_finite() {
        return Err(out_of_range(value, data_type));
    }
    let rounded = value.round();
    if rounded < min || rounded > max {
        return Err(out_of_range(value, data_type));
    }
    Ok(rounded as i64)
}

/// Encode a numeric value; integer types round to the nearest integer
///
/// 32-bit types are split into two 16-bit words according to `order`.
pub fn encode_f64(value: f64, data_type: DataType, order: ByteOrder) -> Result<Vec<u16>> {
    let regs = match data_type {
        DataType::Int16 => {
            let v = integral(value, data_type, f64::from(i16::MIN), f64::from(i16::MAX))?;
            vec![i16_to_reg(v as i16, order)]
        },
        DataType::Uint16 => {
            let v = integral(value, data_type, 0.0, f64::from(u16::MAX))?;
            vec![u16_to_reg(v as u16, order)]
        },
        DataType::Generic => {
            let v = integral(value, data_type, 0.0, f64::from(u16::MAX))?;
            vec![v as u16]
        },
        DataType::Int32 => {
            let v = integral(value, data_type, f64::from(i32::MIN), f64::from(i32::MAX))?;
            i32_to_regs(v as i32, order).to_vec()
        },
        DataType::Uint32 => {
            let v = integral(value, data_type, 0.0, f64::from(u32::MAX))?;
            u32_to_regs(v as u32, order).to_vec()
        },
        DataType::Float32 => {
            if value.is_finite() && value.abs() > f64::from(f32::MAX) {
                return Err(out_of_range(value, data_type));
            }
            f32_to_regs(value as f32, order).to_vec()
        },
        DataType::Coil => vec![u16::from(value != 0.0)],
        DataType::String => {
            return Err(CodecError::TypeMismatch {
                value: value.to_string(),
                data_type: data_type.as_str(),
            })
        },
    };
    Ok(regs)
}

/// Encode a typed value
///
/// Strings occupy as many registers as their length needs; use
/// [`encode_string`] for fixed-width fields.
pub fn encode(value: &RegisterValue, data_type: DataType, order: ByteOrder) -> Result<Vec<u16>> {
    match (value, data_type) {
        (RegisterValue::Text(text), DataType::String) => {
            let words = text.len().div_ceil(2).max(1);
            encode_string(text, words, order)
        },
        (RegisterValue::Text(text), other) => match text.trim().parse::<f64>() {
            Ok(number) => encode_f64(number, other, order),
            Err(_) => Err(CodecError::TypeMismatch {
                value: text.clone(),
                data_type: other.as_str(),
            }),
        },
        (RegisterValue::Bool(b), DataType::String) => Err(CodecError::TypeMismatch {
            value: b.to_string(),
            data_type: DataType::String.as_str(),
        }),
        (RegisterValue::Bool(b), other) => encode_f64(if *b { 1.0 } else { 0.0 }, other, order),
        (RegisterValue::Int(v), other) => encode_int(*v, other, order),
        (RegisterValue::Float(v), other) => encode_f64(*v, other, order),
    }
}

/// Integer encode path that keeps full 32-bit precision
fn encode_int(value: i64, data_type: DataType, order: ByteOrder) -> Result<Vec<u16>> {
    match data_type {
        DataType::Int32 => i32::try_from(value)
            .map(|v| i32_to_regs(v, order).to_vec())
            .map_err(|_| out_of_range(value, data_type)),
        DataType::Uint32 => u32::try_from(value)
            .map(|v| u32_to_regs(v, order).to_vec())
            .map_err(|_| out_of_range(value, data_type)),
        other => encode_f64(value as f64, other, order),
    }
}

/// Encode text into exactly `words` registers
pub fn encode_string(text: &str, words: usize, order: ByteOrder) -> Result<Vec<u16>> {
    string_to_regs(text, words, order).ok_or_else(|| out_of_range(text, DataType::String))
}

/// Reverse a linear scale (`raw = (value - offset) / scale`) and encode
///
/// A zero scale is treated as identity.
pub fn encode_scaled(
    value: f64,
    data_type: DataType,
    order: ByteOrder,
    scale: f64,
    offset: f64,
) -> Result<Vec<u16>> {
    let raw = if scale != 0.0 {
        (value - offset) / scale
    } else {
        value
    };
    encode_f64(raw, data_type, order)
}
