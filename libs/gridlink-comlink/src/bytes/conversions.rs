//! Numeric type conversions with byte order support
//!
//! Provides functions for converting between register arrays (u16[]) and numeric
//! types in both directions. All conversions take a [`ByteOrder`].

use super::ByteOrder;

// ============================================================================
// Register <-> Bytes
// ============================================================================

/// Convert 2 u16 registers to 4 bytes in value order (most significant first)
pub fn regs_to_bytes_4(regs: &[u16; 2], order: ByteOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];

    match order {
        ByteOrder::BigEndian => [h0[0], h0[1], h1[0], h1[1]], // ABCD
        ByteOrder::LittleEndian => [h1[1], h1[0], h0[1], h0[0]], // DCBA
        ByteOrder::BigEndianSwap => [h1[0], h1[1], h0[0], h0[1]], // CDAB
        ByteOrder::LittleEndianSwap => [h0[1], h0[0], h1[1], h1[0]], // BADC
    }
}

/// Convert 4 value-order bytes back to 2 registers (inverse of [`regs_to_bytes_4`])
pub fn bytes_4_to_regs(bytes: [u8; 4], order: ByteOrder) -> [u16; 2] {
    let [a, b, c, d] = bytes;
    match order {
        ByteOrder::BigEndian => [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
        ByteOrder::LittleEndian => [u16::from_be_bytes([d, c]), u16::from_be_bytes([b, a])],
        ByteOrder::BigEndianSwap => [u16::from_be_bytes([c, d]), u16::from_be_bytes([a, b])],
        ByteOrder::LittleEndianSwap => [u16::from_be_bytes([b, a]), u16::from_be_bytes([d, c])],
    }
}

// ============================================================================
// Single Register Conversions
// ============================================================================

/// Register as unsigned value, bytes swapped for the little-endian orders
pub fn reg_to_u16(reg: u16, order: ByteOrder) -> u16 {
    if order.swaps_bytes() {
        reg.swap_bytes()
    } else {
        reg
    }
}

pub fn reg_to_i16(reg: u16, order: ByteOrder) -> i16 {
    reg_to_u16(reg, order) as i16
}

/// Convert u16 to its register representation; byte swapping is symmetric
pub fn u16_to_reg(value: u16, order: ByteOrder) -> u16 {
    reg_to_u16(value, order)
}

pub fn i16_to_reg(value: i16, order: ByteOrder) -> u16 {
    u16_to_reg(value as u16, order)
}

// ============================================================================
// Two Register Conversions
// ============================================================================

/// IEEE-754 single precision from a register pair
pub fn regs_to_f32(regs: &[u16; 2], order: ByteOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(regs, order))
}

pub fn regs_to_u32(regs: &[u16; 2], order: ByteOrder) -> u32 {
    u32::from_be_bytes(regs_to_bytes_4(regs, order))
}

pub fn regs_to_i32(regs: &[u16; 2], order: ByteOrder) -> i32 {
    i32::from_be_bytes(regs_to_bytes_4(regs, order))
}

/// Split an f32 into 2 registers
pub fn f32_to_regs(value: f32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

/// Split a u32 into 2 registers
pub fn u32_to_regs(value: u32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

/// Split an i32 into 2 registers
pub fn i32_to_regs(value: i32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

// ============================================================================
// Strings
// ============================================================================

/// Decode ASCII text packed two characters per register
///
/// Trailing NUL bytes and spaces are stripped; non-ASCII bytes are replaced.
pub fn regs_to_string(regs: &[u16], order: ByteOrder) -> String {
    let bytes: Vec<u8> = regs
        .iter()
        .flat_map(|r| reg_to_u16(*r, order).to_be_bytes())
        .collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

/// Encode text into exactly `words` registers, NUL padded
///
/// Returns `None` when the text does not fit.
pub fn string_to_regs(text: &str, words: usize, order: ByteOrder) -> Option<Vec<u16>> {
    let bytes = text.as_bytes();
    if bytes.len() > words * 2 {
        return None;
    }
    let mut padded = bytes.to_vec();
    padded.resize(words * 2, 0);
    Some(
        padded
            .chunks_exact(2)
            .map(|pair| u16_to_reg(u16::from_be_bytes([pair[0], pair[1]]), order))
            .collect(),
    )
}
