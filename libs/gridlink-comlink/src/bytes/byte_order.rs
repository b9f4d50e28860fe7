//! Byte/word order representation for multi-register values

use serde::{Deserialize, Serialize};

/// Byte/word order for values spanning one or two 16-bit registers
///
/// Uses ABCD notation where A is the most significant byte. For the 32-bit value
/// `0x12345678`:
/// - `BigEndian (ABCD)`: [0x12, 0x34, 0x56, 0x78]
/// - `LittleEndian (DCBA)`: [0x78, 0x56, 0x34, 0x12]
/// - `BigEndianSwap (CDAB)`: [0x56, 0x78, 0x12, 0x34] (common on PLCs and inverters)
/// - `LittleEndianSwap (BADC)`: [0x34, 0x12, 0x78, 0x56]
///
/// Single-register values use the byte order within the register: the
/// little-endian variants swap the two bytes, the big-endian variants do not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// ABCD, network byte order
    #[default]
    #[serde(alias = "ABCD", alias = "abcd", alias = "big", alias = "be")]
    BigEndian,

    /// DCBA
    #[serde(alias = "DCBA", alias = "dcba", alias = "little", alias = "le")]
    LittleEndian,

    /// CDAB, big-endian words in swapped order
    #[serde(alias = "CDAB", alias = "cdab")]
    BigEndianSwap,

    /// BADC, byte-swapped words in natural order
    #[serde(alias = "BADC", alias = "badc")]
    LittleEndianSwap,
}

impl ByteOrder {
    /// ABCD notation, `A` being the most significant byte
    pub fn notation(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    /// Whether bytes inside each register are swapped
    pub fn swaps_bytes(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::LittleEndianSwap)
    }

    /// Whether the low word is transmitted first
    pub fn low_word_first(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.notation())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_notation_round_trips_through_serde() {
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianSwap,
            ByteOrder::LittleEndianSwap,
        ] {
            let parsed: ByteOrder =
                serde_json::from_value(serde_json::json!(order.notation())).unwrap();
            assert_eq!(parsed, order);
        }
        assert_eq!(ByteOrder::BigEndianSwap.to_string(), "CDAB");
    }

    #[test]
    fn test_serde_aliases() {
        let order: ByteOrder = serde_json::from_str("\"CDAB\"").unwrap();
        assert_eq!(order, ByteOrder::BigEndianSwap);
        let order: ByteOrder = serde_json::from_str("\"little_endian\"").unwrap();
        assert_eq!(order, ByteOrder::LittleEndian);
    }

    #[test]
    fn test_properties() {
        assert!(ByteOrder::LittleEndian.swaps_bytes());
        assert!(!ByteOrder::BigEndianSwap.swaps_bytes());
        assert!(ByteOrder::BigEndianSwap.low_word_first());
        assert!(!ByteOrder::BigEndian.low_word_first());
        assert_eq!(ByteOrder::default(), ByteOrder::BigEndian);
    }
}
