//! Native readings
//!
//! A reading is a flat map from device-native field names to raw values plus the
//! instant it was captured. Readings are produced per poll or event and consumed
//! immediately by the bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Raw field value: numeric, boolean or text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value; booleans map to 0/1, text is parsed when possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n != 0.0),
            Self::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Key used for lookup tables: numbers without a fractional part print as integers
    pub fn lookup_key(&self) -> String {
        match self {
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    /// Convert an arbitrary JSON value; arrays and objects are kept as JSON text
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            other => Some(Self::Text(other.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// One native reading captured from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Default for Reading {
    fn default() -> Self {
        Self::new()
    }
}

impl Reading {
    /// Empty reading stamped with the current time
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Builder-style insert
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Reading {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut reading = Reading::new();
        for (k, v) in iter {
            reading.insert(k, v);
        }
        reading
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_field_value_untagged_serde() {
        let parsed: BTreeMap<String, FieldValue> =
            serde_json::from_str(r#"{"a": 1.5, "b": true, "c": "idle", "d": 3}"#).unwrap();
        assert_eq!(parsed["a"], FieldValue::Number(1.5));
        assert_eq!(parsed["b"], FieldValue::Bool(true));
        assert_eq!(parsed["c"], FieldValue::Text("idle".into()));
        assert_eq!(parsed["d"], FieldValue::Number(3.0));
    }

    #[test]
    fn test_lookup_key_formats_integers() {
        assert_eq!(FieldValue::Number(3.0).lookup_key(), "3");
        assert_eq!(FieldValue::Number(2.5).lookup_key(), "2.5");
        assert_eq!(FieldValue::Bool(false).lookup_key(), "false");
        assert_eq!(FieldValue::Text("x".into()).lookup_key(), "x");
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(FieldValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(FieldValue::Text(" 42 ".into()).as_f64(), Some(42.0));
        assert_eq!(FieldValue::Text("abc".into()).as_f64(), None);
        assert_eq!(FieldValue::Number(0.0).as_bool(), Some(false));
        assert_eq!(FieldValue::Text("ON".into()).as_bool(), Some(true));
    }

    #[test]
    fn test_reading_builder() {
        let reading = Reading::new()
            .with_field("state_of_charge", 8532)
            .with_field("mode", "auto");
        assert_eq!(reading.len(), 2);
        assert_eq!(reading.get_f64("state_of_charge"), Some(8532.0));
        assert_eq!(reading.get("mode").and_then(FieldValue::as_str), Some("auto"));
    }

    #[test]
    fn test_from_json_values() {
        assert_eq!(FieldValue::from_json(&serde_json::json!(null)), None);
        assert_eq!(
            FieldValue::from_json(&serde_json::json!([1, 2])),
            Some(FieldValue::Text("[1,2]".into()))
        );
    }
}
