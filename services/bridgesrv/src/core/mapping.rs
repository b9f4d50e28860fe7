//! Field mapping engine
//!
//! Turns a native reading into the canonical field set published on the bus.
//! Each rule copies one source field to a target field through a
//! transformation; fields without a rule pass through untouched.
//!
//! Transformations:
//! - `none`: copy as is
//! - `scale`: `value * factor + offset` (numbers only, reversible)
//! - `lookup`: table keyed by the value's string form, unmatched values pass through
//! - `custom`: named function from the engine's function table

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use gridlink_model::{DeviceType, FieldValue, Reading};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// How a source value becomes a target value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "transformation",
    content = "transformationParams",
    rename_all = "snake_case"
)]
pub enum Transformation {
    None,
    Scale {
        factor: f64,
        #[serde(default)]
        offset: f64,
    },
    Lookup {
        table: BTreeMap<String, FieldValue>,
    },
    Custom {
        function: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRule {
    #[serde(alias = "source_field")]
    pub source_field: String,
    #[serde(alias = "target_field")]
    pub target_field: String,
    #[serde(flatten)]
    pub transformation: Transformation,
}

impl MappingRule {
    pub fn rename(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_field: source.into(),
            target_field: target.into(),
            transformation: Transformation::None,
        }
    }

    pub fn scale(source: impl Into<String>, target: impl Into<String>, factor: f64) -> Self {
        Self {
            source_field: source.into(),
            target_field: target.into(),
            transformation: Transformation::Scale {
                factor,
                offset: 0.0,
            },
        }
    }

    pub fn lookup<I, K, V>(source: impl Into<String>, target: impl Into<String>, table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            source_field: source.into(),
            target_field: target.into(),
            transformation: Transformation::Lookup {
                table: table
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            },
        }
    }

    pub fn custom(
        source: impl Into<String>,
        target: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            source_field: source.into(),
            target_field: target.into(),
            transformation: Transformation::Custom {
                function: function.into(),
            },
        }
    }
}

/// Named value transformation; `None` means "not applicable, keep the value"
pub type CustomFn = Arc<dyn Fn(&FieldValue) -> Option<FieldValue> + Send + Sync>;

fn numeric(f: fn(f64) -> f64) -> CustomFn {
    Arc::new(move |v: &FieldValue| v.as_f64().map(|x| FieldValue::Number(f(x))))
}

/// Functions every engine knows about
pub fn builtin_functions() -> HashMap<String, CustomFn> {
    let mut functions: HashMap<String, CustomFn> = HashMap::new();
    functions.insert("watts_to_kilowatts".into(), numeric(|w| w / 1000.0));
    functions.insert("kilowatts_to_watts".into(), numeric(|kw| kw * 1000.0));
    functions.insert(
        "celsius_to_fahrenheit".into(),
        numeric(|c| c * 9.0 / 5.0 + 32.0),
    );
    functions.insert("abs".into(), numeric(f64::abs));
    functions.insert(
        "invert_bool".into(),
        Arc::new(|v: &FieldValue| v.as_bool().map(|b| FieldValue::Bool(!b))),
    );
    functions
}

#[derive(Clone)]
pub struct MappingEngine {
    rules: Vec<MappingRule>,
    functions: HashMap<String, CustomFn>,
}

impl fmt::Debug for MappingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingEngine")
            .field("rules", &self.rules)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl MappingEngine {
    /// Engine with the builtin function table
    pub fn new(rules: Vec<MappingRule>) -> Result<Self> {
        Self::with_functions(rules, HashMap::new())
    }

    /// Engine with builtins plus `extra` (extra entries win on name clashes)
    ///
    /// Fails if a custom rule names a function that is not in the table.
    pub fn with_functions(
        rules: Vec<MappingRule>,
        extra: HashMap<String, CustomFn>,
    ) -> Result<Self> {
        let mut functions = builtin_functions();
        functions.extend(extra);

        for rule in &rules {
            if let Transformation::Custom { function } = &rule.transformation {
                if !functions.contains_key(function) {
                    return Err(BridgeError::config(format!(
                        "Unknown mapping function '{}' for field {}",
                        function, rule.source_field
                    )));
                }
            }
        }

        Ok(Self { rules, functions })
    }

    /// Engine using the standard rules of a device type
    pub fn for_device_type(device_type: DeviceType) -> Self {
        Self {
            rules: default_rules(device_type),
            functions: builtin_functions(),
        }
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// Apply all rules to a reading
    ///
    /// The result holds every original field plus one target field per rule
    /// whose source field is present.
    pub fn apply(&self, reading: &Reading) -> BTreeMap<String, FieldValue> {
        let mut mapped = reading.fields.clone();

        for rule in &self.rules {
            let Some(value) = reading.fields.get(&rule.source_field) else {
                continue;
            };
            let transformed = self.transform(rule, value);
            mapped.insert(rule.target_field.clone(), transformed);
        }

        mapped
    }

    fn transform(&self, rule: &MappingRule, value: &FieldValue) -> FieldValue {
        match &rule.transformation {
            Transformation::None => value.clone(),
            Transformation::Scale { factor, offset } => match value.as_f64() {
                Some(x) => FieldValue::Number(x * factor + offset),
                None => {
                    debug!(
                        "Scale skipped for non-numeric field {}: {}",
                        rule.source_field, value
                    );
                    value.clone()
                },
            },
            Transformation::Lookup { table } => table
                .get(&value.lookup_key())
                .cloned()
                .unwrap_or_else(|| value.clone()),
            Transformation::Custom { function } => {
                match self.functions.get(function).and_then(|f| f(value)) {
                    Some(result) => result,
                    None => {
                        debug!(
                            "Function {} not applicable to {}: {}",
                            function, rule.source_field, value
                        );
                        value.clone()
                    },
                }
            },
        }
    }

    /// Map a canonical value back to the native field it came from
    ///
    /// Only `none` and `scale` rules are reversible. A zero scale factor is
    /// treated as identity.
    pub fn reverse(&self, target_field: &str, value: f64) -> Option<(String, f64)> {
        let rule = self.rules.iter().find(|r| r.target_field == target_field)?;
        match &rule.transformation {
            Transformation::None => Some((rule.source_field.clone(), value)),
            Transformation::Scale { factor, offset } => {
                if *factor == 0.0 {
                    warn!(
                        "Scale factor for {} is zero, returning value unchanged",
                        rule.source_field
                    );
                    Some((rule.source_field.clone(), value))
                } else {
                    Some((rule.source_field.clone(), (value - offset) / factor))
                }
            },
            Transformation::Lookup { .. } | Transformation::Custom { .. } => None,
        }
    }
}

/// Standard rule table per device type
pub fn default_rules(device_type: DeviceType) -> Vec<MappingRule> {
    match device_type {
        DeviceType::Battery => vec![
            MappingRule::scale("state_of_charge", "soc", 0.01),
            MappingRule::scale("power_watts", "power", 0.001),
            MappingRule::rename("temp_celsius", "temperature"),
        ],
        DeviceType::Meter => vec![
            MappingRule::scale("energy_wh", "energy", 0.001),
            MappingRule::scale("power_watts", "power", 0.001),
        ],
        DeviceType::SolarInverter => vec![
            MappingRule::scale("ac_power_watts", "production", 0.001),
            MappingRule::scale("daily_energy_wh", "daily_energy", 0.001),
        ],
        DeviceType::HeatPump => vec![
            MappingRule::rename("current_temperature", "temperature"),
            MappingRule::scale("power_consumption", "power", 0.001),
        ],
        DeviceType::EvCharger => vec![MappingRule::scale("total_energy_wh", "energy", 0.001)],
        DeviceType::LoadController => Vec::new(),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_battery_defaults() {
        let engine = MappingEngine::for_device_type(DeviceType::Battery);
        let reading = Reading::new()
            .with_field("state_of_charge", 8532.0)
            .with_field("power_watts", 2500.0)
            .with_field("serial", "BAT-01");

        let mapped = engine.apply(&reading);
        assert!((mapped["soc"].as_f64().unwrap() - 85.32).abs() < 1e-9);
        assert!((mapped["power"].as_f64().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(mapped["serial"], FieldValue::from("BAT-01"));
        // originals stay
        assert_eq!(mapped["state_of_charge"], FieldValue::Number(8532.0));
        assert!(!mapped.contains_key("temperature"));
    }

    #[test]
    fn test_scale_with_offset() {
        let rule = MappingRule {
            source_field: "raw_temp".into(),
            target_field: "temperature".into(),
            transformation: Transformation::Scale {
                factor: 0.1,
                offset: -40.0,
            },
        };
        let engine = MappingEngine::new(vec![rule]).unwrap();
        let mapped = engine.apply(&Reading::new().with_field("raw_temp", 650.0));
        assert!((mapped["temperature"].as_f64().unwrap() - 25.0).abs() < 1e-9);

        let (field, raw) = engine.reverse("temperature", 25.0).unwrap();
        assert_eq!(field, "raw_temp");
        assert!((raw - 650.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_passes_text_through() {
        let engine = MappingEngine::new(vec![MappingRule::scale("p", "power", 0.001)]).unwrap();
        let mapped = engine.apply(&Reading::new().with_field("p", "n/a"));
        assert_eq!(mapped["power"], FieldValue::from("n/a"));
    }

    #[test]
    fn test_lookup_miss_passes_through() {
        let rule = MappingRule::lookup(
            "state_code",
            "state",
            [("0", "idle"), ("1", "charging"), ("2", "discharging")],
        );
        let engine = MappingEngine::new(vec![rule]).unwrap();

        let hit = engine.apply(&Reading::new().with_field("state_code", 1.0));
        assert_eq!(hit["state"], FieldValue::from("charging"));

        let miss = engine.apply(&Reading::new().with_field("state_code", 7.0));
        assert_eq!(miss["state"], FieldValue::Number(7.0));
    }

    #[test]
    fn test_custom_functions() {
        let engine = MappingEngine::new(vec![
            MappingRule::custom("flow_c", "flow_f", "celsius_to_fahrenheit"),
            MappingRule::custom("enabled", "disabled", "invert_bool"),
        ])
        .unwrap();
        let mapped = engine.apply(
            &Reading::new()
                .with_field("flow_c", 100.0)
                .with_field("enabled", true),
        );
        assert_eq!(mapped["flow_f"], FieldValue::Number(212.0));
        assert_eq!(mapped["disabled"], FieldValue::Bool(false));
    }

    #[test]
    fn test_extra_function_table() {
        let mut extra: HashMap<String, CustomFn> = HashMap::new();
        extra.insert(
            "double".into(),
            Arc::new(|v: &FieldValue| v.as_f64().map(|x| FieldValue::Number(x * 2.0))),
        );
        let engine =
            MappingEngine::with_functions(vec![MappingRule::custom("a", "b", "double")], extra)
                .unwrap();
        let mapped = engine.apply(&Reading::new().with_field("a", 21.0));
        assert_eq!(mapped["b"], FieldValue::Number(42.0));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = MappingEngine::new(vec![MappingRule::custom("a", "b", "nope")]).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError(_)));
    }

    #[test]
    fn test_reverse_zero_factor_is_identity() {
        let engine = MappingEngine::new(vec![MappingRule::scale("x", "y", 0.0)]).unwrap();
        assert_eq!(engine.reverse("y", 5.0), Some(("x".to_string(), 5.0)));
        assert_eq!(engine.reverse("missing", 5.0), None);
    }

    #[test]
    fn test_rule_serde_shape() {
        let rule: MappingRule = serde_json::from_value(serde_json::json!({
            "sourceField": "state_of_charge",
            "targetField": "soc",
            "transformation": "scale",
            "transformationParams": { "factor": 0.01 }
        }))
        .unwrap();
        assert_eq!(rule, MappingRule::scale("state_of_charge", "soc", 0.01));

        let plain: MappingRule = serde_json::from_value(serde_json::json!({
            "source_field": "temp_celsius",
            "target_field": "temperature",
            "transformation": "none"
        }))
        .unwrap();
        assert_eq!(plain.transformation, Transformation::None);
    }
}
