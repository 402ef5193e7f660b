//! Decoded telemetry snapshot

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One decoded telemetry value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Unscaled number
    Integer(i64),
    /// Scaled number, already rounded to the field precision
    Float(f64),
    /// Enum-decoded label
    Label(String),
    /// Device reported the field's "not available" sentinel
    Absent,
}

impl TelemetryValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Integer(v) => Some(*v as f64),
            TelemetryValue::Float(v) => Some(*v),
            TelemetryValue::Label(_) | TelemetryValue::Absent => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            TelemetryValue::Label(label) => Some(label),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, TelemetryValue::Absent)
    }
}

impl std::fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryValue::Integer(v) => write!(f, "{v}"),
            TelemetryValue::Float(v) => write!(f, "{v}"),
            TelemetryValue::Label(label) => f.write_str(label),
            TelemetryValue::Absent => f.write_str("unavailable"),
        }
    }
}

/// Immutable result of one poll cycle
///
/// Fields of a block that failed during the cycle are missing from `values`
/// rather than zero-filled; the block names are listed in `failed_blocks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub values: BTreeMap<String, TelemetryValue>,
    pub failed_blocks: Vec<String>,
}

impl TelemetrySnapshot {
    pub fn new(values: BTreeMap<String, TelemetryValue>, failed_blocks: Vec<String>) -> Self {
        Self {
            taken_at: Utc::now(),
            values,
            failed_blocks,
        }
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed_blocks.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_flat_values() {
        let mut values = BTreeMap::new();
        values.insert("pac".to_string(), TelemetryValue::Integer(-2000));
        values.insert("fac".to_string(), TelemetryValue::Float(50.01));
        values.insert("flg".to_string(), TelemetryValue::Label("Normal".into()));
        values.insert("tmp".to_string(), TelemetryValue::Absent);
        let snapshot = TelemetrySnapshot::new(values, vec!["battery".into()]);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["values"]["pac"], -2000);
        assert_eq!(json["values"]["fac"], 50.01);
        assert_eq!(json["values"]["flg"], "Normal");
        assert!(json["values"]["tmp"].is_null());
        assert_eq!(json["failed_blocks"][0], "battery");
        assert!(snapshot.is_partial());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(TelemetryValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(TelemetryValue::Label("Idle".into()).as_label(), Some("Idle"));
        assert!(TelemetryValue::Absent.is_absent());
        assert_eq!(TelemetryValue::Absent.to_string(), "unavailable");
    }
}
