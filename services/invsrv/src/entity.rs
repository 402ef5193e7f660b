//! Snapshot consumers: sensor, number and select adapters
//!
//! Adapters hold no polling logic. They read the latest snapshot through
//! [`TelemetrySource`] and route writes back through it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::WriteError;
use crate::snapshot::TelemetryValue;
use crate::source::{TelemetrySource, WriteTarget};

/// Logical device a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DeviceKind {
    Inverter,
    Battery,
}

const BATTERY_KEYS: &[&str] = &[
    "pb",
    "vb",
    "cb",
    "tb",
    "soc",
    "soh",
    "cli",
    "clo",
    "bst",
    "bcomm",
    "e_chg_today",
    "e_dis_today",
    "chflg",
    "chpwr",
    "soc_max",
    "soc_min",
];

impl DeviceKind {
    pub fn for_key(key: &str) -> Self {
        if BATTERY_KEYS.contains(&key) {
            DeviceKind::Battery
        } else {
            DeviceKind::Inverter
        }
    }

    pub fn model(self) -> &'static str {
        match self {
            DeviceKind::Inverter => "Hybrid Inverter",
            DeviceKind::Battery => "Battery Storage",
        }
    }

    /// Display name, e.g. "Voltx Battery (10.0.0.5 slave 3)"
    pub fn device_name(self, host: &str, unit_id: u8) -> String {
        let kind = match self {
            DeviceKind::Inverter => "Inverter",
            DeviceKind::Battery => "Battery",
        };
        format!("Voltx {kind} ({host} slave {unit_id})")
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Inverter => f.write_str("inverter"),
            DeviceKind::Battery => f.write_str("battery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    Power,
    ApparentPower,
    ReactivePower,
    Current,
    Voltage,
    Frequency,
    PowerFactor,
    Temperature,
    Battery,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Static presentation metadata for one read key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub display_precision: Option<u8>,
}

const fn measurement(
    key: &'static str,
    name: &'static str,
    unit: &'static str,
    device_class: Option<DeviceClass>,
    precision: u8,
) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit: Some(unit),
        device_class,
        state_class: Some(StateClass::Measurement),
        display_precision: Some(precision),
    }
}

const fn status(key: &'static str, name: &'static str) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit: None,
        device_class: None,
        state_class: None,
        display_precision: None,
    }
}

pub const SENSOR_DESCRIPTIONS: &[SensorDescription] = &[
    // Inverter / grid
    measurement("pac", "Inverter Active Power", "W", Some(DeviceClass::Power), 0),
    measurement("sac", "Inverter Apparent Power", "VA", Some(DeviceClass::ApparentPower), 0),
    measurement("qac", "Inverter Reactive Power", "var", Some(DeviceClass::ReactivePower), 0),
    measurement("iac", "AC Current", "A", Some(DeviceClass::Current), 1),
    measurement("tmp", "Inverter Temperature", "°C", Some(DeviceClass::Temperature), 1),
    status("flg", "Inverter Status"),
    measurement("vac", "Grid Voltage", "V", Some(DeviceClass::Voltage), 1),
    measurement("fac", "Grid Frequency", "Hz", Some(DeviceClass::Frequency), 2),
    SensorDescription {
        key: "pf",
        name: "Power Factor",
        unit: None,
        device_class: Some(DeviceClass::PowerFactor),
        state_class: Some(StateClass::Measurement),
        display_precision: Some(2),
    },
    SensorDescription {
        key: "hto",
        name: "Total Working Hours",
        unit: Some("h"),
        device_class: None,
        state_class: Some(StateClass::TotalIncreasing),
        display_precision: Some(0),
    },
    // Battery
    measurement("pb", "Battery Power", "W", Some(DeviceClass::Power), 0),
    measurement("soc", "Battery State of Charge", "%", Some(DeviceClass::Battery), 0),
    measurement("vb", "Battery Voltage", "V", Some(DeviceClass::Voltage), 2),
    measurement("cb", "Battery Current", "A", Some(DeviceClass::Current), 1),
    measurement("tb", "Battery Temperature", "°C", Some(DeviceClass::Temperature), 1),
    measurement("soh", "Battery State of Health", "%", None, 0),
    measurement("cli", "Battery Charge Current Limit", "A", Some(DeviceClass::Current), 1),
    measurement("clo", "Battery Discharge Current Limit", "A", Some(DeviceClass::Current), 1),
    status("bst", "Battery Status"),
    status("bcomm", "Battery Comm Status"),
    SensorDescription {
        key: "e_chg_today",
        name: "Battery Energy Charged Today",
        unit: Some("kWh"),
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::TotalIncreasing),
        display_precision: Some(1),
    },
    SensorDescription {
        key: "e_dis_today",
        name: "Battery Energy Discharged Today",
        unit: Some("kWh"),
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::TotalIncreasing),
        display_precision: Some(1),
    },
    status("chflg", "Charge/Discharge Flag"),
    measurement("chpwr", "Charge/Discharge Power Command", "W", Some(DeviceClass::Power), 0),
];

/// Slider-style control for a numeric writable key
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: &'static str,
}

pub const NUMBER_DESCRIPTIONS: &[NumberDescription] = &[
    NumberDescription {
        key: "chpwr",
        name: "Battery Charge/Discharge Power",
        min: -10000.0,
        max: 10000.0,
        step: 50.0,
        unit: "W",
    },
    NumberDescription {
        key: "soc_max",
        name: "Battery SOC Max",
        min: 0.0,
        max: 100.0,
        step: 1.0,
        unit: "%",
    },
    NumberDescription {
        key: "soc_min",
        name: "Battery SOC Min",
        min: 0.0,
        max: 100.0,
        step: 1.0,
        unit: "%",
    },
];

/// Option list control for an enum writable key; options come from the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectDescription {
    pub key: &'static str,
    pub name: &'static str,
}

pub const SELECT_DESCRIPTIONS: &[SelectDescription] = &[SelectDescription {
    key: "work_mode",
    name: "Work Mode",
}];

/// Read-only view of one snapshot key
#[derive(Clone)]
pub struct SensorEntity {
    description: SensorDescription,
    source: Arc<dyn TelemetrySource>,
}

impl SensorEntity {
    pub fn new(description: SensorDescription, source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            description,
            source,
        }
    }

    pub fn description(&self) -> &SensorDescription {
        &self.description
    }

    pub fn key(&self) -> &'static str {
        self.description.key
    }

    pub fn device(&self) -> DeviceKind {
        DeviceKind::for_key(self.description.key)
    }

    /// Present in the latest snapshot; a sentinel value still counts as present
    pub fn available(&self) -> bool {
        self.source
            .snapshot()
            .is_some_and(|snapshot| snapshot.contains(self.description.key))
    }

    pub fn value(&self) -> Option<TelemetryValue> {
        self.source
            .snapshot()
            .and_then(|snapshot| snapshot.get(self.description.key).cloned())
            .filter(|value| !value.is_absent())
    }

    /// Value with unit for display, e.g. "230.1 V"
    pub fn state(&self) -> String {
        match (self.value(), self.description.unit) {
            (Some(value), Some(unit)) => format!("{value} {unit}"),
            (Some(value), None) => value.to_string(),
            (None, _) => "unavailable".to_string(),
        }
    }
}

impl fmt::Debug for SensorEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorEntity")
            .field("key", &self.description.key)
            .finish()
    }
}

pub struct NumberEntity {
    description: NumberDescription,
    source: Arc<dyn TelemetrySource>,
}

impl NumberEntity {
    pub fn new(description: NumberDescription, source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            description,
            source,
        }
    }

    pub fn description(&self) -> &NumberDescription {
        &self.description
    }

    pub fn device(&self) -> DeviceKind {
        DeviceKind::for_key(self.description.key)
    }

    pub fn available(&self) -> bool {
        self.source
            .snapshot()
            .is_some_and(|snapshot| snapshot.contains(self.description.key))
    }

    pub fn value(&self) -> Option<f64> {
        self.source
            .snapshot()
            .and_then(|snapshot| snapshot.get(self.description.key).and_then(|v| v.as_f64()))
    }

    pub async fn set_value(&self, value: f64) -> Result<(), WriteError> {
        self.source
            .write(WriteTarget::key(self.description.key), value)
            .await
    }
}

pub struct SelectEntity {
    description: SelectDescription,
    source: Arc<dyn TelemetrySource>,
    /// Label to raw value
    reverse: BTreeMap<String, i64>,
}

impl SelectEntity {
    pub fn new(description: SelectDescription, source: Arc<dyn TelemetrySource>) -> Self {
        let reverse = source
            .register_map()
            .enum_table(description.key)
            .map(|table| {
                table
                    .iter()
                    .map(|(raw, label)| (label.clone(), *raw))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            description,
            source,
            reverse,
        }
    }

    pub fn description(&self) -> &SelectDescription {
        &self.description
    }

    pub fn device(&self) -> DeviceKind {
        DeviceKind::for_key(self.description.key)
    }

    /// Labels in raw-value order
    pub fn options(&self) -> Vec<String> {
        self.source
            .register_map()
            .enum_table(self.description.key)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn available(&self) -> bool {
        self.source
            .snapshot()
            .is_some_and(|snapshot| snapshot.contains(self.description.key))
    }

    /// Current label; None for values outside the option list
    pub fn current_option(&self) -> Option<String> {
        let snapshot = self.source.snapshot()?;
        let label = snapshot.get(self.description.key)?.as_label()?;
        self.reverse.contains_key(label).then(|| label.to_string())
    }

    pub async fn select(&self, option: &str) -> Result<(), WriteError> {
        let raw = self
            .reverse
            .get(option)
            .copied()
            .ok_or_else(|| WriteError::UnknownOption {
                key: self.description.key.to_string(),
                option: option.to_string(),
            })?;
        self.source
            .write(WriteTarget::key(self.description.key), raw as f64)
            .await
    }
}

/// All adapters for one device
pub struct EntitySet {
    pub sensors: Vec<SensorEntity>,
    pub numbers: Vec<NumberEntity>,
    pub selects: Vec<SelectEntity>,
}

impl EntitySet {
    /// Create adapters only for keys present in the current snapshot
    pub fn discover(source: Arc<dyn TelemetrySource>) -> Self {
        let Some(snapshot) = source.snapshot() else {
            return Self {
                sensors: Vec::new(),
                numbers: Vec::new(),
                selects: Vec::new(),
            };
        };

        let sensors = SENSOR_DESCRIPTIONS
            .iter()
            .filter(|d| snapshot.contains(d.key))
            .map(|d| SensorEntity::new(*d, Arc::clone(&source)))
            .collect();
        let numbers = NUMBER_DESCRIPTIONS
            .iter()
            .filter(|d| snapshot.contains(d.key))
            .map(|d| NumberEntity::new(*d, Arc::clone(&source)))
            .collect();
        let selects = SELECT_DESCRIPTIONS
            .iter()
            .filter(|d| snapshot.contains(d.key))
            .map(|d| SelectEntity::new(*d, Arc::clone(&source)))
            .collect();

        Self {
            sensors,
            numbers,
            selects,
        }
    }

    pub fn len(&self) -> usize {
        self.sensors.len() + self.numbers.len() + self.selects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sensors_for(&self, device: DeviceKind) -> impl Iterator<Item = &SensorEntity> {
        self.sensors.iter().filter(move |s| s.device() == device)
    }
}
