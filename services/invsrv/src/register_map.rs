//! Register map: which blocks to poll, how to decode them, where to write
//!
//! The map is built once and never mutated. `RegisterMap::new` checks every
//! structural invariant so the coordinator can index words without bounds
//! surprises.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::error::ConfigError;
use crate::protocols::modbus::constants::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, HOLDING_DOC_BASE, INPUT_DOC_BASE,
    MODBUS_MAX_READ_REGISTERS,
};

/// Read function used for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReadFunction {
    /// FC04
    ReadInput,
    /// FC03
    ReadHolding,
}

impl ReadFunction {
    pub fn code(self) -> u8 {
        match self {
            ReadFunction::ReadInput => FC_READ_INPUT_REGISTERS,
            ReadFunction::ReadHolding => FC_READ_HOLDING_REGISTERS,
        }
    }
}

/// Contiguous range of registers fetched with one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    pub name: String,
    pub start_address: u16,
    pub count: u16,
    pub function_code: ReadFunction,
}

impl RegisterBlock {
    pub fn new(
        name: impl Into<String>,
        function_code: ReadFunction,
        start_address: u16,
        count: u16,
    ) -> Self {
        Self {
            name: name.into(),
            start_address,
            count,
            function_code,
        }
    }

    /// Last wire address covered, or None if the range overflows u16
    pub fn end_address(&self) -> Option<u16> {
        self.start_address.checked_add(self.count.checked_sub(1)?)
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start_address
            && self.end_address().is_some_and(|end| address <= end)
    }
}

/// Rational multiplier applied to raw register values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub numerator: i64,
    pub denominator: i64,
}

impl Scale {
    pub const ONE: Scale = Scale::new(1, 1);
    pub const TENTH: Scale = Scale::new(1, 10);
    pub const HUNDREDTH: Scale = Scale::new(1, 100);

    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn times(factor: i64) -> Self {
        Self::new(factor, 1)
    }

    pub fn is_identity(&self) -> bool {
        self.numerator == self.denominator
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Single,
    Double,
}

impl Width {
    pub fn words(self) -> u16 {
        match self {
            Width::Single => 1,
            Width::Double => 2,
        }
    }
}

/// Raw value to label table, kept ordered by raw value
pub type EnumTable = BTreeMap<i64, String>;

fn enum_table(entries: &[(i64, &str)]) -> EnumTable {
    entries
        .iter()
        .map(|(raw, label)| (*raw, (*label).to_string()))
        .collect()
}

/// Decoding recipe for one telemetry key
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub key: String,
    pub offset: u16,
    pub width: Width,
    pub signed: bool,
    pub scale: Scale,
    /// Decimal digits kept after scaling (0..=2)
    pub precision: u8,
    pub enum_table: Option<EnumTable>,
    /// Raw value meaning "not available"
    pub sentinel: Option<u32>,
}

impl FieldSpec {
    pub fn unsigned(key: impl Into<String>, offset: u16) -> Self {
        Self {
            key: key.into(),
            offset,
            width: Width::Single,
            signed: false,
            scale: Scale::ONE,
            precision: 0,
            enum_table: None,
            sentinel: None,
        }
    }

    pub fn signed(key: impl Into<String>, offset: u16) -> Self {
        Self {
            signed: true,
            ..Self::unsigned(key, offset)
        }
    }

    pub fn double(mut self) -> Self {
        self.width = Width::Double;
        self
    }

    pub fn scaled(mut self, scale: Scale, precision: u8) -> Self {
        self.scale = scale;
        self.precision = precision;
        self
    }

    pub fn with_enum(mut self, entries: &[(i64, &str)]) -> Self {
        self.enum_table = Some(enum_table(entries));
        self
    }

    pub fn with_sentinel(mut self, raw: u32) -> Self {
        self.sentinel = Some(raw);
        self
    }
}

/// Block plus the fields decoded from it
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub block: RegisterBlock,
    pub fields: Vec<FieldSpec>,
}

/// Inclusive bounds on a consumer-native write value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteRange {
    pub min: f64,
    pub max: f64,
}

/// Encoding recipe for one writable key
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSpec {
    pub key: String,
    pub register_address: u16,
    pub raw_scale: Scale,
    pub range: Option<WriteRange>,
}

impl WriteSpec {
    pub fn new(key: impl Into<String>, register_address: u16, raw_scale: Scale) -> Self {
        Self {
            key: key.into(),
            register_address,
            raw_scale,
            range: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(WriteRange { min, max });
        self
    }
}

/// Validated, immutable register map
#[derive(Debug, Clone)]
pub struct RegisterMap {
    blocks: Vec<BlockSpec>,
    writes: Vec<WriteSpec>,
    write_by_key: HashMap<String, usize>,
    write_by_address: HashMap<u16, usize>,
}

impl RegisterMap {
    /// Build a map, rejecting any structural inconsistency
    pub fn new(blocks: Vec<BlockSpec>, writes: Vec<WriteSpec>) -> Result<Self, ConfigError> {
        if blocks.is_empty() {
            return Err(ConfigError::register_map("no register blocks defined"));
        }

        let mut block_names = HashSet::new();
        let mut keys = HashSet::new();

        for spec in &blocks {
            let block = &spec.block;
            if !block_names.insert(block.name.as_str()) {
                return Err(ConfigError::register_map(format!(
                    "duplicate block name '{}'",
                    block.name
                )));
            }
            if block.count == 0 || block.count > MODBUS_MAX_READ_REGISTERS {
                return Err(ConfigError::register_map(format!(
                    "block '{}' count {} outside 1..={}",
                    block.name, block.count, MODBUS_MAX_READ_REGISTERS
                )));
            }
            if block.end_address().is_none() {
                return Err(ConfigError::register_map(format!(
                    "block '{}' overflows the 16-bit address space",
                    block.name
                )));
            }

            for field in &spec.fields {
                if !keys.insert(field.key.as_str()) {
                    return Err(ConfigError::register_map(format!(
                        "duplicate field key '{}'",
                        field.key
                    )));
                }
                let last = u32::from(field.offset) + u32::from(field.width.words()) - 1;
                if last >= u32::from(block.count) {
                    return Err(ConfigError::register_map(format!(
                        "field '{}' (offset {}, {} words) exceeds block '{}' of {} registers",
                        field.key,
                        field.offset,
                        field.width.words(),
                        block.name,
                        block.count
                    )));
                }
                if field.precision > 2 {
                    return Err(ConfigError::register_map(format!(
                        "field '{}' precision {} exceeds 2",
                        field.key, field.precision
                    )));
                }
                if field.scale.denominator == 0 {
                    return Err(ConfigError::register_map(format!(
                        "field '{}' has a zero scale denominator",
                        field.key
                    )));
                }
            }
        }

        let mut write_by_key = HashMap::new();
        let mut write_by_address = HashMap::new();
        for (index, write) in writes.iter().enumerate() {
            if !keys.contains(write.key.as_str()) {
                return Err(ConfigError::register_map(format!(
                    "writable key '{}' has no read field",
                    write.key
                )));
            }
            if write.raw_scale.denominator == 0 {
                return Err(ConfigError::register_map(format!(
                    "writable key '{}' has a zero raw_scale denominator",
                    write.key
                )));
            }
            if let Some(range) = write.range {
                if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
                    return Err(ConfigError::register_map(format!(
                        "writable key '{}' has an empty range {}..={}",
                        write.key, range.min, range.max
                    )));
                }
            }
            if write_by_key.insert(write.key.clone(), index).is_some() {
                return Err(ConfigError::register_map(format!(
                    "duplicate writable key '{}'",
                    write.key
                )));
            }
            if write_by_address
                .insert(write.register_address, index)
                .is_some()
            {
                return Err(ConfigError::register_map(format!(
                    "register {} mapped by more than one writable key",
                    write.register_address
                )));
            }
        }

        Ok(Self {
            blocks,
            writes,
            write_by_key,
            write_by_address,
        })
    }

    /// Voltx/Solplanet ASW hybrid inverter, firmware v2
    pub fn voltx_asw() -> Result<Self, ConfigError> {
        let inverter = BlockSpec {
            block: RegisterBlock::new("inverter", ReadFunction::ReadInput, 1300, 80),
            fields: vec![
                FieldSpec::unsigned("hto", 7),
                FieldSpec::unsigned("flg", 8).with_enum(&[
                    (0, "Waiting"),
                    (1, "Normal"),
                    (2, "Fault"),
                    (4, "Checking"),
                ]),
                FieldSpec::signed("tmp", 10)
                    .scaled(Scale::TENTH, 1)
                    .with_sentinel(0x8000),
                FieldSpec::unsigned("vbus", 16).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("vac", 58).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("iac", 59).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("fac", 67).scaled(Scale::HUNDREDTH, 2),
                FieldSpec::signed("sac", 68).double(),
                FieldSpec::signed("pac", 70).double(),
                FieldSpec::signed("qac", 72).double(),
                FieldSpec::unsigned("pf", 74).scaled(Scale::HUNDREDTH, 2),
            ],
        };

        let battery_status = BlockSpec {
            block: RegisterBlock::new("battery_status", ReadFunction::ReadInput, 1606, 2),
            fields: vec![
                FieldSpec::unsigned("bcomm", 0),
                FieldSpec::unsigned("bst", 1).with_enum(&[
                    (0, "N/A"),
                    (1, "Idle"),
                    (2, "Charging"),
                    (3, "Discharging"),
                    (4, "Error"),
                ]),
            ],
        };

        let battery = BlockSpec {
            block: RegisterBlock::new("battery", ReadFunction::ReadInput, 1616, 13),
            fields: vec![
                FieldSpec::unsigned("vb", 0).scaled(Scale::HUNDREDTH, 2),
                FieldSpec::signed("cb", 1).scaled(Scale::TENTH, 1),
                FieldSpec::signed("pb", 2).double(),
                FieldSpec::signed("tb", 4).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("soc", 5),
                FieldSpec::unsigned("soh", 6),
                FieldSpec::unsigned("cli", 7).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("clo", 8).scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("e_chg_today", 9)
                    .double()
                    .scaled(Scale::TENTH, 1),
                FieldSpec::unsigned("e_dis_today", 11)
                    .double()
                    .scaled(Scale::TENTH, 1),
            ],
        };

        let settings = BlockSpec {
            block: RegisterBlock::new("settings", ReadFunction::ReadHolding, 1100, 55),
            fields: vec![
                FieldSpec::unsigned("work_mode", 3).with_enum(&[
                    (2, "Self-consumption"),
                    (3, "Reserve Power"),
                    (4, "Custom"),
                    (5, "Time of Use"),
                ]),
                FieldSpec::unsigned("cloud_status", 50),
                FieldSpec::unsigned("chflg", 51).with_enum(&[
                    (1, "Stop"),
                    (2, "Charging"),
                    (3, "Discharging"),
                ]),
                FieldSpec::signed("chpwr", 52),
                FieldSpec::unsigned("soc_max", 53).scaled(Scale::HUNDREDTH, 0),
                FieldSpec::unsigned("soc_min", 54).scaled(Scale::HUNDREDTH, 0),
            ],
        };

        let writes = vec![
            WriteSpec::new("work_mode", 1103, Scale::ONE).with_range(2.0, 5.0),
            WriteSpec::new("chpwr", 1152, Scale::ONE).with_range(-10000.0, 10000.0),
            WriteSpec::new("soc_max", 1153, Scale::times(100)).with_range(0.0, 100.0),
            WriteSpec::new("soc_min", 1154, Scale::times(100)).with_range(0.0, 100.0),
        ];

        Self::new(vec![inverter, battery_status, battery, settings], writes)
    }

    /// Blocks in poll order
    pub fn blocks(&self) -> &[BlockSpec] {
        &self.blocks
    }

    pub fn writes(&self) -> &[WriteSpec] {
        &self.writes
    }

    pub fn write_spec(&self, key: &str) -> Option<&WriteSpec> {
        self.write_by_key.get(key).map(|&i| &self.writes[i])
    }

    pub fn write_spec_for_address(&self, address: u16) -> Option<&WriteSpec> {
        self.write_by_address.get(&address).map(|&i| &self.writes[i])
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.blocks
            .iter()
            .flat_map(|spec| spec.fields.iter())
            .find(|field| field.key == key)
    }

    pub fn enum_table(&self, key: &str) -> Option<&EnumTable> {
        self.field(key).and_then(|field| field.enum_table.as_ref())
    }

    /// All read keys in map order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.blocks
            .iter()
            .flat_map(|spec| spec.fields.iter().map(|field| field.key.as_str()))
    }
}

/// Convert a vendor 3xxxx doc address to a wire address
pub fn input_doc_to_wire(doc_address: u32) -> Option<u16> {
    doc_address
        .checked_sub(INPUT_DOC_BASE)
        .and_then(|wire| u16::try_from(wire).ok())
}

/// Convert a vendor 4xxxx doc address to a wire address
pub fn holding_doc_to_wire(doc_address: u32) -> Option<u16> {
    doc_address
        .checked_sub(HOLDING_DOC_BASE)
        .and_then(|wire| u16::try_from(wire).ok())
}
