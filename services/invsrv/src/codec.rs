//! Register word codec
//!
//! Pure conversions between raw 16-bit register words and typed telemetry.
//! Nothing here fails: malformed enum values degrade to an `Unknown(<raw>)`
//! label and out-of-range writes are masked to 16 bits.

use crate::register_map::{EnumTable, FieldSpec, Scale, Width};
use crate::snapshot::TelemetryValue;

#[inline]
pub fn decode_u16(raw: u16) -> i64 {
    i64::from(raw)
}

/// Reinterpret a register word as two's-complement
#[inline]
pub fn decode_s16(raw: u16) -> i64 {
    i64::from(raw as i16)
}

#[inline]
fn combine(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

/// Two-register signed value; `hi` is the lower register address
#[inline]
pub fn decode_s32(hi: u16, lo: u16) -> i64 {
    i64::from(combine(hi, lo) as i32)
}

/// Two-register unsigned value; `hi` is the lower register address
#[inline]
pub fn decode_u32(hi: u16, lo: u16) -> i64 {
    i64::from(combine(hi, lo))
}

/// Scale a raw integer and round to `precision` decimal digits
pub fn apply_scale(raw: i64, scale: Scale, precision: u8) -> f64 {
    let value = raw as f64 * scale.numerator as f64 / scale.denominator as f64;
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}

pub fn decode_enum(raw: i64, table: &EnumTable) -> String {
    match table.get(&raw) {
        Some(label) => label.clone(),
        None => format!("Unknown({raw})"),
    }
}

/// `round(value * raw_scale)` as a 16-bit two's-complement word
pub fn encode_write(value: f64, raw_scale: Scale) -> u16 {
    let scaled = (value * raw_scale.numerator as f64 / raw_scale.denominator as f64).round();
    (scaled as i64 & 0xFFFF) as u16
}

/// Decode one field from its block's words
///
/// Applies width, signedness, sentinel, enum table and scale in that order.
/// Returns `Absent` if the block is too short for the field.
pub fn decode_field(spec: &FieldSpec, words: &[u16]) -> TelemetryValue {
    let offset = spec.offset as usize;
    let (raw_bits, value) = match spec.width {
        Width::Single => {
            let Some(&word) = words.get(offset) else {
                return TelemetryValue::Absent;
            };
            let value = if spec.signed {
                decode_s16(word)
            } else {
                decode_u16(word)
            };
            (u32::from(word), value)
        },
        Width::Double => {
            let (Some(&hi), Some(&lo)) = (words.get(offset), words.get(offset + 1)) else {
                return TelemetryValue::Absent;
            };
            let value = if spec.signed {
                decode_s32(hi, lo)
            } else {
                decode_u32(hi, lo)
            };
            (combine(hi, lo), value)
        },
    };

    if spec.sentinel == Some(raw_bits) {
        return TelemetryValue::Absent;
    }

    if let Some(table) = &spec.enum_table {
        return TelemetryValue::Label(decode_enum(value, table));
    }

    if spec.scale.is_identity() {
        TelemetryValue::Integer(value)
    } else {
        TelemetryValue::Float(apply_scale(value, spec.scale, spec.precision))
    }
}
