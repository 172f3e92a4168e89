//! EXIF extraction into a plain tag-name → value mapping.

use ::exif::{Field, In, Reader, Value};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io::Cursor};

/// EXIF tags keyed by their display name (`Make`, `ExposureTime`, ...).
pub type ExifMap = BTreeMap<String, ExifValue>;

/// A single EXIF value after coercion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExifValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Reads every primary-image EXIF field contained in `bytes`.
///
/// Returns `exif::Error::NotFound` when the container simply carries no
/// EXIF block.
pub fn read_exif(bytes: &[u8]) -> Result<ExifMap, ::exif::Error> {
    let exif = Reader::new().read_from_container(&mut Cursor::new(bytes))?;

    Ok(exif
        .fields()
        .filter(|field| field.ifd_num == In::PRIMARY)
        .filter_map(|field| coerce(field).map(|value| (field.tag.to_string(), value)))
        .collect())
}

/// Maps one field to an [`ExifValue`]. Fields without components map to `None`.
fn coerce(field: &Field) -> Option<ExifValue> {
    let displayed = || ExifValue::Text(field.display_value().to_string());

    let value = match &field.value {
        Value::Ascii(parts) => {
            let text = parts
                .iter()
                .map(|part| String::from_utf8_lossy(part).trim_end_matches('\0').to_string())
                .collect::<Vec<_>>()
                .join(" ");
            ExifValue::Text(text)
        }
        Value::Undefined(raw, _) => undefined(raw),
        value if value_len(value) == Some(0) => return None,
        value if value_len(value) != Some(1) => displayed(),
        Value::Byte(v) => ExifValue::Integer(v[0] as i64),
        Value::Short(v) => ExifValue::Integer(v[0] as i64),
        Value::Long(v) => ExifValue::Integer(v[0] as i64),
        Value::SByte(v) => ExifValue::Integer(v[0] as i64),
        Value::SShort(v) => ExifValue::Integer(v[0] as i64),
        Value::SLong(v) => ExifValue::Integer(v[0] as i64),
        Value::Rational(v) if v[0].denom != 0 => ExifValue::Float(v[0].to_f64()),
        Value::SRational(v) if v[0].denom != 0 => ExifValue::Float(v[0].to_f64()),
        Value::Float(v) => ExifValue::Float(v[0] as f64),
        Value::Double(v) => ExifValue::Float(v[0]),
        _ => displayed(),
    };

    Some(value)
}

/// Undefined payloads are usually text in practice (`ExifVersion`,
/// `UserComment`); keep them as text when they read as such.
fn undefined(raw: &[u8]) -> ExifValue {
    match std::str::from_utf8(raw) {
        Ok(text) => {
            let text = text.trim_end_matches('\0');
            if text.chars().any(char::is_control) {
                ExifValue::Bytes(raw.to_vec())
            } else {
                ExifValue::Text(text.to_string())
            }
        }
        Err(_) => ExifValue::Bytes(raw.to_vec()),
    }
}

/// Number of components of a numeric value, `None` for other kinds.
fn value_len(value: &Value) -> Option<usize> {
    match value {
        Value::Byte(v) => Some(v.len()),
        Value::Short(v) => Some(v.len()),
        Value::Long(v) => Some(v.len()),
        Value::SByte(v) => Some(v.len()),
        Value::SShort(v) => Some(v.len()),
        Value::SLong(v) => Some(v.len()),
        Value::Rational(v) => Some(v.len()),
        Value::SRational(v) => Some(v.len()),
        Value::Float(v) => Some(v.len()),
        Value::Double(v) => Some(v.len()),
        _ => None,
    }
}
