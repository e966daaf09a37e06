//! Typed feature values decoded from encoded rows
//!
//! An encoded row carries only physical tags. The column's [`FeatureSpec`]
//! decides the logical value, including legacy list columns that were
//! stored as one delimited text value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{self, Field, FieldType};
use crate::error::{Error, Result};
use crate::model::{ColumnSchema, DataType, FeatureSpec};

/// A single feature value
///
/// Serialized untagged so the JSON output is the bare value:
/// `Int(42)` → `42`, `ArrayString(["a"])` → `["a"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Must stay first so `null` deserializes here
    Null,
    Int(i64),
    Float(f32),
    String(String),
    ArrayInt(Vec<i64>),
    ArrayFloat(Vec<f32>),
    ArrayString(Vec<String>),
}

impl FeatureValue {
    /// Interprets one decoded field according to its column spec
    pub fn from_field(field: &Field<'_>, spec: &FeatureSpec) -> Result<Self> {
        match field.field_type {
            FieldType::None => Ok(FeatureValue::Null),
            FieldType::Int64 => {
                let v = field
                    .as_int64()
                    .ok_or_else(|| Error::codec("int64 payload is not 8 bytes"))?;
                Ok(match spec.data_type {
                    DataType::Float32 => FeatureValue::Float(v as f32),
                    DataType::String => FeatureValue::String(v.to_string()),
                    _ => FeatureValue::Int(v),
                })
            }
            FieldType::Float32 => {
                let v = field
                    .as_float32()
                    .ok_or_else(|| Error::codec("float32 payload is not 4 bytes"))?;
                Ok(match spec.data_type {
                    DataType::String => FeatureValue::String(v.to_string()),
                    _ => FeatureValue::Float(v),
                })
            }
            FieldType::Bytes => {
                let text = String::from_utf8_lossy(field.raw);
                from_text(&text, spec)
            }
        }
    }
}

fn from_text(text: &str, spec: &FeatureSpec) -> Result<FeatureValue> {
    if spec.data_type.is_list() {
        return parse_list(text, spec);
    }
    match spec.data_type {
        DataType::Int64 => text
            .trim()
            .parse()
            .map(FeatureValue::Int)
            .map_err(|e| Error::codec(format!("'{}' is not an int64: {}", text, e))),
        DataType::Float32 => text
            .trim()
            .parse()
            .map(FeatureValue::Float)
            .map_err(|e| Error::codec(format!("'{}' is not a float32: {}", text, e))),
        _ => Ok(FeatureValue::String(text.to_string())),
    }
}

fn parse_list(text: &str, spec: &FeatureSpec) -> Result<FeatureValue> {
    let Some(separator) = spec.separator.as_deref() else {
        // Lists without a separator are stored as JSON arrays
        let value = match spec.data_type {
            DataType::Int64List => FeatureValue::ArrayInt(serde_json::from_str(text)?),
            DataType::Float32List => FeatureValue::ArrayFloat(serde_json::from_str(text)?),
            _ => FeatureValue::ArrayString(serde_json::from_str(text)?),
        };
        return Ok(value);
    };

    let items = text.split(separator).filter(|s| !s.is_empty());
    match spec.data_type {
        DataType::Int64List => items
            .map(|s| {
                s.trim()
                    .parse::<i64>()
                    .map_err(|e| Error::codec(format!("list item '{}' is not an int64: {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(FeatureValue::ArrayInt),
        DataType::Float32List => items
            .map(|s| {
                s.trim()
                    .parse::<f32>()
                    .map_err(|e| Error::codec(format!("list item '{}' is not a float32: {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(FeatureValue::ArrayFloat),
        _ => Ok(FeatureValue::ArrayString(
            items.map(str::to_string).collect(),
        )),
    }
}

/// Decodes an encoded row into named values
///
/// A malformed row is an error. A column whose payload does not match its
/// spec is logged and rendered as `Null`; the rest of the row survives.
pub fn row_values(buf: &[u8], columns: &[ColumnSchema]) -> Result<BTreeMap<String, FeatureValue>> {
    let reader = codec::decode(buf)?;
    if reader.column_count() != columns.len() {
        return Err(Error::codec(format!(
            "row has {} columns, schema has {}",
            reader.column_count(),
            columns.len()
        )));
    }

    let mut values = BTreeMap::new();
    for (field, column) in reader.zip(columns) {
        let field = field?;
        let value = FeatureValue::from_field(&field, &column.spec).unwrap_or_else(|e| {
            warn!(column = %column.name, error = %e, "Undecodable feature value");
            FeatureValue::Null
        });
        values.insert(column.name.clone(), value);
    }
    Ok(values)
}

/// Renders values as a JSON object body without the outer braces
///
/// This is the fragment shape [`crate::merge::JsonMergeOperator`] joins.
pub fn json_fragment(values: &BTreeMap<String, FeatureValue>) -> Result<Vec<u8>> {
    let mut object = serde_json::to_vec(values)?;
    // "{}" or "{...}": drop the braces
    object.pop();
    object.remove(0);
    Ok(object)
}
