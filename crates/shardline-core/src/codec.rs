//! Compact binary row codec
//!
//! One row of `N` typed column values is packed into a single buffer:
//!
//! ```text
//! ┌──────────────┬────────────────────┬─────────────────────────────┐
//! │ N (u32 LE)   │ ceil(N/4) tag bytes│ payloads in column order    │
//! └──────────────┴────────────────────┴─────────────────────────────┘
//! ```
//!
//! Each tag byte packs four 2-bit tags, low bits first. Payloads:
//!
//! | tag | type    | payload                      |
//! |-----|---------|------------------------------|
//! | 0   | none    | nothing                      |
//! | 1   | bytes   | u32 LE length + raw bytes    |
//! | 2   | int64   | 8 bytes LE                   |
//! | 3   | float32 | 4 bytes LE IEEE-754 bits     |
//!
//! Decoding is a forward-only iterator over borrowed spans of the input
//! buffer. No row container is materialized.

use crate::error::{Error, Result};

const HEADER_LEN: usize = 4;
const TAGS_PER_BYTE: usize = 4;

/// Type tag of one encoded column value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    None = 0,
    Bytes = 1,
    Int64 = 2,
    Float32 = 3,
}

impl FieldType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => FieldType::None,
            1 => FieldType::Bytes,
            2 => FieldType::Int64,
            _ => FieldType::Float32,
        }
    }
}

fn tag_len(columns: usize) -> usize {
    columns.div_ceil(TAGS_PER_BYTE)
}

/// Append-only encoder for one row
///
/// Every column must be pushed exactly once, in schema order.
/// `finish` refuses to produce a buffer for a partially written row.
#[derive(Debug)]
pub struct RowEncoder {
    buf: Vec<u8>,
    columns: usize,
    written: usize,
}

impl RowEncoder {
    /// Creates an encoder for a row with `columns` values
    pub fn new(columns: usize) -> Result<Self> {
        let count = u32::try_from(columns)
            .map_err(|_| Error::codec(format!("too many columns: {}", columns)))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + tag_len(columns) + columns * 8);
        buf.extend_from_slice(&count.to_le_bytes());
        buf.resize(HEADER_LEN + tag_len(columns), 0);

        Ok(Self {
            buf,
            columns,
            written: 0,
        })
    }

    /// Number of columns this row was created for
    pub fn columns(&self) -> usize {
        self.columns
    }

    fn push_tag(&mut self, field_type: FieldType) -> Result<()> {
        if self.written >= self.columns {
            return Err(Error::codec(format!(
                "row already holds all {} columns",
                self.columns
            )));
        }
        let byte = HEADER_LEN + self.written / TAGS_PER_BYTE;
        let shift = (self.written % TAGS_PER_BYTE) * 2;
        self.buf[byte] |= (field_type as u8) << shift;
        self.written += 1;
        Ok(())
    }

    pub fn push_none(&mut self) -> Result<()> {
        self.push_tag(FieldType::None)
    }

    pub fn push_bytes(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| Error::codec(format!("value too large: {} bytes", value.len())))?;
        self.push_tag(FieldType::Bytes)?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn push_int64(&mut self, value: i64) -> Result<()> {
        self.push_tag(FieldType::Int64)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn push_float32(&mut self, value: f32) -> Result<()> {
        self.push_tag(FieldType::Float32)?;
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
        Ok(())
    }

    /// Returns the encoded row
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.written != self.columns {
            return Err(Error::codec(format!(
                "row expects {} columns, {} written",
                self.columns, self.written
            )));
        }
        Ok(self.buf)
    }
}

/// One decoded value: its type tag and the raw payload span
///
/// For `Bytes` the span excludes the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub field_type: FieldType,
    pub raw: &'a [u8],
}

impl<'a> Field<'a> {
    pub fn is_none(&self) -> bool {
        self.field_type == FieldType::None
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.field_type {
            FieldType::Bytes => Some(self.raw),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self.field_type {
            FieldType::Int64 => self.raw.try_into().ok().map(i64::from_le_bytes),
            _ => None,
        }
    }

    pub fn as_float32(&self) -> Option<f32> {
        match self.field_type {
            FieldType::Float32 => self
                .raw
                .try_into()
                .ok()
                .map(|b| f32::from_bits(u32::from_le_bytes(b))),
            _ => None,
        }
    }
}

/// Lazy reader over an encoded row
///
/// Yields exactly `column_count()` fields, or stops after the first error.
#[derive(Debug, Clone)]
pub struct RowReader<'a> {
    buf: &'a [u8],
    columns: usize,
    index: usize,
    cursor: usize,
    failed: bool,
}

/// Starts decoding a row, validating only the header and tag area
pub fn decode(buf: &[u8]) -> Result<RowReader<'_>> {
    let header: [u8; HEADER_LEN] = buf
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::codec(format!("row too short for header: {} bytes", buf.len())))?;
    let columns = u32::from_le_bytes(header) as usize;

    let payload_start = HEADER_LEN + tag_len(columns);
    if buf.len() < payload_start {
        return Err(Error::codec(format!(
            "row declares {} columns but has only {} bytes",
            columns,
            buf.len()
        )));
    }

    Ok(RowReader {
        buf,
        columns,
        index: 0,
        cursor: payload_start,
        failed: false,
    })
}

/// Number of columns declared in an encoded row's header
pub fn column_count(buf: &[u8]) -> Result<usize> {
    decode(buf).map(|r| r.column_count())
}

/// Visits every field of an encoded row in column order
pub fn for_each_field<'a, F>(buf: &'a [u8], mut visit: F) -> Result<()>
where
    F: FnMut(usize, Field<'a>) -> Result<()>,
{
    for (i, field) in decode(buf)?.enumerate() {
        visit(i, field?)?;
    }
    Ok(())
}

impl<'a> RowReader<'a> {
    pub fn column_count(&self) -> usize {
        self.columns
    }

    fn tag_at(&self, index: usize) -> FieldType {
        let byte = self.buf[HEADER_LEN + index / TAGS_PER_BYTE];
        FieldType::from_bits(byte >> ((index % TAGS_PER_BYTE) * 2))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::codec(format!(
                    "column {} needs {} bytes at offset {}, row has {}",
                    self.index,
                    len,
                    self.cursor,
                    self.buf.len()
                ))
            })?;
        let span = &self.buf[self.cursor..end];
        self.cursor = end;
        Ok(span)
    }

    fn read_field(&mut self) -> Result<Field<'a>> {
        let field_type = self.tag_at(self.index);
        let raw = match field_type {
            FieldType::None => &self.buf[self.cursor..self.cursor],
            FieldType::Bytes => {
                let prefix = self.take(4)?;
                let mut len = [0u8; 4];
                len.copy_from_slice(prefix);
                self.take(u32::from_le_bytes(len) as usize)?
            }
            FieldType::Int64 => self.take(8)?,
            FieldType::Float32 => self.take(4)?,
        };
        Ok(Field { field_type, raw })
    }
}

impl<'a> Iterator for RowReader<'a> {
    type Item = Result<Field<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.columns {
            return None;
        }
        let field = self.read_field();
        match field {
            Ok(_) => self.index += 1,
            Err(_) => self.failed = true,
        }
        Some(field)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let remaining = self.columns - self.index;
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Value {
        None,
        Bytes(Vec<u8>),
        Int(i64),
        Float(f32),
    }

    fn encode(values: &[Value]) -> Vec<u8> {
        let mut enc = RowEncoder::new(values.len()).unwrap();
        for v in values {
            match v {
                Value::None => enc.push_none().unwrap(),
                Value::Bytes(b) => enc.push_bytes(b).unwrap(),
                Value::Int(i) => enc.push_int64(*i).unwrap(),
                Value::Float(f) => enc.push_float32(*f).unwrap(),
            }
        }
        enc.finish().unwrap()
    }

    fn decode_all(buf: &[u8]) -> Vec<Value> {
        decode(buf)
            .unwrap()
            .map(|f| {
                let f = f.unwrap();
                match f.field_type {
                    FieldType::None => Value::None,
                    FieldType::Bytes => Value::Bytes(f.as_bytes().unwrap().to_vec()),
                    FieldType::Int64 => Value::Int(f.as_int64().unwrap()),
                    FieldType::Float32 => Value::Float(f.as_float32().unwrap()),
                }
            })
            .collect()
    }

    #[test]
    fn test_empty_row() {
        let buf = encode(&[]);
        assert_eq!(buf, vec![0, 0, 0, 0]);
        assert!(decode_all(&buf).is_empty());
    }

    #[test]
    fn test_layout_matches_wire_format() {
        let buf = encode(&[Value::Int(7), Value::None, Value::Bytes(b"ab".to_vec())]);

        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        // tags: int64=2, none=0, bytes=1 -> 0b01_00_10
        assert_eq!(buf[4], 0b0001_0010);
        assert_eq!(&buf[5..13], &7i64.to_le_bytes());
        assert_eq!(&buf[13..17], &2u32.to_le_bytes());
        assert_eq!(&buf[17..], b"ab");
    }

    #[test]
    fn test_mixed_row_not_multiple_of_four() {
        let row = vec![
            Value::Bytes(b"alice".to_vec()),
            Value::Int(-42),
            Value::Float(3.5),
            Value::None,
            Value::Bytes(Vec::new()),
            Value::Float(f32::MIN_POSITIVE),
            Value::Int(i64::MAX),
        ];
        let buf = encode(&row);
        assert_eq!(column_count(&buf).unwrap(), 7);
        assert_eq!(decode_all(&buf), row);
    }

    #[test]
    fn test_trailing_none_columns() {
        // five columns need two tag bytes; the second holds a single none tag
        let row = vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::None,
        ];
        let buf = encode(&row);
        assert_eq!(buf.len(), 4 + 2 + 4 * 8);
        assert_eq!(decode_all(&buf), row);
    }

    #[test]
    fn test_encoder_rejects_wrong_column_count() {
        let mut enc = RowEncoder::new(2).unwrap();
        enc.push_int64(1).unwrap();
        assert!(matches!(enc.finish(), Err(Error::Codec(_))));

        let mut enc = RowEncoder::new(1).unwrap();
        enc.push_none().unwrap();
        assert!(enc.push_int64(2).is_err());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut buf = encode(&[Value::Bytes(b"hello".to_vec()), Value::Int(9)]);
        buf.truncate(buf.len() - 3);

        let fields: Vec<_> = decode(&buf).unwrap().collect();
        assert_eq!(fields.len(), 2);
        assert!(fields[0].is_ok());
        assert!(fields[1].is_err());
    }

    #[test]
    fn test_short_header_is_error() {
        assert!(decode(&[1, 0]).is_err());
        // declares 9 columns (3 tag bytes) but has only one
        assert!(decode(&[9, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_for_each_field_visits_in_order() {
        let buf = encode(&[Value::Int(10), Value::Float(0.25), Value::None]);
        let mut seen = Vec::new();
        for_each_field(&buf, |i, f| {
            seen.push((i, f.field_type));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (0, FieldType::Int64),
                (1, FieldType::Float32),
                (2, FieldType::None)
            ]
        );
    }

    #[test]
    fn test_typed_accessors_reject_other_types() {
        let buf = encode(&[Value::Int(5)]);
        let field = decode(&buf).unwrap().next().unwrap().unwrap();
        assert_eq!(field.as_int64(), Some(5));
        assert_eq!(field.as_float32(), None);
        assert_eq!(field.as_bytes(), None);
        assert!(!field.is_none());
    }
}
