// Copyright 2020 Joyent, Inc.

//! Primitive value encoding.
//!
//! This layer knows nothing about chunks or variables: it turns a typed
//! vector of values into bytes for one byte order. Numeric types are written
//! at their fixed width, chars are narrowed to a single byte, and strings,
//! URLs and opaque blobs are each preceded by an 8-byte length.

use std::fmt;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use num_traits::ToPrimitive;

use crate::error::{DapError, Result};

/// Byte order of a data payload. Chunk headers ignore this and are always
/// big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn native() -> Endian {
        if cfg!(target_endian = "little") {
            Endian::Little
        } else {
            Endian::Big
        }
    }
}

impl FromStr for Endian {
    type Err = DapError;

    fn from_str(s: &str) -> Result<Endian> {
        match s.to_ascii_lowercase().as_str() {
            "little" => Ok(Endian::Little),
            "big" => Ok(Endian::Big),
            _ => Err(DapError::bad_request(format!(
                "byte order must be little or big, not {}",
                s
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicType {
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Url,
    Opaque,
}

impl AtomicType {
    /// Serialized width of one element, or `None` for the variable-length
    /// types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            AtomicType::Char | AtomicType::Int8 | AtomicType::UInt8 => Some(1),
            AtomicType::Int16 | AtomicType::UInt16 => Some(2),
            AtomicType::Int32 | AtomicType::UInt32 | AtomicType::Float32 => Some(4),
            AtomicType::Int64 | AtomicType::UInt64 | AtomicType::Float64 => Some(8),
            AtomicType::String | AtomicType::Url | AtomicType::Opaque => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            AtomicType::Int8
                | AtomicType::UInt8
                | AtomicType::Int16
                | AtomicType::UInt16
                | AtomicType::Int32
                | AtomicType::UInt32
                | AtomicType::Int64
                | AtomicType::UInt64
        )
    }

    /// The element name used in the DMR.
    pub fn name(self) -> &'static str {
        match self {
            AtomicType::Char => "Char",
            AtomicType::Int8 => "Int8",
            AtomicType::UInt8 => "UInt8",
            AtomicType::Int16 => "Int16",
            AtomicType::UInt16 => "UInt16",
            AtomicType::Int32 => "Int32",
            AtomicType::UInt32 => "UInt32",
            AtomicType::Int64 => "Int64",
            AtomicType::UInt64 => "UInt64",
            AtomicType::Float32 => "Float32",
            AtomicType::Float64 => "Float64",
            AtomicType::String => "String",
            AtomicType::Url => "URL",
            AtomicType::Opaque => "Opaque",
        }
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A homogeneous vector of values as materialized by a data cursor.
/// `String` serves both String and URL variables; `Enum` carries the
/// enumeration constants' integer values.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    Char(Vec<char>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Opaque(Vec<Vec<u8>>),
    Enum(Vec<i64>),
}

macro_rules! each_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            Values::Char($v) => $body,
            Values::Int8($v) => $body,
            Values::UInt8($v) => $body,
            Values::Int16($v) => $body,
            Values::UInt16($v) => $body,
            Values::Int32($v) => $body,
            Values::UInt32($v) => $body,
            Values::Int64($v) => $body,
            Values::UInt64($v) => $body,
            Values::Float32($v) => $body,
            Values::Float64($v) => $body,
            Values::String($v) => $body,
            Values::Opaque($v) => $body,
            Values::Enum($v) => $body,
        }
    };
}

macro_rules! map_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            Values::Char($v) => Values::Char($body),
            Values::Int8($v) => Values::Int8($body),
            Values::UInt8($v) => Values::UInt8($body),
            Values::Int16($v) => Values::Int16($body),
            Values::UInt16($v) => Values::UInt16($body),
            Values::Int32($v) => Values::Int32($body),
            Values::UInt32($v) => Values::UInt32($body),
            Values::Int64($v) => Values::Int64($body),
            Values::UInt64($v) => Values::UInt64($body),
            Values::Float32($v) => Values::Float32($body),
            Values::Float64($v) => Values::Float64($body),
            Values::String($v) => Values::String($body),
            Values::Opaque($v) => Values::Opaque($body),
            Values::Enum($v) => Values::Enum($body),
        }
    };
}

impl Values {
    pub fn len(&self) -> usize {
        each_values!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the elements at `offsets`, in that order. Offsets past the end
    /// are an internal error: callers derive them from a validated shape.
    pub fn gather(&self, offsets: &[usize]) -> Result<Values> {
        let len = self.len();
        if let Some(bad) = offsets.iter().find(|o| **o >= len) {
            return Err(DapError::internal(format!(
                "element offset {} out of range for {} values",
                bad, len
            )));
        }
        Ok(map_values!(self, v => offsets.iter().map(|o| v[*o].clone()).collect()))
    }

    /// Whether these values can be written as elements of `wire`.
    pub fn fits(&self, wire: AtomicType) -> bool {
        match self {
            Values::Char(_) => wire == AtomicType::Char,
            Values::Int8(_) => wire == AtomicType::Int8,
            Values::UInt8(_) => wire == AtomicType::UInt8,
            Values::Int16(_) => wire == AtomicType::Int16,
            Values::UInt16(_) => wire == AtomicType::UInt16,
            Values::Int32(_) => wire == AtomicType::Int32,
            Values::UInt32(_) => wire == AtomicType::UInt32,
            Values::Int64(_) => wire == AtomicType::Int64,
            Values::UInt64(_) => wire == AtomicType::UInt64,
            Values::Float32(_) => wire == AtomicType::Float32,
            Values::Float64(_) => wire == AtomicType::Float64,
            Values::String(_) => wire == AtomicType::String || wire == AtomicType::Url,
            Values::Opaque(_) => wire == AtomicType::Opaque,
            Values::Enum(_) => wire.is_integer(),
        }
    }
}

/// Appends the encoding of `values` as elements of `wire` to `out`.
pub fn encode_values(
    values: &Values,
    wire: AtomicType,
    endian: Endian,
    out: &mut Vec<u8>,
) -> Result<()> {
    if !values.fits(wire) {
        return Err(DapError::internal(format!(
            "cannot encode {:?} values as {}",
            values_tag(values),
            wire
        )));
    }
    match endian {
        Endian::Big => encode_with::<BigEndian>(values, wire, out),
        Endian::Little => encode_with::<LittleEndian>(values, wire, out),
    }
}

pub fn encode_count(count: u64, endian: Endian, out: &mut Vec<u8>) {
    let mut word = [0u8; 8];
    match endian {
        Endian::Big => BigEndian::write_u64(&mut word, count),
        Endian::Little => LittleEndian::write_u64(&mut word, count),
    }
    out.extend_from_slice(&word);
}

pub fn encode_checksum(crc: u32, endian: Endian) -> [u8; 4] {
    let mut word = [0u8; 4];
    match endian {
        Endian::Big => BigEndian::write_u32(&mut word, crc),
        Endian::Little => LittleEndian::write_u32(&mut word, crc),
    }
    word
}

fn values_tag(values: &Values) -> &'static str {
    match values {
        Values::Char(_) => "Char",
        Values::Int8(_) => "Int8",
        Values::UInt8(_) => "UInt8",
        Values::Int16(_) => "Int16",
        Values::UInt16(_) => "UInt16",
        Values::Int32(_) => "Int32",
        Values::UInt32(_) => "UInt32",
        Values::Int64(_) => "Int64",
        Values::UInt64(_) => "UInt64",
        Values::Float32(_) => "Float32",
        Values::Float64(_) => "Float64",
        Values::String(_) => "String",
        Values::Opaque(_) => "Opaque",
        Values::Enum(_) => "Enum",
    }
}

fn encode_with<B: ByteOrder>(values: &Values, wire: AtomicType, out: &mut Vec<u8>) -> Result<()> {
    match values {
        Values::Char(v) => out.extend(v.iter().map(|c| *c as u32 as u8)),
        Values::Int8(v) => out.extend(v.iter().map(|x| *x as u8)),
        Values::UInt8(v) => out.extend_from_slice(v),
        Values::Int16(v) => {
            for x in v {
                out.write_i16::<B>(*x)?;
            }
        }
        Values::UInt16(v) => {
            for x in v {
                out.write_u16::<B>(*x)?;
            }
        }
        Values::Int32(v) => {
            for x in v {
                out.write_i32::<B>(*x)?;
            }
        }
        Values::UInt32(v) => {
            for x in v {
                out.write_u32::<B>(*x)?;
            }
        }
        Values::Int64(v) => {
            for x in v {
                out.write_i64::<B>(*x)?;
            }
        }
        Values::UInt64(v) => {
            for x in v {
                out.write_u64::<B>(*x)?;
            }
        }
        Values::Float32(v) => {
            for x in v {
                out.write_f32::<B>(*x)?;
            }
        }
        Values::Float64(v) => {
            for x in v {
                out.write_f64::<B>(*x)?;
            }
        }
        Values::String(v) => {
            for s in v {
                out.write_u64::<B>(s.len() as u64)?;
                out.extend_from_slice(s.as_bytes());
            }
        }
        Values::Opaque(v) => {
            for blob in v {
                out.write_u64::<B>(blob.len() as u64)?;
                out.extend_from_slice(blob);
            }
        }
        Values::Enum(v) => {
            for x in v {
                encode_enum_value::<B>(*x, wire, out)?;
            }
        }
    }
    Ok(())
}

fn encode_enum_value<B: ByteOrder>(value: i64, base: AtomicType, out: &mut Vec<u8>) -> Result<()> {
    let overflow = || {
        DapError::internal(format!("enum value {} does not fit base type {}", value, base))
    };
    match base {
        AtomicType::Int8 => out.write_i8(value.to_i8().ok_or_else(overflow)?)?,
        AtomicType::UInt8 => out.write_u8(value.to_u8().ok_or_else(overflow)?)?,
        AtomicType::Int16 => out.write_i16::<B>(value.to_i16().ok_or_else(overflow)?)?,
        AtomicType::UInt16 => out.write_u16::<B>(value.to_u16().ok_or_else(overflow)?)?,
        AtomicType::Int32 => out.write_i32::<B>(value.to_i32().ok_or_else(overflow)?)?,
        AtomicType::UInt32 => out.write_u32::<B>(value.to_u32().ok_or_else(overflow)?)?,
        AtomicType::Int64 => out.write_i64::<B>(value)?,
        AtomicType::UInt64 => out.write_u64::<B>(value.to_u64().ok_or_else(overflow)?)?,
        other => {
            return Err(DapError::internal(format!(
                "enum base type must be an integer, not {}",
                other
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_byte_order() {
        let mut big = Vec::new();
        encode_values(
            &Values::Int32(vec![1, -2]),
            AtomicType::Int32,
            Endian::Big,
            &mut big,
        )
        .unwrap();
        assert_eq!(big, vec![0, 0, 0, 1, 0xff, 0xff, 0xff, 0xfe]);

        let mut little = Vec::new();
        encode_values(
            &Values::UInt16(vec![0x0102]),
            AtomicType::UInt16,
            Endian::Little,
            &mut little,
        )
        .unwrap();
        assert_eq!(little, vec![0x02, 0x01]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut out = Vec::new();
        encode_values(
            &Values::String(vec!["ab".to_string(), "".to_string()]),
            AtomicType::String,
            Endian::Little,
            &mut out,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![2, 0, 0, 0, 0, 0, 0, 0, b'a', b'b', 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn opaque_is_length_prefixed() {
        let mut out = Vec::new();
        encode_values(
            &Values::Opaque(vec![vec![0xde, 0xad, 0xbe]]),
            AtomicType::Opaque,
            Endian::Big,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, 0, 0, 0, 3, 0xde, 0xad, 0xbe]);
    }

    #[test]
    fn chars_are_narrowed() {
        let mut out = Vec::new();
        encode_values(
            &Values::Char(vec!['a', 'Z']),
            AtomicType::Char,
            Endian::Big,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"aZ".to_vec());
    }

    #[test]
    fn enums_use_base_width() {
        let mut out = Vec::new();
        encode_values(
            &Values::Enum(vec![1, 2]),
            AtomicType::Int16,
            Endian::Big,
            &mut out,
        )
        .unwrap();
        assert_eq!(out, vec![0, 1, 0, 2]);

        let mut out = Vec::new();
        let err = encode_values(
            &Values::Enum(vec![300]),
            AtomicType::UInt8,
            Endian::Big,
            &mut out,
        )
        .unwrap_err();
        assert_eq!(err.http_code(), 500);
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let mut out = Vec::new();
        assert!(encode_values(
            &Values::Float32(vec![1.0]),
            AtomicType::Float64,
            Endian::Big,
            &mut out,
        )
        .is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn gather_picks_offsets() {
        let v = Values::Int16(vec![10, 11, 12, 13]);
        assert_eq!(v.gather(&[3, 0]).unwrap(), Values::Int16(vec![13, 10]));
        assert!(v.gather(&[4]).is_err());
    }

    #[test]
    fn byte_order_names() {
        assert_eq!("little".parse::<Endian>().unwrap(), Endian::Little);
        assert_eq!("BIG".parse::<Endian>().unwrap(), Endian::Big);
        assert!("native".parse::<Endian>().is_err());
    }

    #[test]
    fn counts() {
        let mut out = Vec::new();
        encode_count(3, Endian::Little, &mut out);
        assert_eq!(out, vec![3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_checksum(0x0102_0304, Endian::Big), [1, 2, 3, 4]);
    }
}
