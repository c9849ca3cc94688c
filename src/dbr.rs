//! Represent CA DBR representations, and translate them to and from native values.
//!
//! CA defines a family of [DBR] kinds used to transfer data back and forth. These can
//! be broken down into seven basic array types, which define the data, and a handful
//! of categories of attached metadata. This module models this and provides the
//! pure translation layer between the big-endian payloads that cross the transport
//! boundary and the values handed to callers.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into the state-name table carried by the
//!   `GR`/`CTRL` categories.
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but for interchange
//!   here is represented by [`Vec<String>`], and is converted back and forth to
//!   fixed-length as required.
//!
//! The categories are enumerated by [`DbrCategory`] and represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - Everything from [`Dbr::Status`], plus a timestamp.
//! - [`Dbr::Graphics`] - Status plus units, precision and display/alarm/warning
//!   limits, or the enum state names for enumerated fields.
//! - [`Dbr::Control`] - Everything from [`Dbr::Graphics`] plus control limits.
//!
//! Callers mostly meet the results of this module as a [`Reading`]: a [`CaValue`]
//! (a bare scalar for single-element fields, a sequence otherwise) plus the
//! [`Metadata`] extracted from the TIME or CTRL header.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{NumCast, cast::AsPrimitive};
use std::{
    cmp,
    convert::TryFrom,
    fmt::{self, Display},
    io::{self, Cursor, Write},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::transport::ErrorCondition;

// Constants from EPICS
pub const MAX_STRING_SIZE: usize = 40;
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;

/// Errors raised translating between payloads and values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("Malformed {data_type} payload for {count} element(s)")]
    Malformed { data_type: DbrType, count: usize },
    #[error("Cannot put value {value} to a channel of type {target}")]
    Incompatible { value: String, target: String },
}

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >
/// max_length. But we can't convert and truncate because although we don't
/// _expect_ to ever handle non-ASCII it technically isn't guaranteed. So,
/// convert one-character-at-a-time until the length would go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Write a string as a null-padded field of exactly `length` bytes
fn write_fixed_string<W: Write>(writer: &mut W, value: &str, length: usize) -> io::Result<()> {
    let mut buf = string_to_fixed_length_bytes(value, length);
    buf.resize(length, 0u8);
    writer.write_all(&buf)
}

/// Read a fixed-width string field, trimmed at the first null and trailing whitespace
fn fixed_string(input: &[u8], length: usize) -> IResult<&[u8], String> {
    let (input, raw_string) = take(length).parse(input)?;
    let strlen = raw_string.iter().position(|&c| c == 0x00).unwrap_or(length);
    Ok((
        input,
        String::from_utf8_lossy(&raw_string[0..strlen])
            .trim_end()
            .to_owned(),
    ))
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}
/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug)]
pub enum DbrParseError {
    SelfIsNotString,
    CannotParse(String),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrParseError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [single] => DbrValue::Enum(
                    single
                        .trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(single.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        /// A single numeric element can become an enum index
        fn _to_enum<T: Copy + NumCast>(from: &[T]) -> Result<DbrValue, ErrorCondition> {
            match from {
                [val] => Ok(DbrValue::Enum(
                    NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?,
                )),
                _ => Err(ErrorCondition::NoConvert),
            }
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(vec![<i32 as From<u16>>::from(*val)]),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(vec![<f32 as From<u16>>::from(*val)]),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(vec![<f64 as From<u16>>::from(*val)]),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(
                        val.iter()
                            .take_while(|c| **c != 0)
                            .map(|c| *c as u8)
                            .collect(),
                    )
                    .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                DbrValue::Int(val) => DbrValue::String(val.iter().map(|v| v.to_string()).collect()),
                DbrValue::Long(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Float(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Double(val) => {
                    DbrValue::String(val.iter().map(|v| v.to_string()).collect())
                }
                DbrValue::Enum(val) => DbrValue::String(vec![val.to_string()]),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => _to_enum(val)?,
                DbrValue::Int(val) => _to_enum(val)?,
                DbrValue::Long(val) => _to_enum(val)?,
                DbrValue::Float(val) => _to_enum(val)?,
                DbrValue::Double(val) => _to_enum(val)?,
                DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val.to_be_bytes().to_vec(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| {
                        let mut buf = string_to_fixed_length_bytes(v, MAX_STRING_SIZE - 1);
                        buf.resize(MAX_STRING_SIZE, 0u8);
                        buf
                    })
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> IResult<&[u8], DbrValue> {
        match data_type {
            DbrBasicType::Enum => {
                // Enum fields are scalar; only the first index is kept
                let (data, values) = count(be_u16, cmp::max(item_count, 1)).parse(data)?;
                Ok((data, DbrValue::Enum(values[0])))
            }
            DbrBasicType::String => {
                let (data, strings) =
                    count(|d| fixed_string(d, MAX_STRING_SIZE), item_count).parse(data)?;
                Ok((data, DbrValue::String(strings)))
            }
            DbrBasicType::Char => {
                let (data, v) = count(be_i8, item_count).parse(data)?;
                Ok((data, DbrValue::Char(v)))
            }
            DbrBasicType::Int => {
                let (data, v) = count(be_i16, item_count).parse(data)?;
                Ok((data, DbrValue::Int(v)))
            }
            DbrBasicType::Long => {
                let (data, v) = count(be_i32, item_count).parse(data)?;
                Ok((data, DbrValue::Long(v)))
            }
            DbrBasicType::Float => {
                let (data, v) = count(be_f32, item_count).parse(data)?;
                Ok((data, DbrValue::Float(v)))
            }
            DbrBasicType::Double => {
                let (data, v) = count(be_f64, item_count).parse(data)?;
                Ok((data, DbrValue::Double(v)))
            }
        }
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::BadCount)
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}
impl From<u16> for DbrValue {
    fn from(value: u16) -> Self {
        DbrValue::Enum(value)
    }
}
impl TryFrom<&DbrValue> for u16 {
    type Error = ErrorCondition;
    fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
        match value.convert_to(DbrBasicType::Enum)? {
            DbrValue::Enum(v) => Ok(v),
            _ => Err(ErrorCondition::NoConvert),
        }
    }
}

/// Display, alarm and warning limits, each as `(lower, upper)`
///
/// Limits are carried as `f64` whatever the field type; every CA numeric type is
/// exactly representable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Limits {
    pub display: (f64, f64),
    pub alarm: (f64, f64),
    pub warning: (f64, f64),
}

/// The `GR` metadata block, whose shape depends on the basic type
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    String,
    Enum {
        strings: Vec<String>,
    },
    Numeric {
        units: String,
        /// Only carried by `FLOAT` and `DOUBLE`
        precision: Option<i16>,
        limits: Limits,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                strings: Vec::new(),
            },
            DbrBasicType::Float | DbrBasicType::Double => DbrGraphics::Numeric {
                units: String::new(),
                precision: Some(0),
                limits: Limits::default(),
            },
            _ => DbrGraphics::Numeric {
                units: String::new(),
                precision: None,
                limits: Limits::default(),
            },
        }
    }

    fn write_be<W: Write>(
        &self,
        writer: &mut W,
        basic_type: DbrBasicType,
        control_limits: Option<(f64, f64)>,
    ) -> io::Result<()> {
        match basic_type {
            DbrBasicType::String => Ok(()),
            DbrBasicType::Enum => {
                let strings: &[String] = match self {
                    DbrGraphics::Enum { strings } => strings,
                    _ => &[],
                };
                let no_str = cmp::min(strings.len(), MAX_ENUM_STATES);
                writer.write_all(&(no_str as i16).to_be_bytes())?;
                for i in 0..MAX_ENUM_STATES {
                    let state = strings.get(i).map(String::as_str).unwrap_or("");
                    write_fixed_string(writer, state, MAX_ENUM_STRING_SIZE)?;
                }
                Ok(())
            }
            numeric => {
                let (units, precision, limits) = match self {
                    DbrGraphics::Numeric {
                        units,
                        precision,
                        limits,
                    } => (units.as_str(), *precision, limits.clone()),
                    _ => ("", None, Limits::default()),
                };
                if matches!(numeric, DbrBasicType::Float | DbrBasicType::Double) {
                    writer.write_all(&precision.unwrap_or(0).to_be_bytes())?;
                    // RISC alignment pad
                    writer.write_all(&[0u8; 2])?;
                }
                write_fixed_string(writer, units, MAX_UNITS_SIZE)?;
                let (d_l, d_u) = limits.display;
                let (a_l, a_u) = limits.alarm;
                let (w_l, w_u) = limits.warning;
                for limit in [d_u, d_l, a_u, w_u, w_l, a_l] {
                    write_limit(writer, numeric, limit)?;
                }
                if let Some((c_l, c_u)) = control_limits {
                    write_limit(writer, numeric, c_u)?;
                    write_limit(writer, numeric, c_l)?;
                }
                Ok(())
            }
        }
    }

    fn parse(
        input: &[u8],
        basic_type: DbrBasicType,
        with_control: bool,
    ) -> IResult<&[u8], (DbrGraphics, Option<(f64, f64)>)> {
        match basic_type {
            DbrBasicType::String => Ok((input, (DbrGraphics::String, None))),
            DbrBasicType::Enum => {
                let (input, no_str) = be_i16(input)?;
                let (input, mut strings) = count(
                    |d| fixed_string(d, MAX_ENUM_STRING_SIZE),
                    MAX_ENUM_STATES,
                )
                .parse(input)?;
                strings.truncate(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize);
                Ok((input, (DbrGraphics::Enum { strings }, None)))
            }
            numeric => {
                let (input, precision) =
                    if matches!(numeric, DbrBasicType::Float | DbrBasicType::Double) {
                        let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
                        (input, Some(precision))
                    } else {
                        (input, None)
                    };
                let (input, units) = fixed_string(input, MAX_UNITS_SIZE)?;
                let (input, d_u) = parse_limit(input, numeric)?;
                let (input, d_l) = parse_limit(input, numeric)?;
                let (input, a_u) = parse_limit(input, numeric)?;
                let (input, w_u) = parse_limit(input, numeric)?;
                let (input, w_l) = parse_limit(input, numeric)?;
                let (input, a_l) = parse_limit(input, numeric)?;
                let (input, control) = if with_control {
                    let (input, c_u) = parse_limit(input, numeric)?;
                    let (input, c_l) = parse_limit(input, numeric)?;
                    (input, Some((c_l, c_u)))
                } else {
                    (input, None)
                };
                Ok((
                    input,
                    (
                        DbrGraphics::Numeric {
                            units,
                            precision,
                            limits: Limits {
                                display: (d_l, d_u),
                                alarm: (a_l, a_u),
                                warning: (w_l, w_u),
                            },
                        },
                        control,
                    ),
                ))
            }
        }
    }
}

/// Write a single limit value in the wire representation of `basic_type`
fn write_limit<W: Write>(writer: &mut W, basic_type: DbrBasicType, value: f64) -> io::Result<()> {
    match basic_type {
        DbrBasicType::Char => writer.write_all(&(value as i8).to_be_bytes()),
        DbrBasicType::Int | DbrBasicType::Enum => writer.write_all(&(value as i16).to_be_bytes()),
        DbrBasicType::Long => writer.write_all(&(value as i32).to_be_bytes()),
        DbrBasicType::Float => writer.write_all(&(value as f32).to_be_bytes()),
        DbrBasicType::Double => writer.write_all(&value.to_be_bytes()),
        DbrBasicType::String => Ok(()),
    }
}

fn parse_limit(input: &[u8], basic_type: DbrBasicType) -> IResult<&[u8], f64> {
    match basic_type {
        DbrBasicType::Char => {
            let (input, v) = be_i8(input)?;
            Ok((input, <f64 as From<i8>>::from(v)))
        }
        DbrBasicType::Int | DbrBasicType::Enum => {
            let (input, v) = be_i16(input)?;
            Ok((input, <f64 as From<i16>>::from(v)))
        }
        DbrBasicType::Long => {
            let (input, v) = be_i32(input)?;
            Ok((input, <f64 as From<i32>>::from(v)))
        }
        DbrBasicType::Float => {
            let (input, v) = be_f32(input)?;
            Ok((input, <f64 as From<f32>>::from(v)))
        }
        DbrBasicType::Double => be_f64(input),
        DbrBasicType::String => Ok((input, 0.0)),
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// Size in bytes of a single element on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Int => 2,
            DbrBasicType::Float => 4,
            DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Basic,
};

pub const DBR_TIME_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Time,
};

pub const DBR_CTRL_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Control,
};

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
        };
        let kind = match self.basic_type {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "INT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        };
        write!(f, "DBR_{category}{kind}")
    }
}

impl DbrType {
    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculations. Padding internal to the GR/CTRL blocks of
    /// `FLOAT` and `DOUBLE` is written with the block itself.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }

    /// Size of the metadata header, including padding, ahead of the first value
    pub fn metadata_size(&self) -> usize {
        let limit = self.basic_type.element_size();
        let header = match (self.category, self.basic_type) {
            (DbrCategory::Basic, _) => 0,
            (DbrCategory::Status, _) => 4,
            (DbrCategory::Time, _) => 12,
            (DbrCategory::Graphics | DbrCategory::Control, DbrBasicType::String) => 4,
            (DbrCategory::Graphics | DbrCategory::Control, DbrBasicType::Enum) => {
                6 + MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE
            }
            (category, basic) => {
                let precision = if matches!(basic, DbrBasicType::Float | DbrBasicType::Double)
                {
                    4
                } else {
                    0
                };
                let limits = if category == DbrCategory::Control { 8 } else { 6 };
                4 + precision + MAX_UNITS_SIZE + limits * limit
            }
        };
        header + self.get_metadata_padding()
    }

    /// Total bytes needed to carry `count` elements of this type
    pub fn payload_size(&self, count: usize) -> usize {
        self.metadata_size() + self.basic_type.element_size() * cmp::max(count, 1)
    }

    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Promote a native field type to its TIME or CTRL variant
    ///
    /// CTRL takes precedence. There is no useful CTRL block for strings, so
    /// `CTRL_STRING` is demoted to `TIME_STRING`.
    pub fn promote(native: DbrBasicType, use_time: bool, use_ctrl: bool) -> DbrType {
        let promoted = if use_ctrl {
            DbrType::new(native, DbrCategory::Control)
        } else if use_time {
            DbrType::new(native, DbrCategory::Time)
        } else {
            DbrType::new(native, DbrCategory::Basic)
        };
        if promoted == DBR_CTRL_STRING {
            DBR_TIME_STRING
        } else {
            promoted
        }
    }

    /// The native (plain) type underlying a TIME or CTRL variant
    pub fn native(&self) -> DbrType {
        DbrType::new(self.basic_type, DbrCategory::Basic)
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = upper.strip_prefix("DBR_").unwrap_or(&upper);
        let category = if let Some((cats, rest)) = s.split_once('_') {
            s = rest;
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(()),
        };
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        /// `(lower, upper)`; ignored for string and enum fields
        control_limits: (f64, f64),
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType::new(self.value().get_type(), category)
    }

    /// Collect the metadata carried alongside the value
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata {
            status: self.status(),
            ..Default::default()
        };
        let (graphics, control) = match self {
            Dbr::Time { timestamp, .. } => {
                meta.timestamp = Some(*timestamp);
                (None, None)
            }
            Dbr::Graphics { graphics, .. } => (Some(graphics), None),
            Dbr::Control {
                graphics,
                control_limits,
                ..
            } => (Some(graphics), Some(*control_limits)),
            _ => (None, None),
        };
        match graphics {
            Some(DbrGraphics::Enum { strings }) => meta.enum_strings = Some(strings.clone()),
            Some(DbrGraphics::Numeric {
                units,
                precision,
                limits,
            }) => {
                meta.units = Some(units.clone());
                meta.precision = *precision;
                meta.display_limits = Some(limits.display);
                meta.alarm_limits = Some(limits.alarm);
                meta.warning_limits = Some(limits.warning);
                meta.control_limits = control;
            }
            _ => (),
        }
        meta
    }

    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, CodecError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| CodecError::Malformed {
                data_type,
                count: data_count,
            })
    }

    fn parse(data_type: DbrType, data_count: usize, data: &[u8]) -> IResult<&[u8], Dbr> {
        let (data, status) = if data_type.category != DbrCategory::Basic {
            let (d, (status, severity)) = (be_i16, be_i16).parse(data)?;
            (d, Some(Status { status, severity }))
        } else {
            (data, None)
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = (be_u32, be_u32).parse(data)?;
            (
                input,
                UNIX_EPOCH.checked_add(Duration::new(
                    <u64 as From<u32>>::from(time_s) + EPICS_EPOCH_OFFSET,
                    time_ns,
                )),
            )
        } else {
            (data, None)
        };

        let (data, graphics) = match data_type.category {
            DbrCategory::Graphics => {
                let (d, (graphics, _)) = DbrGraphics::parse(data, data_type.basic_type, false)?;
                (d, Some((graphics, None)))
            }
            DbrCategory::Control => {
                let (d, (graphics, control)) =
                    DbrGraphics::parse(data, data_type.basic_type, true)?;
                (d, Some((graphics, control)))
            }
            _ => (data, None),
        };

        // Offset the read buffer to account for metadata padding
        let (data, _) = take(data_type.get_metadata_padding()).parse(data)?;
        let (data, value) = DbrValue::decode_value(data_type.basic_type, data_count, data)?;

        let status = status.unwrap_or_default();
        Ok((
            data,
            match (data_type.category, graphics) {
                (DbrCategory::Basic, _) => Dbr::Basic(value),
                (DbrCategory::Status, _) => Dbr::Status { status, value },
                (DbrCategory::Time, _) => Dbr::Time {
                    status,
                    timestamp: timestamp.unwrap_or(UNIX_EPOCH),
                    value,
                },
                (DbrCategory::Control, Some((graphics, control))) => Dbr::Control {
                    status,
                    graphics,
                    control_limits: control.unwrap_or_default(),
                    value,
                },
                (_, graphics) => Dbr::Graphics {
                    status,
                    graphics: graphics
                        .map(|(g, _)| g)
                        .unwrap_or_else(|| DbrGraphics::default_for(data_type.basic_type)),
                    value,
                },
            },
        ))
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        // Writing into a Vec cannot fail
        let real_count = self.write_be(&mut buffer, max_elems).unwrap_or_default();
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        let basic_type = self.value().get_type();
        // All except Basic write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .saturating_sub(Duration::from_secs(EPICS_EPOCH_OFFSET));
                writer.write_all(&(unix_time.as_secs() as u32).to_be_bytes())?;
                writer.write_all(&unix_time.subsec_nanos().to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => {
                graphics.write_be(writer, basic_type, None)?;
            }
            Dbr::Control {
                graphics,
                control_limits,
                ..
            } => {
                graphics.write_be(writer, basic_type, Some(*control_limits))?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }
}

/// Metadata extracted from TIME or CTRL payloads
///
/// Every field is optional; which ones are present depends on the category and on
/// the native type of the channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub status: Option<Status>,
    pub timestamp: Option<SystemTime>,
    pub precision: Option<i16>,
    pub units: Option<String>,
    /// `(lower, upper)`
    pub display_limits: Option<(f64, f64)>,
    pub alarm_limits: Option<(f64, f64)>,
    pub warning_limits: Option<(f64, f64)>,
    pub control_limits: Option<(f64, f64)>,
    pub enum_strings: Option<Vec<String>>,
}

impl Metadata {
    pub fn severity(&self) -> Option<i16> {
        self.status.map(|s| s.severity)
    }
}

/// A decoded value, as handed to callers
///
/// Single-element fields always decode to a bare scalar variant, never to a
/// one-element [`CaValue::Array`]. Callers rely on this to tell single values
/// from waveforms.
#[derive(Clone, Debug, PartialEq)]
pub enum CaValue {
    String(String),
    Enum(u16),
    Char(i8),
    Int(i16),
    Long(i32),
    Float(f32),
    Double(f64),
    Array(DbrValue),
}

impl CaValue {
    /// Unwrap single elements to scalars
    pub fn from_dbr_value(value: DbrValue) -> CaValue {
        match value {
            DbrValue::Enum(v) => CaValue::Enum(v),
            DbrValue::String(mut v) if v.len() == 1 => CaValue::String(v.remove(0)),
            DbrValue::Char(v) if v.len() == 1 => CaValue::Char(v[0]),
            DbrValue::Int(v) if v.len() == 1 => CaValue::Int(v[0]),
            DbrValue::Long(v) if v.len() == 1 => CaValue::Long(v[0]),
            DbrValue::Float(v) if v.len() == 1 => CaValue::Float(v[0]),
            DbrValue::Double(v) if v.len() == 1 => CaValue::Double(v[0]),
            other => CaValue::Array(other),
        }
    }

    /// Rewrap as a [`DbrValue`] holding one element per scalar
    pub fn to_dbr_value(&self) -> DbrValue {
        match self {
            CaValue::String(v) => DbrValue::String(vec![v.clone()]),
            CaValue::Enum(v) => DbrValue::Enum(*v),
            CaValue::Char(v) => DbrValue::Char(vec![*v]),
            CaValue::Int(v) => DbrValue::Int(vec![*v]),
            CaValue::Long(v) => DbrValue::Long(vec![*v]),
            CaValue::Float(v) => DbrValue::Float(vec![*v]),
            CaValue::Double(v) => DbrValue::Double(vec![*v]),
            CaValue::Array(v) => v.clone(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, CaValue::Array(_))
    }
}

impl Display for CaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|v| format!("{v}"))
                .collect::<Vec<String>>()
                .join(" ")
        }
        match self {
            CaValue::String(v) => write!(f, "{v}"),
            CaValue::Enum(v) => write!(f, "{v}"),
            CaValue::Char(v) => write!(f, "{v}"),
            CaValue::Int(v) => write!(f, "{v}"),
            CaValue::Long(v) => write!(f, "{v}"),
            CaValue::Float(v) => write!(f, "{v}"),
            CaValue::Double(v) => write!(f, "{v}"),
            CaValue::Array(DbrValue::String(v)) => write!(f, "{}", v.join(" ")),
            CaValue::Array(DbrValue::Enum(v)) => write!(f, "{v}"),
            CaValue::Array(DbrValue::Char(v)) => write!(f, "{}", join(v)),
            CaValue::Array(DbrValue::Int(v)) => write!(f, "{}", join(v)),
            CaValue::Array(DbrValue::Long(v)) => write!(f, "{}", join(v)),
            CaValue::Array(DbrValue::Float(v)) => write!(f, "{}", join(v)),
            CaValue::Array(DbrValue::Double(v)) => write!(f, "{}", join(v)),
        }
    }
}

macro_rules! impl_cavalue_from {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for CaValue {
            fn from(value: $typ) -> Self {
                CaValue::$variant(value)
            }
        }
        impl From<Vec<$typ>> for CaValue {
            fn from(value: Vec<$typ>) -> Self {
                CaValue::Array(DbrValue::from(value))
            }
        }
    };
}
impl_cavalue_from!(Char, i8);
impl_cavalue_from!(Int, i16);
impl_cavalue_from!(Long, i32);
impl_cavalue_from!(Float, f32);
impl_cavalue_from!(Double, f64);
impl_cavalue_from!(String, String);

impl From<&str> for CaValue {
    fn from(value: &str) -> Self {
        CaValue::String(value.to_owned())
    }
}
impl From<u16> for CaValue {
    fn from(value: u16) -> Self {
        CaValue::Enum(value)
    }
}

/// A fully decoded payload: the value plus whatever metadata it carried
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub data_type: DbrType,
    pub count: usize,
    pub value: CaValue,
    pub metadata: Metadata,
}

/// Decode a raw payload of `count` elements of `data_type`
///
/// The caller is responsible for having sized `count` as
/// `min(requested, channel element count)`.
pub fn decode(data_type: DbrType, count: usize, data: &[u8]) -> Result<Reading, CodecError> {
    let dbr = Dbr::from_bytes(data_type, count, data)?;
    let metadata = dbr.metadata();
    Ok(Reading {
        data_type,
        count,
        value: CaValue::from_dbr_value(dbr.take_value()),
        metadata,
    })
}

/// Build the value to write to a channel of `native_type` holding `count` elements
///
/// The result always holds exactly `count` elements:
/// - string channels copy text element-wise, up to the lesser of the two lengths;
/// - character arrays accept text, null-padded (or truncated) to `count`;
/// - numeric arrays copy up to the lesser of the two lengths, silently dropping
///   excess entries and zero-filling the remainder;
/// - enumerated channels pass state names through as `STRING`;
/// - single-element channels take a scalar, converting numerically or by parsing
///   text.
pub fn encode_put(
    value: &CaValue,
    native_type: DbrBasicType,
    count: usize,
) -> Result<DbrValue, CodecError> {
    let incompatible = || CodecError::Incompatible {
        value: format!("{value:?}"),
        target: format!("{}", DbrType::new(native_type, DbrCategory::Basic)),
    };
    let convert = |source: &DbrValue| -> Result<DbrValue, CodecError> {
        if source.get_type() == DbrBasicType::String && native_type != DbrBasicType::String {
            source.parse_into(native_type).map_err(|_| incompatible())
        } else {
            source.convert_to(native_type).map_err(|_| incompatible())
        }
    };

    if native_type == DbrBasicType::String {
        let strings = match value {
            CaValue::String(s) => vec![s.clone()],
            CaValue::Array(DbrValue::String(v)) => v.clone(),
            _ => return Err(incompatible()),
        };
        let mut out = vec![String::new(); cmp::max(count, 1)];
        for (slot, s) in out.iter_mut().zip(strings) {
            *slot = s;
        }
        return Ok(DbrValue::String(out));
    }

    // State names are resolved by the server
    if let CaValue::String(s) = value
        && native_type == DbrBasicType::Enum
        && s.trim().parse::<u16>().is_err()
    {
        return Ok(DbrValue::String(vec![s.clone()]));
    }

    if count <= 1 {
        if !value.is_scalar() {
            return Err(incompatible());
        }
        return convert(&value.to_dbr_value());
    }

    let source = match value {
        CaValue::String(s) if native_type == DbrBasicType::Char => {
            DbrValue::Char(s.bytes().map(|b| b as i8).collect())
        }
        CaValue::Array(v) => v.clone(),
        _ => return Err(incompatible()),
    };
    let mut converted = convert(&source)?;
    converted.resize(count).map_err(|_| incompatible())?;
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);
    }

    #[test]
    fn encode_time_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr.to_bytes(None);
        assert_eq!(out_data, example_packet);
        assert_eq!(
            out_data.len(),
            DbrType::new(DbrBasicType::Long, DbrCategory::Time).payload_size(1)
        );

        // And back, with the timestamp moved onto the UNIX epoch
        let reading = decode(dbr.data_type(), 1, &out_data).unwrap();
        assert_eq!(reading.value, CaValue::Long(42));
        assert_eq!(
            reading.metadata.timestamp,
            UNIX_EPOCH.checked_add(Duration::from_secs(1741731609))
        );
    }

    #[test]
    fn single_elements_decode_to_scalars() {
        let bytes = 3.5f64.to_be_bytes();
        let reading = decode(DbrType::new(DbrBasicType::Double, DbrCategory::Basic), 1, &bytes)
            .unwrap();
        assert_eq!(reading.value, CaValue::Double(3.5));
        assert!(reading.value.is_scalar());

        let bytes: Vec<u8> = [1i16, 2, 3].iter().flat_map(|v| v.to_be_bytes()).collect();
        let data_type = DbrType::new(DbrBasicType::Int, DbrCategory::Basic);
        assert_eq!(
            decode(data_type, 3, &bytes).unwrap().value,
            CaValue::Array(DbrValue::Int(vec![1, 2, 3]))
        );
        // Fewer requested elements only decodes those
        assert_eq!(
            decode(data_type, 2, &bytes).unwrap().value,
            CaValue::Array(DbrValue::Int(vec![1, 2]))
        );
        assert_eq!(decode(data_type, 1, &bytes).unwrap().value, CaValue::Int(1));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let data_type = DbrType::new(DbrBasicType::Long, DbrCategory::Time);
        assert_eq!(
            decode(data_type, 2, &[0u8; 14]),
            Err(CodecError::Malformed {
                data_type,
                count: 2
            })
        );
    }

    #[test]
    fn strings_are_trimmed() {
        let mut raw = b"hello  ".to_vec();
        raw.resize(MAX_STRING_SIZE, 0);
        raw[10] = b'x';
        let mut second = b"world".to_vec();
        second.resize(MAX_STRING_SIZE, 0);
        raw.extend(second);

        assert_eq!(
            decode(DBR_BASIC_STRING, 1, &raw).unwrap().value,
            CaValue::String("hello".to_owned())
        );
        assert_eq!(
            decode(DBR_BASIC_STRING, 2, &raw).unwrap().value,
            CaValue::Array(DbrValue::String(vec![
                "hello".to_owned(),
                "world".to_owned()
            ]))
        );
    }

    #[test]
    fn ctrl_enum_carries_state_names() {
        let dbr = Dbr::Control {
            status: Status {
                status: 0,
                severity: 1,
            },
            graphics: DbrGraphics::Enum {
                strings: vec!["Off".into(), "On".into(), "Fault".into()],
            },
            control_limits: (0.0, 0.0),
            value: DbrValue::Enum(2),
        };
        let data_type = DbrType::new(DbrBasicType::Enum, DbrCategory::Control);
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 424);
        assert_eq!(bytes.len(), data_type.payload_size(1));

        let reading = decode(data_type, 1, &bytes).unwrap();
        assert_eq!(reading.value, CaValue::Enum(2));
        assert_eq!(reading.metadata.severity(), Some(1));
        assert_eq!(
            reading.metadata.enum_strings,
            Some(vec!["Off".to_owned(), "On".to_owned(), "Fault".to_owned()])
        );
    }

    #[test]
    fn ctrl_double_layout() {
        let dbr = Dbr::Control {
            status: Status::default(),
            graphics: DbrGraphics::Numeric {
                units: "mm".into(),
                precision: Some(3),
                limits: Limits {
                    display: (-10.0, 10.0),
                    alarm: (-9.0, 9.0),
                    warning: (-8.0, 8.0),
                },
            },
            control_limits: (-5.0, 5.0),
            value: DbrValue::Double(vec![1.25, 2.5]),
        };
        let (_, bytes) = dbr.to_bytes(None);
        // sizeof(struct dbr_ctrl_double) is 88 for one element
        assert_eq!(bytes.len(), 88 + 8);

        let reading = decode(dbr.data_type(), 2, &bytes).unwrap();
        let meta = reading.metadata;
        assert_eq!(meta.units.as_deref(), Some("mm"));
        assert_eq!(meta.precision, Some(3));
        assert_eq!(meta.display_limits, Some((-10.0, 10.0)));
        assert_eq!(meta.alarm_limits, Some((-9.0, 9.0)));
        assert_eq!(meta.warning_limits, Some((-8.0, 8.0)));
        assert_eq!(meta.control_limits, Some((-5.0, 5.0)));
        assert_eq!(
            reading.value,
            CaValue::Array(DbrValue::Double(vec![1.25, 2.5]))
        );
    }

    #[test]
    fn metadata_sizes_match_epics_structs() {
        let size = |s: &str| s.parse::<DbrType>().unwrap().payload_size(1);
        assert_eq!(size("DBR_TIME_DOUBLE"), 24);
        assert_eq!(size("DBR_TIME_CHAR"), 16);
        assert_eq!(size("DBR_STS_DOUBLE"), 16);
        assert_eq!(size("DBR_GR_DOUBLE"), 72);
        assert_eq!(size("DBR_CTRL_CHAR"), 22);
        assert_eq!(size("DBR_CTRL_INT"), 30);
        assert_eq!(size("DBR_CTRL_LONG"), 48);
        assert_eq!(size("DBR_CTRL_FLOAT"), 52);
        assert_eq!(size("DBR_TIME_STRING"), 52);
    }

    #[test]
    fn promotion() {
        assert_eq!(
            DbrType::promote(DbrBasicType::String, false, true),
            DBR_TIME_STRING
        );
        assert_eq!(
            DbrType::promote(DbrBasicType::Double, true, true),
            "CTRL_DOUBLE".parse().unwrap()
        );
        assert_eq!(
            DbrType::promote(DbrBasicType::Enum, true, false),
            "TIME_ENUM".parse().unwrap()
        );
        let ctrl: DbrType = "DBR_CTRL_LONG".parse().unwrap();
        assert_eq!(ctrl.native(), "LONG".parse().unwrap());
        assert_eq!(<u16 as From<DbrType>>::from(ctrl), 33);
        assert_eq!(DbrType::try_from(33u16), Ok(ctrl));
    }

    #[test]
    fn put_encoding_shapes() {
        // Character waveforms take text, null padded
        assert_eq!(
            encode_put(&"abc".into(), DbrBasicType::Char, 5).unwrap(),
            DbrValue::Char(vec![97, 98, 99, 0, 0])
        );
        assert_eq!(
            encode_put(&"abcdef".into(), DbrBasicType::Char, 4).unwrap(),
            DbrValue::Char(vec![97, 98, 99, 100])
        );
        // Numeric arrays truncate excess and zero-fill the rest
        assert_eq!(
            encode_put(&vec![1.0f64, 2.0, 3.0].into(), DbrBasicType::Long, 2).unwrap(),
            DbrValue::Long(vec![1, 2])
        );
        assert_eq!(
            encode_put(&vec![7i16].into(), DbrBasicType::Double, 3).unwrap(),
            DbrValue::Double(vec![7.0, 0.0, 0.0])
        );
        // Scalars convert, and text is parsed
        assert_eq!(
            encode_put(&CaValue::Long(4), DbrBasicType::Double, 1).unwrap(),
            DbrValue::Double(vec![4.0])
        );
        assert_eq!(
            encode_put(&"3.5".into(), DbrBasicType::Double, 1).unwrap(),
            DbrValue::Double(vec![3.5])
        );
        assert_eq!(
            encode_put(&CaValue::Long(1), DbrBasicType::Enum, 1).unwrap(),
            DbrValue::Enum(1)
        );
        assert_eq!(
            encode_put(&"Fault".into(), DbrBasicType::Enum, 1).unwrap(),
            DbrValue::String(vec!["Fault".into()])
        );
        assert_eq!(
            encode_put(&"2".into(), DbrBasicType::Enum, 1).unwrap(),
            DbrValue::Enum(2)
        );
        // Multi-element string channels copy element-wise
        assert_eq!(
            encode_put(
                &CaValue::Array(DbrValue::String(vec!["a".into(), "b".into(), "c".into()])),
                DbrBasicType::String,
                2
            )
            .unwrap(),
            DbrValue::String(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn values_survive_encode_and_decode() {
        let cases: Vec<(DbrBasicType, usize, CaValue)> = vec![
            (DbrBasicType::String, 1, "a string".into()),
            (
                DbrBasicType::String,
                3,
                CaValue::Array(DbrValue::String(vec![
                    "one".into(),
                    "two".into(),
                    "three".into(),
                ])),
            ),
            (DbrBasicType::Int, 1, CaValue::Int(-300)),
            (DbrBasicType::Int, 3, vec![-1i16, 0, 1].into()),
            (DbrBasicType::Float, 1, CaValue::Float(2.5)),
            (DbrBasicType::Float, 2, vec![0.25f32, -8.0].into()),
            (DbrBasicType::Enum, 1, CaValue::Enum(3)),
            (DbrBasicType::Char, 1, CaValue::Char(-5)),
            (DbrBasicType::Char, 4, vec![1i8, 2, 3, 4].into()),
            (DbrBasicType::Long, 1, CaValue::Long(-70000)),
            (DbrBasicType::Long, 3, vec![7i32, 8, 9].into()),
            (DbrBasicType::Double, 1, CaValue::Double(1e-3)),
            (DbrBasicType::Double, 2, vec![3.25f64, -6.5].into()),
        ];
        let timestamp = UNIX_EPOCH
            .checked_add(Duration::from_secs(EPICS_EPOCH_OFFSET + 12345))
            .unwrap();

        for (basic_type, count, value) in cases {
            let encoded = encode_put(&value, basic_type, count).unwrap();
            let (_, bytes) = encoded.to_bytes(None);
            let data_type = DbrType::new(basic_type, DbrCategory::Basic);
            assert_eq!(
                decode(data_type, count, &bytes).unwrap().value,
                value,
                "{data_type}"
            );

            let dbr = Dbr::Time {
                status: Status::default(),
                timestamp,
                value: encoded.clone(),
            };
            let (_, bytes) = dbr.to_bytes(None);
            let reading = decode(dbr.data_type(), count, &bytes).unwrap();
            assert_eq!(reading.value, value, "{}", dbr.data_type());
            assert_eq!(reading.metadata.timestamp, Some(timestamp));

            let graphics = match basic_type {
                DbrBasicType::String | DbrBasicType::Enum => DbrGraphics::default_for(basic_type),
                _ => DbrGraphics::Numeric {
                    units: "V".into(),
                    precision: None,
                    limits: Limits {
                        display: (-100.0, 100.0),
                        alarm: (-90.0, 90.0),
                        warning: (-80.0, 80.0),
                    },
                },
            };
            let dbr = Dbr::Graphics {
                status: Status::default(),
                graphics,
                value: encoded,
            };
            let (_, bytes) = dbr.to_bytes(None);
            let reading = decode(dbr.data_type(), count, &bytes).unwrap();
            assert_eq!(reading.value, value, "{}", dbr.data_type());
            if !matches!(basic_type, DbrBasicType::String | DbrBasicType::Enum) {
                assert_eq!(reading.metadata.display_limits, Some((-100.0, 100.0)));
                assert_eq!(reading.metadata.warning_limits, Some((-80.0, 80.0)));
            }
        }
    }

    #[test]
    fn enum_indices_convert_to_numbers() {
        let value = DbrValue::Enum(4);
        assert_eq!(
            value.convert_to(DbrBasicType::Long).unwrap(),
            DbrValue::Long(vec![4])
        );
        assert_eq!(
            value.convert_to(DbrBasicType::Float).unwrap(),
            DbrValue::Float(vec![4.0])
        );
        assert_eq!(
            value.convert_to(DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![4.0])
        );
    }

    #[test]
    fn put_encoding_rejects_mismatches() {
        assert!(matches!(
            encode_put(&"not a number".into(), DbrBasicType::Long, 1),
            Err(CodecError::Incompatible { .. })
        ));
        assert!(matches!(
            encode_put(&CaValue::Double(1e12), DbrBasicType::Int, 1),
            Err(CodecError::Incompatible { .. })
        ));
        assert!(matches!(
            encode_put(&CaValue::Double(1.0), DbrBasicType::Double, 4),
            Err(CodecError::Incompatible { .. })
        ));
        assert!(matches!(
            encode_put(&vec![1i32, 2].into(), DbrBasicType::Long, 1),
            Err(CodecError::Incompatible { .. })
        ));
        assert!(matches!(
            encode_put(&CaValue::Double(1.0), DbrBasicType::String, 1),
            Err(CodecError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn test_dbr_string_conversions() {
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Status),
            "DBR_STS_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Time),
            "TIME_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Graphics),
            "DBR_GR_INT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Int, DbrCategory::Basic),
            "SHORT".parse().unwrap()
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Char, DbrCategory::Control),
            "ctrl_char".parse().unwrap()
        );
        assert!("DBR_CLASS_INT".parse::<DbrType>().is_err());
        assert_eq!(
            format!("{}", DbrType::new(DbrBasicType::Enum, DbrCategory::Time)),
            "DBR_TIME_ENUM"
        );
    }
}
