//! # Primitive Types
//!
//! Fixed-width integers and floats in both byte orders, LEB128 varints, zigzag
//! varints, booleans, `void` and NUL-terminated strings.
//!
//! Every primitive satisfies `size_of(v) == write(v, buf, off) - off`, and `read`
//! consumes exactly the bytes `size_of` predicts for the value it returns. Short
//! input surfaces as [`ProtocolError::Truncated`], never as an out-of-bounds access.
//!
//! Names follow the schema vocabulary: `i16`/`u32`/`f64` are big-endian, the
//! `l`-prefixed forms (`li16`, `lu32`, `lf64`) are little-endian.

use crate::codec::value::Value;
use crate::error::{constants, ProtocolError, Result};

/// Byte order of a fixed-width number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Big,
    Little,
}

/// Bit width and signedness of an integer primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntFormat {
    pub bits: u32,
    pub signed: bool,
}

impl IntFormat {
    /// Reinterpret raw bits as a value of this format.
    pub fn from_bits(self, bits: u64) -> Value {
        let shift = 64 - self.bits;
        if self.signed {
            Value::Int(((bits << shift) as i64) >> shift)
        } else {
            Value::UInt((bits << shift) >> shift)
        }
    }

    /// Mask covering every bit of this format.
    pub fn mask(self) -> u64 {
        if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }
}

/// Raw bit pattern of an integer value.
pub(crate) fn to_bits(value: &Value) -> Option<u64> {
    match *value {
        Value::Int(v) => Some(v as u64),
        Value::UInt(v) => Some(v),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    I8,
    U8,
    I16(Endian),
    U16(Endian),
    I32(Endian),
    U32(Endian),
    I64(Endian),
    U64(Endian),
    F32(Endian),
    F64(Endian),
    VarInt,
    VarInt64,
    ZigZag32,
    ZigZag64,
    CString,
}

const NAMES: &[(&str, Primitive)] = &[
    ("void", Primitive::Void),
    ("bool", Primitive::Bool),
    ("i8", Primitive::I8),
    ("u8", Primitive::U8),
    ("i16", Primitive::I16(Endian::Big)),
    ("u16", Primitive::U16(Endian::Big)),
    ("i32", Primitive::I32(Endian::Big)),
    ("u32", Primitive::U32(Endian::Big)),
    ("i64", Primitive::I64(Endian::Big)),
    ("u64", Primitive::U64(Endian::Big)),
    ("f32", Primitive::F32(Endian::Big)),
    ("f64", Primitive::F64(Endian::Big)),
    ("li16", Primitive::I16(Endian::Little)),
    ("lu16", Primitive::U16(Endian::Little)),
    ("li32", Primitive::I32(Endian::Little)),
    ("lu32", Primitive::U32(Endian::Little)),
    ("li64", Primitive::I64(Endian::Little)),
    ("lu64", Primitive::U64(Endian::Little)),
    ("lf32", Primitive::F32(Endian::Little)),
    ("lf64", Primitive::F64(Endian::Little)),
    ("varint", Primitive::VarInt),
    ("varint64", Primitive::VarInt64),
    ("zigzag32", Primitive::ZigZag32),
    ("zigzag64", Primitive::ZigZag64),
    ("cstring", Primitive::CString),
];

macro_rules! read_fixed {
    ($buf:expr, $offset:expr, $ty:ty, $endian:expr, $variant:path, $as:ty) => {{
        let bytes: [u8; std::mem::size_of::<$ty>()] = fixed($buf, $offset)?;
        let v = match $endian {
            Endian::Big => <$ty>::from_be_bytes(bytes),
            Endian::Little => <$ty>::from_le_bytes(bytes),
        };
        Ok(($variant(v as $as), std::mem::size_of::<$ty>()))
    }};
}

macro_rules! ordered {
    ($v:expr, $endian:expr) => {
        match $endian {
            Endian::Big => $v.to_be_bytes(),
            Endian::Little => $v.to_le_bytes(),
        }
    };
}

impl Primitive {
    pub fn from_name(name: &str) -> Option<Self> {
        NAMES.iter().find(|(n, _)| *n == name).map(|(_, p)| *p)
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, p)| *p == self)
            .map(|(n, _)| *n)
            .unwrap_or("primitive")
    }

    /// Integer layout, or `None` for non-integer primitives.
    pub fn int_format(self) -> Option<IntFormat> {
        let (bits, signed) = match self {
            Primitive::I8 => (8, true),
            Primitive::U8 => (8, false),
            Primitive::I16(_) => (16, true),
            Primitive::U16(_) => (16, false),
            Primitive::I32(_) | Primitive::ZigZag32 => (32, true),
            Primitive::U32(_) | Primitive::VarInt => (32, false),
            Primitive::I64(_) | Primitive::ZigZag64 => (64, true),
            Primitive::U64(_) | Primitive::VarInt64 => (64, false),
            _ => return None,
        };
        Some(IntFormat { bits, signed })
    }

    /// Encoded size for fixed-width primitives.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Primitive::Void => Some(0),
            Primitive::Bool | Primitive::I8 | Primitive::U8 => Some(1),
            Primitive::I16(_) | Primitive::U16(_) => Some(2),
            Primitive::I32(_) | Primitive::U32(_) | Primitive::F32(_) => Some(4),
            Primitive::I64(_) | Primitive::U64(_) | Primitive::F64(_) => Some(8),
            _ => None,
        }
    }

    pub fn read(self, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        match self {
            Primitive::Void => Ok((Value::Void, 0)),
            Primitive::Bool => Ok((Value::Bool(take(buf, offset, 1)?[0] != 0), 1)),
            Primitive::I8 => Ok((Value::Int(take(buf, offset, 1)?[0] as i8 as i64), 1)),
            Primitive::U8 => Ok((Value::UInt(take(buf, offset, 1)?[0] as u64), 1)),
            Primitive::I16(e) => read_fixed!(buf, offset, i16, e, Value::Int, i64),
            Primitive::U16(e) => read_fixed!(buf, offset, u16, e, Value::UInt, u64),
            Primitive::I32(e) => read_fixed!(buf, offset, i32, e, Value::Int, i64),
            Primitive::U32(e) => read_fixed!(buf, offset, u32, e, Value::UInt, u64),
            Primitive::I64(e) => read_fixed!(buf, offset, i64, e, Value::Int, i64),
            Primitive::U64(e) => read_fixed!(buf, offset, u64, e, Value::UInt, u64),
            Primitive::F32(e) => read_fixed!(buf, offset, f32, e, Value::Float, f64),
            Primitive::F64(e) => read_fixed!(buf, offset, f64, e, Value::Float, f64),
            Primitive::VarInt => {
                let (v, n) = read_varint32(buf, offset)?;
                Ok((Value::UInt(v as u64), n))
            }
            Primitive::VarInt64 => {
                let (v, n) = read_varint(buf, offset)?;
                Ok((Value::UInt(v), n))
            }
            Primitive::ZigZag32 => {
                let (v, n) = read_varint32(buf, offset)?;
                Ok((Value::Int(zigzag_decode(v as u64)), n))
            }
            Primitive::ZigZag64 => {
                let (v, n) = read_varint(buf, offset)?;
                Ok((Value::Int(zigzag_decode(v)), n))
            }
            Primitive::CString => {
                let rest = buf.get(offset..).unwrap_or_default();
                let end = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| ProtocolError::truncated(offset, rest.len() + 1, buf.len()))?;
                let s = std::str::from_utf8(&rest[..end])
                    .map_err(|_| ProtocolError::Malformed(constants::ERR_INVALID_UTF8.into()))?;
                Ok((Value::String(s.to_string()), end + 1))
            }
        }
    }

    pub fn write(self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        match self {
            Primitive::Void => Ok(offset),
            Primitive::Bool => put(buf, offset, &[u8::from(expect_bool(value)?)]),
            Primitive::I8 => put(buf, offset, &int_in::<i8>(value, self)?.to_be_bytes()),
            Primitive::U8 => put(buf, offset, &[int_in::<u8>(value, self)?]),
            Primitive::I16(e) => put(buf, offset, &ordered!(int_in::<i16>(value, self)?, e)),
            Primitive::U16(e) => put(buf, offset, &ordered!(int_in::<u16>(value, self)?, e)),
            Primitive::I32(e) => put(buf, offset, &ordered!(int_in::<i32>(value, self)?, e)),
            Primitive::U32(e) => put(buf, offset, &ordered!(int_in::<u32>(value, self)?, e)),
            Primitive::I64(e) => put(buf, offset, &ordered!(int_in::<i64>(value, self)?, e)),
            Primitive::U64(e) => put(buf, offset, &ordered!(int_in::<u64>(value, self)?, e)),
            Primitive::F32(e) => put(buf, offset, &ordered!(float_in(value, self)? as f32, e)),
            Primitive::F64(e) => put(buf, offset, &ordered!(float_in(value, self)?, e)),
            Primitive::VarInt => write_varint(int_in::<u32>(value, self)? as u64, buf, offset),
            Primitive::VarInt64 => write_varint(int_in::<u64>(value, self)?, buf, offset),
            Primitive::ZigZag32 => {
                write_varint(zigzag_encode(int_in::<i32>(value, self)? as i64), buf, offset)
            }
            Primitive::ZigZag64 => {
                write_varint(zigzag_encode(int_in::<i64>(value, self)?), buf, offset)
            }
            Primitive::CString => {
                let s = cstring_in(value)?;
                let offset = put(buf, offset, s.as_bytes())?;
                put(buf, offset, &[0])
            }
        }
    }

    pub fn size_of(self, value: &Value) -> Result<usize> {
        match self {
            Primitive::Void => Ok(0),
            Primitive::Bool => expect_bool(value).map(|_| 1),
            Primitive::F32(_) | Primitive::F64(_) => {
                float_in(value, self)?;
                Ok(self.fixed_size().unwrap_or_default())
            }
            Primitive::VarInt => Ok(varint_len(int_in::<u32>(value, self)? as u64)),
            Primitive::VarInt64 => Ok(varint_len(int_in::<u64>(value, self)?)),
            Primitive::ZigZag32 => Ok(varint_len(zigzag_encode(
                int_in::<i32>(value, self)? as i64,
            ))),
            Primitive::ZigZag64 => Ok(varint_len(zigzag_encode(int_in::<i64>(value, self)?))),
            Primitive::CString => Ok(cstring_in(value)?.len() + 1),
            fixed => {
                // Range-check through the same path as write.
                let format = fixed.int_format().ok_or_else(|| {
                    ProtocolError::InvalidValue(format!("{} has no size", fixed.name()))
                })?;
                check_range(value, fixed, format)?;
                Ok(fixed.fixed_size().unwrap_or_default())
            }
        }
    }
}

fn check_range(value: &Value, ty: Primitive, format: IntFormat) -> Result<()> {
    match (format.bits, format.signed) {
        (8, true) => int_in::<i8>(value, ty).map(drop),
        (8, false) => int_in::<u8>(value, ty).map(drop),
        (16, true) => int_in::<i16>(value, ty).map(drop),
        (16, false) => int_in::<u16>(value, ty).map(drop),
        (32, true) => int_in::<i32>(value, ty).map(drop),
        (32, false) => int_in::<u32>(value, ty).map(drop),
        (64, true) => int_in::<i64>(value, ty).map(drop),
        _ => int_in::<u64>(value, ty).map(drop),
    }
}

fn int_in<T: TryFrom<i128>>(value: &Value, ty: Primitive) -> Result<T> {
    let v = value.as_i128().ok_or_else(|| {
        ProtocolError::InvalidValue(format!(
            "{} expects an integer, got {}",
            ty.name(),
            value.kind()
        ))
    })?;
    T::try_from(v)
        .map_err(|_| ProtocolError::InvalidValue(format!("{v} is out of range for {}", ty.name())))
}

fn float_in(value: &Value, ty: Primitive) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        ProtocolError::InvalidValue(format!(
            "{} expects a number, got {}",
            ty.name(),
            value.kind()
        ))
    })
}

fn expect_bool(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| ProtocolError::InvalidValue(format!("bool expected, got {}", value.kind())))
}

fn cstring_in(value: &Value) -> Result<&str> {
    let s = value.as_str().ok_or_else(|| {
        ProtocolError::InvalidValue(format!("cstring expects a string, got {}", value.kind()))
    })?;
    if s.contains('\0') {
        return Err(ProtocolError::InvalidValue(
            "cstring cannot contain NUL".to_string(),
        ));
    }
    Ok(s)
}

/// Borrow `len` bytes at `offset`, or report how many are missing.
pub(crate) fn take(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| ProtocolError::truncated(offset, len, buf.len()))
}

pub(crate) fn fixed<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, offset, N)?);
    Ok(out)
}

/// Copy `bytes` into `buf` at `offset`, returning the new offset.
pub(crate) fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<usize> {
    let end = offset + bytes.len();
    let available = buf.len().saturating_sub(offset);
    let dst = buf
        .get_mut(offset..end)
        .ok_or(ProtocolError::BufferOverflow {
            needed: bytes.len(),
            available,
        })?;
    dst.copy_from_slice(bytes);
    Ok(end)
}

/// Decode an unsigned LEB128 varint of at most 10 bytes.
pub(crate) fn read_varint(buf: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut result = 0u64;
    for i in 0..10 {
        let byte = *buf
            .get(offset + i)
            .ok_or_else(|| ProtocolError::truncated(offset, i + 1, buf.len()))?;
        let part = (byte & 0x7f) as u64;
        if i == 9 && part > 1 {
            return Err(ProtocolError::Malformed(constants::ERR_VARINT_TOO_LONG.into()));
        }
        result |= part << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(ProtocolError::Malformed(constants::ERR_VARINT_TOO_LONG.into()))
}

/// Decode a varint that must fit in 32 bits (at most 5 bytes).
pub(crate) fn read_varint32(buf: &[u8], offset: usize) -> Result<(u32, usize)> {
    let mut result = 0u64;
    for i in 0..5 {
        let byte = *buf
            .get(offset + i)
            .ok_or_else(|| ProtocolError::truncated(offset, i + 1, buf.len()))?;
        result |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            let v = u32::try_from(result)
                .map_err(|_| ProtocolError::Malformed(constants::ERR_VARINT_TOO_LONG.into()))?;
            return Ok((v, i + 1));
        }
    }
    Err(ProtocolError::Malformed(constants::ERR_VARINT_TOO_LONG.into()))
}

pub(crate) fn write_varint(mut value: u64, buf: &mut [u8], mut offset: usize) -> Result<usize> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return put(buf, offset, &[byte]);
        }
        offset = put(buf, offset, &[byte | 0x80])?;
    }
}

pub(crate) fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub(crate) fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(crate) fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}
