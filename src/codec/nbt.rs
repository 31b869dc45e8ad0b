//! # Tagged Trees
//!
//! Self-describing tagged tree values in the network encoding: little-endian
//! fixed-width numbers, zigzag varints for `int`/`long` and array lengths, and
//! unsigned varints for string lengths.
//!
//! A node is a tag byte, a name and a payload. Compounds are sequences of nodes
//! closed by an `end` tag (`0`). Nesting is bounded by a configurable depth so a
//! hostile buffer cannot drive unbounded recursion.

use crate::codec::primitives::{
    fixed, put, read_varint, read_varint32, take, varint_len, write_varint, zigzag_decode,
    zigzag_encode,
};
use crate::error::{constants, ProtocolError, Result};

/// Tag byte of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagType {
    End = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    ByteArray = 7,
    String = 8,
    List = 9,
    Compound = 10,
    IntArray = 11,
    LongArray = 12,
}

impl TagType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => TagType::End,
            1 => TagType::Byte,
            2 => TagType::Short,
            3 => TagType::Int,
            4 => TagType::Long,
            5 => TagType::Float,
            6 => TagType::Double,
            7 => TagType::ByteArray,
            8 => TagType::String,
            9 => TagType::List,
            10 => TagType::Compound,
            11 => TagType::IntArray,
            12 => TagType::LongArray,
            _ => return None,
        })
    }
}

/// Payload of a tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<i8>),
    String(String),
    /// Element type plus elements; empty lists usually carry `TagType::End`.
    List(TagType, Vec<Tag>),
    Compound(Vec<(String, Tag)>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
}

impl Tag {
    pub fn tag_type(&self) -> TagType {
        match self {
            Tag::Byte(_) => TagType::Byte,
            Tag::Short(_) => TagType::Short,
            Tag::Int(_) => TagType::Int,
            Tag::Long(_) => TagType::Long,
            Tag::Float(_) => TagType::Float,
            Tag::Double(_) => TagType::Double,
            Tag::ByteArray(_) => TagType::ByteArray,
            Tag::String(_) => TagType::String,
            Tag::List(..) => TagType::List,
            Tag::Compound(_) => TagType::Compound,
            Tag::IntArray(_) => TagType::IntArray,
            Tag::LongArray(_) => TagType::LongArray,
        }
    }

    /// Look up a child of a compound by name.
    pub fn get(&self, name: &str) -> Option<&Tag> {
        match self {
            Tag::Compound(entries) => entries.iter().find(|(n, _)| n == name).map(|(_, t)| t),
            _ => None,
        }
    }
}

/// A root node: tag plus name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTag {
    pub name: String,
    pub tag: Tag,
}

impl NamedTag {
    pub fn new(name: impl Into<String>, tag: Tag) -> Self {
        Self {
            name: name.into(),
            tag,
        }
    }

    /// Decode one node at `offset`, returning it and the bytes consumed.
    pub fn read(buf: &[u8], offset: usize, max_depth: usize) -> Result<(Self, usize)> {
        let mut reader = Reader {
            buf,
            pos: offset,
            max_depth,
        };
        let ty = reader.tag_type()?;
        if ty == TagType::End {
            return Err(ProtocolError::Malformed(
                "end tag where a tree node was expected".to_string(),
            ));
        }
        let name = reader.string()?;
        let tag = reader.payload(ty, 0)?;
        Ok((Self { name, tag }, reader.pos - offset))
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let offset = put(buf, offset, &[self.tag.tag_type() as u8])?;
        let offset = write_string(&self.name, buf, offset)?;
        write_payload(&self.tag, buf, offset)
    }

    pub fn size(&self) -> Result<usize> {
        Ok(1 + string_size(&self.name) + payload_size(&self.tag)?)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = take(self.buf, self.pos, 1)?[0];
        self.pos += 1;
        Ok(b)
    }

    fn tag_type(&mut self) -> Result<TagType> {
        let b = self.byte()?;
        TagType::from_byte(b).ok_or_else(|| ProtocolError::Malformed(format!("unknown tag {b}")))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let out = fixed::<N>(self.buf, self.pos)?;
        self.pos += N;
        Ok(out)
    }

    fn zigzag32(&mut self) -> Result<i32> {
        let (v, n) = read_varint32(self.buf, self.pos)?;
        self.pos += n;
        Ok(zigzag_decode(v as u64) as i32)
    }

    fn zigzag64(&mut self) -> Result<i64> {
        let (v, n) = read_varint(self.buf, self.pos)?;
        self.pos += n;
        Ok(zigzag_decode(v))
    }

    /// Array length prefix; every element occupies at least one byte.
    fn length(&mut self) -> Result<usize> {
        let len = self.zigzag32()?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::Malformed(format!("negative length {len}")))?;
        let remaining = self.buf.len().saturating_sub(self.pos);
        if len > remaining {
            return Err(ProtocolError::truncated(self.pos, len, self.buf.len()));
        }
        Ok(len)
    }

    fn string(&mut self) -> Result<String> {
        let (len, n) = read_varint32(self.buf, self.pos)?;
        self.pos += n;
        let bytes = take(self.buf, self.pos, len as usize)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::Malformed(constants::ERR_INVALID_UTF8.into()))?
            .to_string();
        self.pos += len as usize;
        Ok(s)
    }

    fn payload(&mut self, ty: TagType, depth: usize) -> Result<Tag> {
        if depth >= self.max_depth {
            return Err(ProtocolError::Malformed(constants::ERR_NESTING_TOO_DEEP.into()));
        }
        Ok(match ty {
            TagType::End => {
                return Err(ProtocolError::Malformed("unexpected end tag".to_string()))
            }
            TagType::Byte => Tag::Byte(self.byte()? as i8),
            TagType::Short => Tag::Short(i16::from_le_bytes(self.array()?)),
            TagType::Int => Tag::Int(self.zigzag32()?),
            TagType::Long => Tag::Long(self.zigzag64()?),
            TagType::Float => Tag::Float(f32::from_le_bytes(self.array()?)),
            TagType::Double => Tag::Double(f64::from_le_bytes(self.array()?)),
            TagType::ByteArray => {
                let len = self.length()?;
                let bytes = take(self.buf, self.pos, len)?;
                self.pos += len;
                Tag::ByteArray(bytes.iter().map(|&b| b as i8).collect())
            }
            TagType::String => Tag::String(self.string()?),
            TagType::List => {
                let elem = self.tag_type()?;
                let len = self.length()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.payload(elem, depth + 1)?);
                }
                Tag::List(elem, items)
            }
            TagType::Compound => {
                let mut entries = Vec::new();
                loop {
                    let child = self.tag_type()?;
                    if child == TagType::End {
                        break;
                    }
                    let name = self.string()?;
                    entries.push((name, self.payload(child, depth + 1)?));
                }
                Tag::Compound(entries)
            }
            TagType::IntArray => {
                let len = self.length()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.zigzag32()?);
                }
                Tag::IntArray(items)
            }
            TagType::LongArray => {
                let len = self.length()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.zigzag64()?);
                }
                Tag::LongArray(items)
            }
        })
    }
}

fn length_prefix(len: usize) -> Result<i64> {
    i32::try_from(len)
        .map(i64::from)
        .map_err(|_| ProtocolError::InvalidValue(format!("array length {len} exceeds i32")))
}

fn write_string(s: &str, buf: &mut [u8], offset: usize) -> Result<usize> {
    let offset = write_varint(s.len() as u64, buf, offset)?;
    put(buf, offset, s.as_bytes())
}

fn string_size(s: &str) -> usize {
    varint_len(s.len() as u64) + s.len()
}

fn write_payload(tag: &Tag, buf: &mut [u8], offset: usize) -> Result<usize> {
    match tag {
        Tag::Byte(v) => put(buf, offset, &v.to_le_bytes()),
        Tag::Short(v) => put(buf, offset, &v.to_le_bytes()),
        Tag::Int(v) => write_varint(zigzag_encode(*v as i64), buf, offset),
        Tag::Long(v) => write_varint(zigzag_encode(*v), buf, offset),
        Tag::Float(v) => put(buf, offset, &v.to_le_bytes()),
        Tag::Double(v) => put(buf, offset, &v.to_le_bytes()),
        Tag::ByteArray(bytes) => {
            let mut offset = write_varint(zigzag_encode(length_prefix(bytes.len())?), buf, offset)?;
            for b in bytes {
                offset = put(buf, offset, &[*b as u8])?;
            }
            Ok(offset)
        }
        Tag::String(s) => write_string(s, buf, offset),
        Tag::List(elem, items) => {
            let mut offset = put(buf, offset, &[*elem as u8])?;
            offset = write_varint(zigzag_encode(length_prefix(items.len())?), buf, offset)?;
            for item in items {
                if item.tag_type() != *elem {
                    return Err(ProtocolError::InvalidValue(format!(
                        "list of {elem:?} contains {:?}",
                        item.tag_type()
                    )));
                }
                offset = write_payload(item, buf, offset)?;
            }
            Ok(offset)
        }
        Tag::Compound(entries) => {
            let mut offset = offset;
            for (name, child) in entries {
                offset = put(buf, offset, &[child.tag_type() as u8])?;
                offset = write_string(name, buf, offset)?;
                offset = write_payload(child, buf, offset)?;
            }
            put(buf, offset, &[TagType::End as u8])
        }
        Tag::IntArray(items) => {
            let mut offset = write_varint(zigzag_encode(length_prefix(items.len())?), buf, offset)?;
            for v in items {
                offset = write_varint(zigzag_encode(*v as i64), buf, offset)?;
            }
            Ok(offset)
        }
        Tag::LongArray(items) => {
            let mut offset = write_varint(zigzag_encode(length_prefix(items.len())?), buf, offset)?;
            for v in items {
                offset = write_varint(zigzag_encode(*v), buf, offset)?;
            }
            Ok(offset)
        }
    }
}

fn payload_size(tag: &Tag) -> Result<usize> {
    let len_size = |len: usize| -> Result<usize> { Ok(varint_len(zigzag_encode(length_prefix(len)?))) };
    Ok(match tag {
        Tag::Byte(_) => 1,
        Tag::Short(_) => 2,
        Tag::Int(v) => varint_len(zigzag_encode(*v as i64)),
        Tag::Long(v) => varint_len(zigzag_encode(*v)),
        Tag::Float(_) => 4,
        Tag::Double(_) => 8,
        Tag::ByteArray(bytes) => len_size(bytes.len())? + bytes.len(),
        Tag::String(s) => string_size(s),
        Tag::List(elem, items) => {
            let mut size = 1 + len_size(items.len())?;
            for item in items {
                if item.tag_type() != *elem {
                    return Err(ProtocolError::InvalidValue(format!(
                        "list of {elem:?} contains {:?}",
                        item.tag_type()
                    )));
                }
                size += payload_size(item)?;
            }
            size
        }
        Tag::Compound(entries) => {
            let mut size = 1;
            for (name, child) in entries {
                size += 1 + string_size(name) + payload_size(child)?;
            }
            size
        }
        Tag::IntArray(items) => {
            len_size(items.len())?
                + items
                    .iter()
                    .map(|v| varint_len(zigzag_encode(*v as i64)))
                    .sum::<usize>()
        }
        Tag::LongArray(items) => {
            len_size(items.len())?
                + items
                    .iter()
                    .map(|v| varint_len(zigzag_encode(*v)))
                    .sum::<usize>()
        }
    })
}
