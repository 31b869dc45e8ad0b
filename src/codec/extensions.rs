//! # Extension Types
//!
//! Codec behaviour that is not a plain composition of primitives. Extensions
//! come in three kinds, and the compiler wires each kind differently:
//!
//! - [`NativeType`]: works directly on bytes (`uuid`, `restBuffer`, `nbt`).
//! - [`ParametrizedType`]: receives its schema parameters and the compiler, and
//!   returns a specialised [`Codec`] (`bitflags`).
//! - [`ContextType`]: calls sibling codecs of the finished [`CodecSet`] by name at
//!   call time, which allows forward references and recursion (`nbtLoop`).
//!
//! The derived enum width step (`enum_size_based_on_values_len`) is not an
//! extension; it is compiled into the enclosing container.

use crate::codec::compiler::{Codec, CodecSet, Compiler};
use crate::codec::nbt::NamedTag;
use crate::codec::primitives::{put, take, to_bits, IntFormat};
use crate::codec::schema::{params, BitflagsParams, FlagsDef, TypeDef};
use crate::codec::value::Value;
use crate::config::CodecConfig;
use crate::error::{ProtocolError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Extension operating on raw bytes only.
pub trait NativeType: Send + Sync + fmt::Debug {
    fn read(&self, buf: &[u8], offset: usize) -> Result<(Value, usize)>;
    fn write(&self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize>;
    fn size_of(&self, value: &Value) -> Result<usize>;

    /// Fewest bytes any encoded value occupies.
    fn min_size(&self) -> usize {
        0
    }
}

/// Extension that generates a codec from its schema parameters.
pub trait ParametrizedType: Send + Sync + fmt::Debug {
    fn compile(&self, params: &serde_json::Value, compiler: &mut Compiler<'_>) -> Result<Codec>;
}

/// Extension that calls sibling codecs by name.
///
/// `depth` is the nesting level the extension runs at. Sibling lookups go through
/// [`CodecSet::read_nested`] and friends with that depth so recursion stays bounded.
pub trait ContextType: Send + Sync + fmt::Debug {
    /// Type names this extension looks up; the compiler guarantees they resolve.
    fn dependencies(&self) -> &[&'static str];
    fn read(&self, set: &CodecSet, buf: &[u8], offset: usize, depth: usize)
        -> Result<(Value, usize)>;
    fn write(
        &self,
        set: &CodecSet,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        depth: usize,
    ) -> Result<usize>;
    fn size_of(&self, set: &CodecSet, value: &Value, depth: usize) -> Result<usize>;

    /// Fewest bytes any encoded value occupies.
    fn min_size(&self) -> usize {
        0
    }
}

/// A registered extension
#[derive(Debug, Clone)]
pub enum Extension {
    Native(Arc<dyn NativeType>),
    Parametrized(Arc<dyn ParametrizedType>),
    Context(Arc<dyn ContextType>),
}

/// Extension name → implementation, handed to the compiler.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    entries: HashMap<String, Extension>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::builtin(&CodecConfig::default())
    }
}

impl ExtensionRegistry {
    /// A registry without any extensions.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The built-in extensions, with limits taken from `config`.
    pub fn builtin(config: &CodecConfig) -> Self {
        let mut registry = Self::empty();
        registry.register_native("uuid", UuidType);
        registry.register_native("restBuffer", RestBuffer);
        registry.register_native(
            "nbt",
            NbtType {
                max_depth: config.max_nesting_depth,
            },
        );
        registry.register_context("nbtLoop", NbtLoop);
        registry.register_parametrized("bitflags", Bitflags);
        registry
    }

    pub fn register_native(&mut self, name: impl Into<String>, ext: impl NativeType + 'static) {
        self.entries
            .insert(name.into(), Extension::Native(Arc::new(ext)));
    }

    pub fn register_parametrized(
        &mut self,
        name: impl Into<String>,
        ext: impl ParametrizedType + 'static,
    ) {
        self.entries
            .insert(name.into(), Extension::Parametrized(Arc::new(ext)));
    }

    pub fn register_context(&mut self, name: impl Into<String>, ext: impl ContextType + 'static) {
        self.entries
            .insert(name.into(), Extension::Context(Arc::new(ext)));
    }

    pub fn get(&self, name: &str) -> Option<&Extension> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// 16-byte identifier, surfaced as its canonical lowercase hyphenated text.
#[derive(Debug)]
pub struct UuidType;

impl UuidType {
    fn parse(value: &Value) -> Result<Uuid> {
        let text = value.as_str().ok_or_else(|| {
            ProtocolError::InvalidValue(format!("uuid expects a string, got {}", value.kind()))
        })?;
        Uuid::parse_str(text)
            .map_err(|e| ProtocolError::InvalidValue(format!("invalid uuid `{text}`: {e}")))
    }
}

impl NativeType for UuidType {
    fn read(&self, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        let bytes = take(buf, offset, 16)?;
        let id = Uuid::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok((Value::String(id.hyphenated().to_string()), 16))
    }

    fn write(&self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        put(buf, offset, Self::parse(value)?.as_bytes())
    }

    fn size_of(&self, value: &Value) -> Result<usize> {
        Self::parse(value).map(|_| 16)
    }

    fn min_size(&self) -> usize {
        16
    }
}

/// Everything from the offset to the end of the buffer.
#[derive(Debug)]
pub struct RestBuffer;

impl NativeType for RestBuffer {
    fn read(&self, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        let rest = take(buf, offset, buf.len().saturating_sub(offset))?;
        Ok((Value::Bytes(rest.to_vec()), rest.len()))
    }

    fn write(&self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        put(buf, offset, bytes_in(value, "restBuffer")?)
    }

    fn size_of(&self, value: &Value) -> Result<usize> {
        bytes_in(value, "restBuffer").map(<[u8]>::len)
    }
}

fn bytes_in<'v>(value: &'v Value, ty: &str) -> Result<&'v [u8]> {
    value.as_bytes().ok_or_else(|| {
        ProtocolError::InvalidValue(format!("{ty} expects bytes, got {}", value.kind()))
    })
}

/// One network-encoded tagged tree node.
#[derive(Debug)]
pub struct NbtType {
    pub max_depth: usize,
}

fn tree_in(value: &Value) -> Result<&NamedTag> {
    match value {
        Value::Nbt(tag) => Ok(tag),
        other => Err(ProtocolError::InvalidValue(format!(
            "nbt expects a tagged tree, got {}",
            other.kind()
        ))),
    }
}

impl NativeType for NbtType {
    fn read(&self, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        let (tag, size) = NamedTag::read(buf, offset, self.max_depth)?;
        Ok((Value::Nbt(Box::new(tag)), size))
    }

    fn write(&self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        tree_in(value)?.write(buf, offset)
    }

    fn size_of(&self, value: &Value) -> Result<usize> {
        tree_in(value)?.size()
    }

    fn min_size(&self) -> usize {
        1
    }
}

/// Tagged tree nodes repeated until a `0` byte; the terminator is consumed and counted.
#[derive(Debug)]
pub struct NbtLoop;

const NBT: &str = "nbt";

impl ContextType for NbtLoop {
    fn dependencies(&self) -> &[&'static str] {
        &[NBT]
    }

    fn read(
        &self,
        set: &CodecSet,
        buf: &[u8],
        offset: usize,
        depth: usize,
    ) -> Result<(Value, usize)> {
        let mut items = Vec::new();
        let mut pos = offset;
        loop {
            if take(buf, pos, 1)?[0] == 0 {
                pos += 1;
                break;
            }
            let (item, n) = set.read_nested(NBT, buf, pos, depth)?;
            items.push(item);
            pos += n;
        }
        Ok((Value::List(items), pos - offset))
    }

    fn write(
        &self,
        set: &CodecSet,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        depth: usize,
    ) -> Result<usize> {
        let mut pos = offset;
        for item in list_in(value)? {
            pos = set.write_nested(NBT, item, buf, pos, depth)?;
        }
        put(buf, pos, &[0])
    }

    fn size_of(&self, set: &CodecSet, value: &Value, depth: usize) -> Result<usize> {
        let mut size = 1;
        for item in list_in(value)? {
            size += set.size_of_nested(NBT, item, depth)?;
        }
        Ok(size)
    }

    fn min_size(&self) -> usize {
        1
    }
}

fn list_in(value: &Value) -> Result<&[Value]> {
    value.as_list().ok_or_else(|| {
        ProtocolError::InvalidValue(format!("nbtLoop expects a list, got {}", value.kind()))
    })
}

/// Reserved key carrying the raw integer of a bit-flag value
pub const RAW_FLAGS_KEY: &str = "_value";

/// Integer overlaid with named boolean flags.
#[derive(Debug)]
pub struct Bitflags;

impl ParametrizedType for Bitflags {
    fn compile(&self, raw: &serde_json::Value, compiler: &mut Compiler<'_>) -> Result<Codec> {
        let p: BitflagsParams = params("bitflags", raw)?;
        let format = compiler.int_format(&p.ty).ok_or_else(|| {
            ProtocolError::Schema(format!("bitflags needs an integer type, got `{}`", p.ty))
        })?;
        let flags = normalize_flags(&p.flags, p.shift, format)?;
        let inner = compiler.compile_type(&TypeDef::name(p.ty))?;
        Ok(Codec::Bitflags {
            inner: Box::new(inner),
            format,
            flags,
        })
    }
}

/// Reduce both flag notations to `(name, mask)` pairs.
fn normalize_flags(def: &FlagsDef, shift: bool, format: IntFormat) -> Result<Vec<(String, u64)>> {
    let bit = |pos: u64, name: &str| {
        if pos >= format.bits as u64 {
            return Err(ProtocolError::Schema(format!(
                "flag `{name}` at bit {pos} does not fit a {}-bit integer",
                format.bits
            )));
        }
        Ok(1u64 << pos)
    };
    let flags = match def {
        FlagsDef::List(names) => names
            .iter()
            .enumerate()
            .map(|(i, name)| Ok((name.clone(), bit(i as u64, name.as_str())?)))
            .collect::<Result<Vec<_>>>()?,
        FlagsDef::Table(table) => table
            .iter()
            .map(|(name, &v)| {
                let mask = if shift { bit(v, name.as_str())? } else { v };
                if mask & !format.mask() != 0 {
                    return Err(ProtocolError::Schema(format!(
                        "flag `{name}` mask {mask:#x} does not fit a {}-bit integer",
                        format.bits
                    )));
                }
                Ok((name.clone(), mask))
            })
            .collect::<Result<Vec<_>>>()?,
    };
    if let Some((name, _)) = flags.iter().find(|(n, _)| n == RAW_FLAGS_KEY) {
        return Err(ProtocolError::Schema(format!(
            "flag name `{name}` is reserved"
        )));
    }
    Ok(flags)
}

/// Project a raw integer onto its flags.
pub(crate) fn flags_to_value(raw: Value, format: IntFormat, flags: &[(String, u64)]) -> Value {
    let bits = to_bits(&raw).unwrap_or_default() & format.mask();
    let mut map = BTreeMap::new();
    for (name, mask) in flags {
        map.insert(name.clone(), Value::Bool(bits & mask == *mask));
    }
    map.insert(RAW_FLAGS_KEY.to_string(), raw);
    Value::Map(map)
}

/// Rebuild the raw integer from a flag map (or accept a plain integer).
///
/// Starts from `_value`; a flag set to `true` ORs its mask in, a flag set to
/// `false` clears its mask if `_value` had it fully set.
pub(crate) fn value_to_flags(
    value: &Value,
    format: IntFormat,
    flags: &[(String, u64)],
) -> Result<Value> {
    let map = match value {
        Value::Int(_) | Value::UInt(_) => return Ok(value.clone()),
        Value::Map(map) => map,
        other => {
            return Err(ProtocolError::InvalidValue(format!(
                "bitflags expects a map or an integer, got {}",
                other.kind()
            )))
        }
    };
    let mut bits = match map.get(RAW_FLAGS_KEY) {
        Some(raw) => to_bits(raw).ok_or_else(|| {
            ProtocolError::InvalidValue(format!("`{RAW_FLAGS_KEY}` must be an integer"))
        })?,
        None => 0,
    };
    for (name, mask) in flags {
        match map.get(name).and_then(Value::as_bool) {
            Some(true) => bits |= mask,
            Some(false) if bits & mask == *mask => bits &= !mask,
            _ => {}
        }
    }
    Ok(format.from_bits(bits & format.mask()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::nbt::Tag;

    const U8: IntFormat = IntFormat {
        bits: 8,
        signed: false,
    };

    #[test]
    fn test_uuid_canonical_text() {
        let text = "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0";
        let mut buf = [0u8; 16];
        UuidType.write(&Value::from(text), &mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x0f);
        let (v, n) = UuidType.read(&buf, 0).unwrap();
        assert_eq!(n, 16);
        assert_eq!(v.as_str(), Some(text));

        let upper = Value::from(text.to_uppercase());
        UuidType.write(&upper, &mut buf, 0).unwrap();
        assert_eq!(UuidType.read(&buf, 0).unwrap().0.as_str(), Some(text));
    }

    #[test]
    fn test_uuid_rejects_garbage() {
        assert!(matches!(
            UuidType.size_of(&Value::from("not-a-uuid")),
            Err(ProtocolError::InvalidValue(_))
        ));
        assert!(UuidType.read(&[0u8; 15], 0).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_rest_buffer_consumes_tail() {
        let (v, n) = RestBuffer.read(&[1, 2, 3, 4], 1).unwrap();
        assert_eq!(n, 3);
        assert_eq!(v.as_bytes(), Some(&[2u8, 3, 4][..]));
        let (v, n) = RestBuffer.read(&[1, 2], 2).unwrap();
        assert_eq!((v.as_bytes().map(<[u8]>::len), n), (Some(0), 0));
    }

    #[test]
    fn test_nbt_native_roundtrip() {
        let ty = NbtType { max_depth: 16 };
        let tree = Value::from(NamedTag::new("root", Tag::Compound(vec![])));
        let size = ty.size_of(&tree).unwrap();
        let mut buf = vec![0u8; size];
        assert_eq!(ty.write(&tree, &mut buf, 0).unwrap(), size);
        assert_eq!(ty.read(&buf, 0).unwrap(), (tree, size));
    }

    #[test]
    fn test_flag_notations_normalize() {
        let list = normalize_flags(
            &FlagsDef::List(vec!["a".into(), "b".into(), "c".into()]),
            false,
            U8,
        )
        .unwrap();
        assert_eq!(list[2], ("c".to_string(), 4));

        let table = BTreeMap::from([("x".to_string(), 3u64), ("y".to_string(), 0x80)]);
        let masks = normalize_flags(&FlagsDef::Table(table.clone()), false, U8).unwrap();
        assert!(masks.contains(&("x".to_string(), 3)));
        let shifted = normalize_flags(&FlagsDef::Table(table), true, U8);
        assert!(matches!(shifted, Err(ProtocolError::Schema(_))));
    }

    #[test]
    fn test_reserved_flag_name_rejected() {
        let err = normalize_flags(&FlagsDef::List(vec!["_value".into()]), false, U8).unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn test_flags_projection_and_rebuild() {
        let flags = vec![("low".to_string(), 0b11), ("high".to_string(), 0b1000_0000)];
        let v = flags_to_value(Value::UInt(0b1000_0001), U8, &flags);
        assert_eq!(v.get("low"), Some(&Value::Bool(false)));
        assert_eq!(v.get("high"), Some(&Value::Bool(true)));
        assert_eq!(value_to_flags(&v, U8, &flags).unwrap(), Value::UInt(0b1000_0001));

        let edited = Value::map([
            ("_value", Value::UInt(0b1000_0001)),
            ("high", Value::Bool(false)),
            ("low", Value::Bool(true)),
        ]);
        assert_eq!(value_to_flags(&edited, U8, &flags).unwrap(), Value::UInt(0b11));

        let only_flags = Value::map([("high", Value::Bool(true))]);
        assert_eq!(
            value_to_flags(&only_flags, U8, &flags).unwrap(),
            Value::UInt(0b1000_0000)
        );
    }
}
