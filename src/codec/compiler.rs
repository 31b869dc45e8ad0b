//! # Schema Compiler
//!
//! Turns a [`Schema`] plus an [`ExtensionRegistry`] into an immutable [`CodecSet`]:
//! one `read` / `write` / `size_of` triple per named type.
//!
//! Names are resolved once, at compile time, in this order: schema types, then
//! primitives, then registered extensions. Schema types become [`Codec::Ref`] ids
//! so recursion and forward references cost nothing at call time. A type that
//! must contain itself (no `option`, `switch` or variable-length `array` on the
//! path back to itself) can never terminate and is rejected with
//! [`ProtocolError::Schema`].
//!
//! ## Field paths
//! `switch.compareTo` and `array.count` name a field of the enclosing container.
//! Each `../` prefix steps out one container level. Containers embedded through an
//! anonymous field are transparent: their fields resolve against the parent too.
//!
//! ## Example
//! ```rust
//! use bedrock_wire::codec::{compile, parse_schema, ExtensionRegistry, Value};
//!
//! let schema = parse_schema(r#"{
//!     "string": ["pstring", { "countType": "varint" }],
//!     "greeting": ["container", [{ "name": "text", "type": "string" }]]
//! }"#).unwrap();
//! let set = compile(&schema, &ExtensionRegistry::default()).unwrap();
//!
//! let value = Value::map([("text", Value::from("hi"))]);
//! let bytes = set.serialize("greeting", &value).unwrap();
//! assert_eq!(bytes, [2, b'h', b'i']);
//! assert_eq!(set.read("greeting", &bytes, 0).unwrap(), (value, 3));
//! ```

use crate::codec::extensions::{
    flags_to_value, value_to_flags, ContextType, Extension, ExtensionRegistry, NativeType,
};
use crate::codec::primitives::{put, take, IntFormat, Primitive};
use crate::codec::schema::{
    normalize_key, params, parse_int_key, CountDef, CountedParams, EnumWidthParams, FieldDef,
    MapperParams, Schema, SwitchParams, TypeDef,
};
use crate::codec::value::Value;
use crate::config::{CodecConfig, MAX_EMPTY_ELEMENTS};
use crate::error::{constants, ProtocolError, Result};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Index of a compiled type inside its [`CodecSet`]
pub type TypeId = usize;

/// Container step that derives an enum index width from a preceding count
pub const ENUM_WIDTH: &str = "enum_size_based_on_values_len";

static VOID: Value = Value::Void;

/// A compiled codec
#[derive(Debug, Clone)]
pub enum Codec {
    Primitive(Primitive),
    /// Another named type of the same set
    Ref(TypeId),
    Container(Vec<Field>),
    Array {
        count: Count,
        element: Box<Codec>,
    },
    /// Presence byte, then the inner value when non-zero
    Option(Box<Codec>),
    Switch {
        compare_to: String,
        cases: BTreeMap<String, Codec>,
        default: Box<Codec>,
    },
    Mapper {
        inner: Box<Codec>,
        /// Normalized wire key → symbolic name
        names: BTreeMap<String, String>,
        /// Symbolic name → wire key
        keys: BTreeMap<String, Value>,
    },
    PString {
        count: Count,
    },
    Buffer {
        count: Count,
    },
    Bitflags {
        inner: Box<Codec>,
        format: IntFormat,
        flags: Vec<(String, u64)>,
    },
    Native(Arc<dyn NativeType>),
    Context(Arc<dyn ContextType>),
}

/// One compiled container field
#[derive(Debug, Clone)]
pub enum Field {
    Named { name: String, codec: Codec },
    /// Merged into the enclosing map
    Anon(Codec),
    /// Writes nothing; stores `byte`/`short`/`int` chosen from `count_field`
    EnumWidth { name: String, count_field: String },
}

/// Source of a collection length
#[derive(Debug, Clone)]
pub enum Count {
    Fixed(usize),
    /// Length written in front of the elements
    Prefixed(Box<Codec>),
    /// Length held by a field of an enclosing container
    Field(String),
}

/// Width name for a derived enum index, given the number of distinct values.
pub fn enum_width(count: u64) -> Option<&'static str> {
    match count {
        0..=0xff => Some("byte"),
        0x100..=0xffff => Some("short"),
        0x1_0000..=0xff_ffff => Some("int"),
        _ => None,
    }
}

/// Read-only view of the containers enclosing the codec being run.
#[derive(Debug, Clone, Copy)]
struct Scope<'a> {
    fields: Option<&'a BTreeMap<String, Value>>,
    parent: Option<&'a Scope<'a>>,
    anon: bool,
}

impl<'a> Scope<'a> {
    const ROOT: Scope<'static> = Scope {
        fields: None,
        parent: None,
        anon: false,
    };

    fn child(fields: &'a BTreeMap<String, Value>, parent: &'a Scope<'a>, anon: bool) -> Self {
        Scope {
            fields: Some(fields),
            parent: Some(parent),
            anon,
        }
    }

    fn logical_parent(&self) -> Option<&Scope<'a>> {
        let mut scope = self;
        while scope.anon {
            scope = scope.parent?;
        }
        scope.parent
    }

    fn lookup(&self, name: &str) -> Option<&'a Value> {
        let mut scope = self;
        loop {
            if let Some(v) = scope.fields.and_then(|f| f.get(name)) {
                return Some(v);
            }
            if !scope.anon {
                return None;
            }
            scope = scope.parent?;
        }
    }

    /// Resolve `../../field/sub` style paths.
    fn resolve(&self, path: &str) -> Option<&'a Value> {
        let mut scope = self;
        let mut rest = path;
        while let Some(r) = rest.strip_prefix("../") {
            scope = scope.logical_parent()?;
            rest = r;
        }
        let mut parts = rest.split('/');
        let mut value = scope.lookup(parts.next()?)?;
        for part in parts {
            value = value.get(part)?;
        }
        Some(value)
    }
}

/// Immutable set of compiled codecs, shareable across connections.
#[derive(Debug, Clone)]
pub struct CodecSet {
    codecs: Vec<Codec>,
    names: Vec<String>,
    index: HashMap<String, TypeId>,
    /// Lower bound on the encoded size of each type
    min_widths: Vec<usize>,
    max_depth: usize,
    max_collection_length: usize,
}

/// A borrowed handle on one named codec
#[derive(Debug, Clone, Copy)]
pub struct CompiledCodec<'a> {
    set: &'a CodecSet,
    id: TypeId,
}

impl CompiledCodec<'_> {
    pub fn name(&self) -> &str {
        &self.set.names[self.id]
    }

    pub fn read(&self, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        self.set.read_id(self.id, buf, offset)
    }

    pub fn write(&self, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.set.write_id(self.id, value, buf, offset)
    }

    pub fn size_of(&self, value: &Value) -> Result<usize> {
        self.set.size_of_id(self.id, value)
    }
}

impl CodecSet {
    pub fn id(&self, name: &str) -> Option<TypeId> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Every resolvable name, schema types and referenced builtins alike.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn codec(&self, name: &str) -> Result<CompiledCodec<'_>> {
        let id = self.require(name)?;
        Ok(CompiledCodec { set: self, id })
    }

    pub fn read(&self, name: &str, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        self.codec(name)?.read(buf, offset)
    }

    pub fn write(&self, name: &str, value: &Value, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.codec(name)?.write(value, buf, offset)
    }

    pub fn size_of(&self, name: &str, value: &Value) -> Result<usize> {
        self.codec(name)?.size_of(value)
    }

    /// Encode `value` into a freshly sized buffer.
    pub fn serialize(&self, name: &str, value: &Value) -> Result<Vec<u8>> {
        let codec = self.codec(name)?;
        let mut buf = vec![0u8; codec.size_of(value)?];
        let end = codec.write(value, &mut buf, 0)?;
        buf.truncate(end);
        Ok(buf)
    }

    /// Read `name` on behalf of a context extension running `depth` levels deep.
    ///
    /// Re-entry counts against the nesting limit like any other type reference.
    pub fn read_nested(
        &self,
        name: &str,
        buf: &[u8],
        offset: usize,
        depth: usize,
    ) -> Result<(Value, usize)> {
        let codec = self.enter(self.require(name)?, depth, true)?;
        self.read_codec(codec, buf, offset, &Scope::ROOT, depth + 1)
    }

    pub fn write_nested(
        &self,
        name: &str,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        depth: usize,
    ) -> Result<usize> {
        let codec = self.enter(self.require(name)?, depth, false)?;
        self.write_codec(codec, value, buf, offset, &Scope::ROOT, depth + 1)
    }

    pub fn size_of_nested(&self, name: &str, value: &Value, depth: usize) -> Result<usize> {
        let codec = self.enter(self.require(name)?, depth, false)?;
        self.size_codec(codec, value, &Scope::ROOT, depth + 1)
    }

    /// Integer layout of a compiled type, following aliases to a primitive.
    pub fn int_format_of(&self, id: TypeId) -> Option<IntFormat> {
        let mut current = id;
        for _ in 0..=self.codecs.len() {
            match self.codecs.get(current)? {
                Codec::Primitive(p) => return p.int_format(),
                Codec::Ref(next) => current = *next,
                _ => return None,
            }
        }
        None
    }

    fn require(&self, name: &str) -> Result<TypeId> {
        self.id(name)
            .ok_or_else(|| ProtocolError::UnknownType(name.to_string()))
    }

    pub(crate) fn read_id(&self, id: TypeId, buf: &[u8], offset: usize) -> Result<(Value, usize)> {
        self.read_codec(&self.codecs[id], buf, offset, &Scope::ROOT, 0)
    }

    pub(crate) fn write_id(
        &self,
        id: TypeId,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize> {
        self.write_codec(&self.codecs[id], value, buf, offset, &Scope::ROOT, 0)
    }

    pub(crate) fn size_of_id(&self, id: TypeId, value: &Value) -> Result<usize> {
        self.size_codec(&self.codecs[id], value, &Scope::ROOT, 0)
    }

    fn enter(&self, id: TypeId, depth: usize, reading: bool) -> Result<&Codec> {
        if depth >= self.max_depth {
            let msg = constants::ERR_NESTING_TOO_DEEP.to_string();
            return Err(if reading {
                ProtocolError::Malformed(msg)
            } else {
                ProtocolError::InvalidValue(msg)
            });
        }
        Ok(&self.codecs[id])
    }

    fn select<'c>(
        compare_to: &str,
        cases: &'c BTreeMap<String, Codec>,
        default: &'c Codec,
        scope: &Scope<'_>,
    ) -> &'c Codec {
        scope
            .resolve(compare_to)
            .and_then(Value::case_key)
            .and_then(|key| cases.get(&key))
            .unwrap_or(default)
    }

    fn check_len(&self, len: u64) -> Result<usize> {
        usize::try_from(len)
            .ok()
            .filter(|&n| n <= self.max_collection_length)
            .ok_or_else(|| ProtocolError::Malformed(constants::ERR_COLLECTION_TOO_LONG.into()))
    }

    // ---- read ----

    fn read_codec(
        &self,
        codec: &Codec,
        buf: &[u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<(Value, usize)> {
        match codec {
            Codec::Primitive(p) => p.read(buf, offset),
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, true)?;
                self.read_codec(target, buf, offset, scope, depth + 1)
            }
            Codec::Container(fields) => self.read_container(fields, buf, offset, scope, false, depth),
            Codec::Array { count, element } => {
                let (len, mut pos) = self.read_count(count, buf, offset, scope, depth)?;
                pos += offset;
                let min = min_width(element, &self.min_widths);
                if min > 0 && len.saturating_mul(min) > buf.len().saturating_sub(pos) {
                    return Err(ProtocolError::truncated(pos, len.saturating_mul(min), buf.len()));
                }
                let mut items = Vec::with_capacity(len.min(1024));
                let mut empty = 0usize;
                for _ in 0..len {
                    let (item, n) = self.read_codec(element, buf, pos, scope, depth)?;
                    if n == 0 {
                        empty += 1;
                        if empty > MAX_EMPTY_ELEMENTS {
                            return Err(ProtocolError::Malformed(
                                constants::ERR_TOO_MANY_EMPTY_ELEMENTS.into(),
                            ));
                        }
                    }
                    items.push(item);
                    pos += n;
                }
                Ok((Value::List(items), pos - offset))
            }
            Codec::Option(inner) => {
                if take(buf, offset, 1)?[0] == 0 {
                    return Ok((Value::Void, 1));
                }
                let (v, n) = self.read_codec(inner, buf, offset + 1, scope, depth)?;
                Ok((v, n + 1))
            }
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.read_codec(chosen, buf, offset, scope, depth)
            }
            Codec::Mapper { inner, names, .. } => {
                let (raw, n) = self.read_codec(inner, buf, offset, scope, depth)?;
                let mapped = raw
                    .case_key()
                    .and_then(|key| names.get(&key))
                    .map_or(raw, |name| Value::String(name.clone()));
                Ok((mapped, n))
            }
            Codec::PString { count } => {
                let (len, prefix) = self.read_count(count, buf, offset, scope, depth)?;
                let bytes = take(buf, offset + prefix, len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| ProtocolError::Malformed(constants::ERR_INVALID_UTF8.into()))?;
                Ok((Value::String(s.to_string()), prefix + len))
            }
            Codec::Buffer { count } => {
                let (len, prefix) = self.read_count(count, buf, offset, scope, depth)?;
                let bytes = take(buf, offset + prefix, len)?;
                Ok((Value::Bytes(bytes.to_vec()), prefix + len))
            }
            Codec::Bitflags {
                inner,
                format,
                flags,
            } => {
                let (raw, n) = self.read_codec(inner, buf, offset, scope, depth)?;
                Ok((flags_to_value(raw, *format, flags), n))
            }
            Codec::Native(native) => native.read(buf, offset),
            Codec::Context(ctx) => ctx.read(self, buf, offset, depth),
        }
    }

    /// Read the codec of an anonymous field, keeping any container transparent.
    fn read_flattened(
        &self,
        codec: &Codec,
        buf: &[u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<(Value, usize)> {
        match codec {
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, true)?;
                self.read_flattened(target, buf, offset, scope, depth + 1)
            }
            Codec::Container(fields) => self.read_container(fields, buf, offset, scope, true, depth),
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.read_flattened(chosen, buf, offset, scope, depth)
            }
            other => self.read_codec(other, buf, offset, scope, depth),
        }
    }

    fn read_container(
        &self,
        fields: &[Field],
        buf: &[u8],
        offset: usize,
        parent: &Scope<'_>,
        anon: bool,
        depth: usize,
    ) -> Result<(Value, usize)> {
        let mut map = BTreeMap::new();
        let mut pos = offset;
        for field in fields {
            match field {
                Field::Named { name, codec } => {
                    let (v, n) = {
                        let scope = Scope::child(&map, parent, anon);
                        self.read_codec(codec, buf, pos, &scope, depth)?
                    };
                    map.insert(name.clone(), v);
                    pos += n;
                }
                Field::Anon(codec) => {
                    let (v, n) = {
                        let scope = Scope::child(&map, parent, anon);
                        self.read_flattened(codec, buf, pos, &scope, depth)?
                    };
                    match v {
                        Value::Map(inner) => map.extend(inner),
                        Value::Void => {}
                        other => {
                            return Err(ProtocolError::Malformed(format!(
                                "anonymous field produced {}, expected a map",
                                other.kind()
                            )))
                        }
                    }
                    pos += n;
                }
                Field::EnumWidth { name, count_field } => {
                    let width = {
                        let scope = Scope::child(&map, parent, anon);
                        derive_width(&scope, count_field).map_err(ProtocolError::Malformed)?
                    };
                    map.insert(name.clone(), Value::from(width));
                }
            }
        }
        Ok((Value::Map(map), pos - offset))
    }

    /// Returns `(length, prefix bytes consumed)`.
    fn read_count(
        &self,
        count: &Count,
        buf: &[u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<(usize, usize)> {
        let (raw, consumed) = match count {
            Count::Fixed(n) => return Ok((*n, 0)),
            Count::Prefixed(codec) => self.read_codec(codec, buf, offset, scope, depth)?,
            Count::Field(path) => {
                let v = scope.resolve(path).ok_or_else(|| {
                    ProtocolError::Malformed(format!("count field `{path}` is not set"))
                })?;
                (v.clone(), 0)
            }
        };
        let len = raw
            .as_u64()
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid collection length {raw}")))?;
        Ok((self.check_len(len)?, consumed))
    }

    // ---- write ----

    fn write_codec(
        &self,
        codec: &Codec,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<usize> {
        match codec {
            Codec::Primitive(p) => p.write(value, buf, offset),
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, false)?;
                self.write_codec(target, value, buf, offset, scope, depth + 1)
            }
            Codec::Container(fields) => {
                self.write_container(fields, value, buf, offset, scope, false, depth)
            }
            Codec::Array { count, element } => {
                let items = list_in(value)?;
                let mut pos = self.write_count(count, items.len(), buf, offset, scope, depth)?;
                for item in items {
                    pos = self.write_codec(element, item, buf, pos, scope, depth)?;
                }
                Ok(pos)
            }
            Codec::Option(inner) => {
                if value.is_void() {
                    return put(buf, offset, &[0]);
                }
                let pos = put(buf, offset, &[1])?;
                self.write_codec(inner, value, buf, pos, scope, depth)
            }
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.write_codec(chosen, value, buf, offset, scope, depth)
            }
            Codec::Mapper { inner, keys, .. } => {
                let wire = mapped_key(keys, value);
                self.write_codec(inner, wire, buf, offset, scope, depth)
            }
            Codec::PString { count } => {
                let s = value.as_str().ok_or_else(|| mismatch("string", value))?;
                let pos = self.write_count(count, s.len(), buf, offset, scope, depth)?;
                put(buf, pos, s.as_bytes())
            }
            Codec::Buffer { count } => {
                let bytes = value.as_bytes().ok_or_else(|| mismatch("bytes", value))?;
                let pos = self.write_count(count, bytes.len(), buf, offset, scope, depth)?;
                put(buf, pos, bytes)
            }
            Codec::Bitflags {
                inner,
                format,
                flags,
            } => {
                let raw = value_to_flags(value, *format, flags)?;
                self.write_codec(inner, &raw, buf, offset, scope, depth)
            }
            Codec::Native(native) => native.write(value, buf, offset),
            Codec::Context(ctx) => ctx.write(self, value, buf, offset, depth),
        }
    }

    fn write_flattened(
        &self,
        codec: &Codec,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<usize> {
        match codec {
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, false)?;
                self.write_flattened(target, value, buf, offset, scope, depth + 1)
            }
            Codec::Container(fields) => {
                self.write_container(fields, value, buf, offset, scope, true, depth)
            }
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.write_flattened(chosen, value, buf, offset, scope, depth)
            }
            other => self.write_codec(other, value, buf, offset, scope, depth),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_container(
        &self,
        fields: &[Field],
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        parent: &Scope<'_>,
        anon: bool,
        depth: usize,
    ) -> Result<usize> {
        let value = with_derived_widths(fields, value, parent, anon)?;
        let map = value.as_map().ok_or_else(|| mismatch("map", &value))?;
        let scope = Scope::child(map, parent, anon);
        let mut pos = offset;
        for field in fields {
            pos = match field {
                Field::Named { name, codec } => {
                    let v = map.get(name).unwrap_or(&VOID);
                    self.write_codec(codec, v, buf, pos, &scope, depth)?
                }
                Field::Anon(codec) => self.write_flattened(codec, &value, buf, pos, &scope, depth)?,
                Field::EnumWidth { .. } => pos,
            };
        }
        Ok(pos)
    }

    fn write_count(
        &self,
        count: &Count,
        len: usize,
        buf: &mut [u8],
        offset: usize,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<usize> {
        match count {
            Count::Prefixed(codec) => {
                self.write_codec(codec, &Value::UInt(len as u64), buf, offset, scope, depth)
            }
            fixed_or_field => {
                check_declared_len(fixed_or_field, len, scope)?;
                Ok(offset)
            }
        }
    }

    // ---- size ----

    fn size_codec(
        &self,
        codec: &Codec,
        value: &Value,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<usize> {
        match codec {
            Codec::Primitive(p) => p.size_of(value),
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, false)?;
                self.size_codec(target, value, scope, depth + 1)
            }
            Codec::Container(fields) => self.size_container(fields, value, scope, false, depth),
            Codec::Array { count, element } => {
                let items = list_in(value)?;
                let mut size = self.size_count(count, items.len(), scope, depth)?;
                for item in items {
                    size += self.size_codec(element, item, scope, depth)?;
                }
                Ok(size)
            }
            Codec::Option(inner) => {
                if value.is_void() {
                    return Ok(1);
                }
                Ok(1 + self.size_codec(inner, value, scope, depth)?)
            }
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.size_codec(chosen, value, scope, depth)
            }
            Codec::Mapper { inner, keys, .. } => {
                self.size_codec(inner, mapped_key(keys, value), scope, depth)
            }
            Codec::PString { count } => {
                let s = value.as_str().ok_or_else(|| mismatch("string", value))?;
                Ok(self.size_count(count, s.len(), scope, depth)? + s.len())
            }
            Codec::Buffer { count } => {
                let bytes = value.as_bytes().ok_or_else(|| mismatch("bytes", value))?;
                Ok(self.size_count(count, bytes.len(), scope, depth)? + bytes.len())
            }
            Codec::Bitflags {
                inner,
                format,
                flags,
            } => {
                let raw = value_to_flags(value, *format, flags)?;
                self.size_codec(inner, &raw, scope, depth)
            }
            Codec::Native(native) => native.size_of(value),
            Codec::Context(ctx) => ctx.size_of(self, value, depth),
        }
    }

    fn size_flattened(
        &self,
        codec: &Codec,
        value: &Value,
        scope: &Scope<'_>,
        depth: usize,
    ) -> Result<usize> {
        match codec {
            Codec::Ref(id) => {
                let target = self.enter(*id, depth, false)?;
                self.size_flattened(target, value, scope, depth + 1)
            }
            Codec::Container(fields) => self.size_container(fields, value, scope, true, depth),
            Codec::Switch {
                compare_to,
                cases,
                default,
            } => {
                let chosen = Self::select(compare_to, cases, default, scope);
                self.size_flattened(chosen, value, scope, depth)
            }
            other => self.size_codec(other, value, scope, depth),
        }
    }

    fn size_container(
        &self,
        fields: &[Field],
        value: &Value,
        parent: &Scope<'_>,
        anon: bool,
        depth: usize,
    ) -> Result<usize> {
        let value = with_derived_widths(fields, value, parent, anon)?;
        let map = value.as_map().ok_or_else(|| mismatch("map", &value))?;
        let scope = Scope::child(map, parent, anon);
        let mut size = 0;
        for field in fields {
            size += match field {
                Field::Named { name, codec } => {
                    self.size_codec(codec, map.get(name).unwrap_or(&VOID), &scope, depth)?
                }
                Field::Anon(codec) => self.size_flattened(codec, &value, &scope, depth)?,
                Field::EnumWidth { .. } => 0,
            };
        }
        Ok(size)
    }

    fn size_count(&self, count: &Count, len: usize, scope: &Scope<'_>, depth: usize) -> Result<usize> {
        match count {
            Count::Prefixed(codec) => self.size_codec(codec, &Value::UInt(len as u64), scope, depth),
            fixed_or_field => {
                check_declared_len(fixed_or_field, len, scope)?;
                Ok(0)
            }
        }
    }
}

fn mismatch(expected: &str, value: &Value) -> ProtocolError {
    ProtocolError::InvalidValue(format!("expected {expected}, got {}", value.kind()))
}

fn list_in(value: &Value) -> Result<&[Value]> {
    value.as_list().ok_or_else(|| mismatch("list", value))
}

fn mapped_key<'v>(keys: &'v BTreeMap<String, Value>, value: &'v Value) -> &'v Value {
    value.as_str().and_then(|name| keys.get(name)).unwrap_or(value)
}

/// A fixed or field-held length must agree with the collection being written.
fn check_declared_len(count: &Count, len: usize, scope: &Scope<'_>) -> Result<()> {
    let declared = match count {
        Count::Fixed(n) => Some(*n as u64),
        Count::Field(path) => scope.resolve(path).and_then(Value::as_u64),
        Count::Prefixed(_) => None,
    };
    match declared {
        Some(n) if n != len as u64 => Err(ProtocolError::InvalidValue(format!(
            "collection has {len} elements but its length is declared as {n}"
        ))),
        _ => Ok(()),
    }
}

fn derive_width(scope: &Scope<'_>, count_field: &str) -> std::result::Result<&'static str, String> {
    let count = scope
        .resolve(count_field)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("`{count_field}` must be set before the enum width is derived"))?;
    enum_width(count).ok_or_else(|| format!("{count} enum values exceed the widest enum index"))
}

/// Store derived enum widths in a copy of the map before it is written.
fn with_derived_widths<'v>(
    fields: &[Field],
    value: &'v Value,
    parent: &Scope<'_>,
    anon: bool,
) -> Result<Cow<'v, Value>> {
    if !fields.iter().any(|f| matches!(f, Field::EnumWidth { .. })) {
        return Ok(Cow::Borrowed(value));
    }
    let mut map = value.as_map().ok_or_else(|| mismatch("map", value))?.clone();
    for field in fields {
        if let Field::EnumWidth { name, count_field } = field {
            let width = {
                let scope = Scope::child(&map, parent, anon);
                derive_width(&scope, count_field).map_err(ProtocolError::InvalidValue)?
            };
            map.insert(name.clone(), Value::from(width));
        }
    }
    Ok(Cow::Owned(Value::Map(map)))
}

/// Compilation state, handed to parametrized extensions.
#[derive(Debug)]
pub struct Compiler<'r> {
    registry: &'r ExtensionRegistry,
    schema: BTreeMap<String, TypeDef>,
    codecs: Vec<Option<Codec>>,
    names: Vec<String>,
    index: HashMap<String, TypeId>,
}

impl<'r> Compiler<'r> {
    fn new(schema: &Schema, registry: &'r ExtensionRegistry) -> Result<Self> {
        let mut compiler = Self {
            registry,
            schema: BTreeMap::new(),
            codecs: Vec::new(),
            names: Vec::new(),
            index: HashMap::new(),
        };
        for (name, def) in schema {
            if def.is_native() {
                if !compiler.is_builtin(name) {
                    return Err(ProtocolError::Schema(format!(
                        "`{name}`: {}",
                        constants::ERR_NATIVE_WITHOUT_IMPL
                    )));
                }
                continue;
            }
            compiler.schema.insert(name.clone(), def.clone());
            compiler.intern(name, None);
        }
        Ok(compiler)
    }

    fn is_builtin(&self, name: &str) -> bool {
        name == ENUM_WIDTH || Primitive::from_name(name).is_some() || self.registry.contains(name)
    }

    fn intern(&mut self, name: &str, codec: Option<Codec>) -> TypeId {
        let id = self.codecs.len();
        self.codecs.push(codec);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    /// Integer layout behind `name`, following schema aliases.
    pub fn int_format(&self, name: &str) -> Option<IntFormat> {
        let mut current = name;
        for _ in 0..=self.schema.len() {
            match self.schema.get(current) {
                Some(TypeDef::Name(next)) => current = next,
                Some(TypeDef::Parametrized(..)) => return None,
                None => return Primitive::from_name(current)?.int_format(),
            }
        }
        None
    }

    /// Compile an inline type definition.
    pub fn compile_type(&mut self, def: &TypeDef) -> Result<Codec> {
        match def {
            TypeDef::Name(name) => self.reference(name),
            TypeDef::Parametrized(kind, raw) => self.compile_kind(kind, raw),
        }
    }

    fn reference(&mut self, name: &str) -> Result<Codec> {
        if self.schema.contains_key(name) {
            if let Some(&id) = self.index.get(name) {
                return Ok(Codec::Ref(id));
            }
        }
        if let Some(p) = Primitive::from_name(name) {
            self.expose(name, Codec::Primitive(p));
            return Ok(Codec::Primitive(p));
        }
        let registry = self.registry;
        let codec = match registry.get(name) {
            Some(Extension::Native(native)) => Codec::Native(Arc::clone(native)),
            Some(Extension::Context(ctx)) => {
                let ctx = Arc::clone(ctx);
                for dep in ctx.dependencies() {
                    self.reference(dep)?;
                }
                Codec::Context(ctx)
            }
            Some(Extension::Parametrized(_)) => {
                return Err(ProtocolError::Schema(format!(
                    "`{name}` needs parameters: use [\"{name}\", {{ ... }}]"
                )))
            }
            None if name == ENUM_WIDTH => {
                return Err(ProtocolError::Schema(
                    constants::ERR_DERIVED_WIDTH_OUTSIDE_CONTAINER.into(),
                ))
            }
            None => return Err(ProtocolError::Schema(format!("unknown type `{name}`"))),
        };
        self.expose(name, codec.clone());
        Ok(codec)
    }

    /// Make a builtin callable by name from the finished set.
    fn expose(&mut self, name: &str, codec: Codec) {
        if !self.index.contains_key(name) {
            self.intern(name, Some(codec));
        }
    }

    fn compile_kind(&mut self, kind: &str, raw: &serde_json::Value) -> Result<Codec> {
        let registry = self.registry;
        match kind {
            "container" => {
                let defs: Vec<FieldDef> = params(kind, raw)?;
                let mut fields = Vec::with_capacity(defs.len());
                for def in &defs {
                    fields.push(self.compile_field(def)?);
                }
                Ok(Codec::Container(fields))
            }
            "array" => {
                let p: CountedParams = params(kind, raw)?;
                let element = p
                    .ty
                    .as_ref()
                    .ok_or_else(|| ProtocolError::Schema("array needs a `type`".into()))?;
                Ok(Codec::Array {
                    element: Box::new(self.compile_type(element)?),
                    count: self.compile_count(kind, &p)?,
                })
            }
            "option" => {
                let inner: TypeDef = params(kind, raw)?;
                Ok(Codec::Option(Box::new(self.compile_type(&inner)?)))
            }
            "switch" => {
                let p: SwitchParams = params(kind, raw)?;
                let mut cases = BTreeMap::new();
                for (key, def) in &p.fields {
                    cases.insert(normalize_key(key), self.compile_type(def)?);
                }
                let default = match &p.default {
                    Some(def) => self.compile_type(def)?,
                    None => Codec::Primitive(Primitive::Void),
                };
                Ok(Codec::Switch {
                    compare_to: p.compare_to,
                    cases,
                    default: Box::new(default),
                })
            }
            "mapper" => {
                let p: MapperParams = params(kind, raw)?;
                let inner = self.compile_type(&p.ty)?;
                let mut names = BTreeMap::new();
                let mut keys = BTreeMap::new();
                for (key, name) in &p.mappings {
                    let wire = match parse_int_key(key) {
                        Some(v) => match i64::try_from(v) {
                            Ok(v) => Value::Int(v),
                            Err(_) => Value::UInt(u64::try_from(v).map_err(|_| {
                                ProtocolError::Schema(format!("mapper key {key} out of range"))
                            })?),
                        },
                        None => Value::String(key.clone()),
                    };
                    if keys.insert(name.clone(), wire).is_some() {
                        return Err(ProtocolError::Schema(format!(
                            "mapper name `{name}` is used twice"
                        )));
                    }
                    names.insert(normalize_key(key), name.clone());
                }
                Ok(Codec::Mapper {
                    inner: Box::new(inner),
                    names,
                    keys,
                })
            }
            "pstring" | "buffer" => {
                let p: CountedParams = params(kind, raw)?;
                let count = self.compile_count(kind, &p)?;
                Ok(if kind == "pstring" {
                    Codec::PString { count }
                } else {
                    Codec::Buffer { count }
                })
            }
            ENUM_WIDTH => Err(ProtocolError::Schema(
                constants::ERR_DERIVED_WIDTH_OUTSIDE_CONTAINER.into(),
            )),
            other => match registry.get(other) {
                Some(Extension::Parametrized(ext)) => {
                    let ext = Arc::clone(ext);
                    ext.compile(raw, self)
                }
                Some(_) => Err(ProtocolError::Schema(format!(
                    "`{other}` takes no parameters"
                ))),
                None => Err(ProtocolError::Schema(format!("unknown type kind `{other}`"))),
            },
        }
    }

    fn compile_field(&mut self, def: &FieldDef) -> Result<Field> {
        if let Some(params) = self.enum_width_params(&def.ty)? {
            let name = def.name.clone().ok_or_else(|| {
                ProtocolError::Schema(format!("`{ENUM_WIDTH}` field needs a name"))
            })?;
            return Ok(Field::EnumWidth {
                name,
                count_field: params.count_field,
            });
        }
        let codec = self.compile_type(&def.ty)?;
        match (&def.name, def.anon) {
            (_, true) => Ok(Field::Anon(codec)),
            (Some(name), false) => Ok(Field::Named {
                name: name.clone(),
                codec,
            }),
            (None, false) => Err(ProtocolError::Schema(
                "container field needs a `name` or `anon: true`".into(),
            )),
        }
    }

    /// Recognize the derived-width step, through schema aliases.
    fn enum_width_params(&self, def: &TypeDef) -> Result<Option<EnumWidthParams>> {
        let mut current = def;
        for _ in 0..=self.schema.len() {
            match current {
                TypeDef::Parametrized(kind, raw) if kind == ENUM_WIDTH => {
                    return params(kind, raw).map(Some)
                }
                TypeDef::Name(name) if name == ENUM_WIDTH && !self.schema.contains_key(name) => {
                    return Ok(Some(EnumWidthParams::default()))
                }
                TypeDef::Name(name) => match self.schema.get(name) {
                    Some(next) => current = next,
                    None => return Ok(None),
                },
                TypeDef::Parametrized(..) => return Ok(None),
            }
        }
        Ok(None)
    }

    fn compile_count(&mut self, kind: &str, p: &CountedParams) -> Result<Count> {
        match (&p.count_type, &p.count) {
            (Some(ty), None) => Ok(Count::Prefixed(Box::new(self.compile_type(ty)?))),
            (None, Some(CountDef::Fixed(n))) => usize::try_from(*n)
                .map(Count::Fixed)
                .map_err(|_| ProtocolError::Schema(format!("{kind} count {n} is too large"))),
            (None, Some(CountDef::Field(path))) => Ok(Count::Field(path.clone())),
            _ => Err(ProtocolError::Schema(format!(
                "{kind} needs exactly one of `countType` or `count`"
            ))),
        }
    }

    fn finish(self, config: &CodecConfig) -> Result<CodecSet> {
        let mut codecs = Vec::with_capacity(self.codecs.len());
        for (codec, name) in self.codecs.into_iter().zip(&self.names) {
            codecs.push(codec.ok_or_else(|| {
                ProtocolError::Schema(format!("type `{name}` was never compiled"))
            })?);
        }
        check_terminates(&codecs, &self.names)?;
        let min_widths = min_widths(&codecs);
        Ok(CodecSet {
            min_widths,
            codecs,
            names: self.names,
            index: self.index,
            max_depth: config.max_type_depth,
            max_collection_length: config.max_collection_length,
        })
    }
}

/// Fewest bytes any value of `codec` can encode to; `table` holds the bound per type id.
fn min_width(codec: &Codec, table: &[usize]) -> usize {
    let count_width = |count: &Count| match count {
        Count::Prefixed(prefix) => min_width(prefix, table),
        Count::Fixed(_) | Count::Field(_) => 0,
    };
    match codec {
        Codec::Primitive(p) => p.fixed_size().unwrap_or(1),
        Codec::Ref(id) => table[*id],
        Codec::Container(fields) => fields
            .iter()
            .map(|field| match field {
                Field::Named { codec, .. } | Field::Anon(codec) => min_width(codec, table),
                Field::EnumWidth { .. } => 0,
            })
            .fold(0, usize::saturating_add),
        Codec::Array { count, element } => {
            let elements = match count {
                Count::Fixed(n) => n.saturating_mul(min_width(element, table)),
                _ => 0,
            };
            count_width(count).saturating_add(elements)
        }
        Codec::PString { count } | Codec::Buffer { count } => match count {
            Count::Fixed(n) => *n,
            other => count_width(other),
        },
        Codec::Option(_) => 1,
        Codec::Switch { cases, default, .. } => cases
            .values()
            .chain(std::iter::once(default.as_ref()))
            .map(|c| min_width(c, table))
            .min()
            .unwrap_or(0),
        Codec::Mapper { inner, .. } | Codec::Bitflags { inner, .. } => min_width(inner, table),
        Codec::Native(native) => native.min_size(),
        Codec::Context(ctx) => ctx.min_size(),
    }
}

/// Per-type size bounds, grown from zero until stable. Every round is a valid lower
/// bound, so stopping early only loosens it.
fn min_widths(codecs: &[Codec]) -> Vec<usize> {
    let mut table = vec![0; codecs.len()];
    for _ in 0..=codecs.len().min(64) {
        let next: Vec<usize> = codecs.iter().map(|c| min_width(c, &table)).collect();
        if next == table {
            break;
        }
        table = next;
    }
    table
}

/// Ids a value of `codec` always contains, however the data looks.
fn mandatory_refs(codec: &Codec, out: &mut Vec<TypeId>) {
    match codec {
        Codec::Ref(id) => out.push(*id),
        Codec::Container(fields) => {
            for field in fields {
                match field {
                    Field::Named { codec, .. } | Field::Anon(codec) => mandatory_refs(codec, out),
                    Field::EnumWidth { .. } => {}
                }
            }
        }
        Codec::Array { count, element } => {
            if let Count::Prefixed(prefix) = count {
                mandatory_refs(prefix, out);
            }
            if matches!(count, Count::Fixed(n) if *n > 0) {
                mandatory_refs(element, out);
            }
        }
        Codec::PString { count } | Codec::Buffer { count } => {
            if let Count::Prefixed(prefix) = count {
                mandatory_refs(prefix, out);
            }
        }
        Codec::Mapper { inner, .. } | Codec::Bitflags { inner, .. } => mandatory_refs(inner, out),
        Codec::Option(_)
        | Codec::Switch { .. }
        | Codec::Primitive(_)
        | Codec::Native(_)
        | Codec::Context(_) => {}
    }
}

fn check_terminates(codecs: &[Codec], names: &[String]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    let edges: Vec<Vec<TypeId>> = codecs
        .iter()
        .map(|codec| {
            let mut out = Vec::new();
            mandatory_refs(codec, &mut out);
            out
        })
        .collect();
    let mut marks = vec![Mark::New; codecs.len()];

    for root in 0..codecs.len() {
        if marks[root] != Mark::New {
            continue;
        }
        // Iterative DFS: (node, next edge index)
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Active;
        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            if let Some(&target) = edges[node].get(next) {
                top.1 += 1;
                match marks[target] {
                    Mark::Active => {
                        return Err(ProtocolError::Schema(format!(
                            "type `{}` contains itself with no option, switch or variable-length array to end the recursion",
                            names[target]
                        )))
                    }
                    Mark::New => {
                        marks[target] = Mark::Active;
                        stack.push((target, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Compile `schema` with the default codec limits.
pub fn compile(schema: &Schema, registry: &ExtensionRegistry) -> Result<CodecSet> {
    compile_with(schema, registry, &CodecConfig::default())
}

/// Compile `schema`, taking nesting and collection limits from `config`.
#[instrument(skip_all, fields(types = schema.len()))]
pub fn compile_with(
    schema: &Schema,
    registry: &ExtensionRegistry,
    config: &CodecConfig,
) -> Result<CodecSet> {
    let mut compiler = Compiler::new(schema, registry)?;
    let pending: Vec<(String, TypeDef)> = compiler
        .schema
        .iter()
        .map(|(name, def)| (name.clone(), def.clone()))
        .collect();
    for (name, def) in pending {
        let codec = compiler
            .compile_type(&def)
            .map_err(|e| match e {
                ProtocolError::Schema(msg) => ProtocolError::Schema(format!("in `{name}`: {msg}")),
                other => other,
            })?;
        if let Some(&id) = compiler.index.get(&name) {
            compiler.codecs[id] = Some(codec);
        }
    }
    let set = compiler.finish(config)?;
    debug!(codecs = set.codecs.len(), "schema compiled");
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::nbt::{NamedTag, Tag};
    use crate::codec::schema::parse_schema;

    fn build(json: &str) -> CodecSet {
        compile(&parse_schema(json).unwrap(), &ExtensionRegistry::default()).unwrap()
    }

    fn compile_err(json: &str) -> ProtocolError {
        compile(&parse_schema(json).unwrap(), &ExtensionRegistry::default()).unwrap_err()
    }

    fn roundtrip(set: &CodecSet, name: &str, value: &Value) -> Vec<u8> {
        let bytes = set.serialize(name, value).unwrap();
        assert_eq!(set.size_of(name, value).unwrap(), bytes.len());
        let (decoded, n) = set.read(name, &bytes, 0).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(&decoded, value);
        bytes
    }

    #[test]
    fn test_set_time_body() {
        let set = build(r#"{ "packet_set_time": ["container", [{ "name": "time", "type": "zigzag32" }]] }"#);
        let bytes = roundtrip(
            &set,
            "packet_set_time",
            &Value::map([("time", Value::Int(5433771))]),
        );
        assert_eq!(bytes, [0xd6, 0xa6, 0x97, 0x05]);
    }

    #[test]
    fn test_array_with_count_type_and_field_count() {
        let set = build(
            r#"{
                "string": ["pstring", { "countType": "varint" }],
                "names": ["array", { "countType": "varint", "type": "string" }],
                "pair": ["container", [
                    { "name": "len", "type": "u8" },
                    { "name": "items", "type": ["array", { "count": "len", "type": "lu16" }] }
                ]]
            }"#,
        );
        let names: Value = ["a", "bc"].into_iter().map(Value::from).collect();
        assert_eq!(roundtrip(&set, "names", &names), [2, 1, b'a', 2, b'b', b'c']);

        let pair = Value::map([
            ("len", Value::UInt(2)),
            ("items", Value::List(vec![Value::UInt(1), Value::UInt(0x0203)])),
        ]);
        assert_eq!(roundtrip(&set, "pair", &pair), [2, 1, 0, 3, 2]);

        let wrong = Value::map([("len", Value::UInt(3)), ("items", Value::List(vec![]))]);
        assert!(matches!(
            set.serialize("pair", &wrong),
            Err(ProtocolError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_switch_and_mapper() {
        let set = build(
            r#"{
                "kind": ["mapper", { "type": "u8", "mappings": { "0x00": "text", "0x01": "number" } }],
                "message": ["container", [
                    { "name": "kind", "type": "kind" },
                    { "name": "body", "type": ["switch", {
                        "compareTo": "kind",
                        "fields": { "text": "cstring", "number": "li32" },
                        "default": "void"
                    }] }
                ]]
            }"#,
        );
        let text = Value::map([("kind", Value::from("text")), ("body", Value::from("hey"))]);
        assert_eq!(roundtrip(&set, "message", &text), [0, b'h', b'e', b'y', 0]);
        let number = Value::map([("kind", Value::from("number")), ("body", Value::Int(-2))]);
        assert_eq!(roundtrip(&set, "message", &number), [1, 0xfe, 0xff, 0xff, 0xff]);

        // Unmapped wire values pass through unchanged and fall to the default case.
        let (v, n) = set.read("message", &[7], 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(v.get("kind"), Some(&Value::UInt(7)));
        assert_eq!(v.get("body"), Some(&Value::Void));
    }

    #[test]
    fn test_parent_path_and_anonymous_fields() {
        let set = build(
            r#"{
                "inner": ["container", [
                    { "name": "value", "type": ["switch", { "compareTo": "../flag", "fields": { "true": "u8" } }] }
                ]],
                "outer": ["container", [
                    { "name": "flag", "type": "bool" },
                    { "name": "nested", "type": "inner" },
                    { "anon": true, "type": ["container", [
                        { "name": "extra", "type": ["switch", { "compareTo": "flag", "fields": { "true": "u8" } }] }
                    ]] }
                ]]
            }"#,
        );
        let on = Value::map([
            ("flag", Value::Bool(true)),
            ("nested", Value::map([("value", Value::UInt(9))])),
            ("extra", Value::UInt(4)),
        ]);
        assert_eq!(roundtrip(&set, "outer", &on), [1, 9, 4]);

        let (off, n) = set.read("outer", &[0], 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(off.get("extra"), Some(&Value::Void));
    }

    #[test]
    fn test_option_and_recursion_through_option() {
        let set = build(
            r#"{
                "node": ["container", [
                    { "name": "id", "type": "u8" },
                    { "name": "next", "type": ["option", "node"] }
                ]]
            }"#,
        );
        let list = Value::map([
            ("id", Value::UInt(1)),
            (
                "next",
                Value::map([("id", Value::UInt(2)), ("next", Value::Void)]),
            ),
        ]);
        assert_eq!(roundtrip(&set, "node", &list), [1, 1, 2, 0]);
    }

    #[test]
    fn test_unterminated_recursion_rejected() {
        let err = compile_err(r#"{ "a": ["container", [{ "name": "b", "type": "b" }]], "b": "a" }"#);
        assert!(matches!(err, ProtocolError::Schema(ref m) if m.contains("contains itself")));

        let fixed = compile_err(r#"{ "t": ["array", { "count": 2, "type": "t" }] }"#);
        assert!(matches!(fixed, ProtocolError::Schema(_)));

        // A variable-length array may be empty, so this terminates.
        build(r#"{ "tree": ["array", { "countType": "varint", "type": "tree" }] }"#);
    }

    #[test]
    fn test_schema_errors() {
        assert!(matches!(
            compile_err(r#"{ "a": "nope" }"#),
            ProtocolError::Schema(ref m) if m.contains("nope")
        ));
        assert!(matches!(
            compile_err(r#"{ "mystery": "native" }"#),
            ProtocolError::Schema(ref m) if m.contains(constants::ERR_NATIVE_WITHOUT_IMPL)
        ));
        assert!(matches!(
            compile_err(r#"{ "w": "enum_size_based_on_values_len" }"#),
            ProtocolError::Schema(ref m) if m.contains(constants::ERR_DERIVED_WIDTH_OUTSIDE_CONTAINER)
        ));
        assert!(matches!(
            compile_err(r#"{ "s": ["pstring", {}] }"#),
            ProtocolError::Schema(_)
        ));
        assert!(matches!(
            compile_err(r#"{ "b": ["bitflags", { "type": "cstring", "flags": ["a"] }] }"#),
            ProtocolError::Schema(_)
        ));
    }

    #[test]
    fn test_enum_width_step() {
        let set = build(
            r#"{
                "enum_size_based_on_values_len": "native",
                "commands": ["container", [
                    { "name": "values_len", "type": "varint" },
                    { "name": "_enum_type", "type": "enum_size_based_on_values_len" },
                    { "name": "index", "type": ["switch", {
                        "compareTo": "_enum_type",
                        "fields": { "byte": "u8", "short": "lu16", "int": "lu32" }
                    }] }
                ]]
            }"#,
        );
        let small = Value::map([("values_len", Value::UInt(3)), ("index", Value::UInt(2))]);
        let bytes = set.serialize("commands", &small).unwrap();
        assert_eq!(bytes, [3, 2]);
        let (decoded, _) = set.read("commands", &bytes, 0).unwrap();
        assert_eq!(decoded.get("_enum_type"), Some(&Value::from("byte")));

        let wide = Value::map([("values_len", Value::UInt(300)), ("index", Value::UInt(299))]);
        assert_eq!(set.serialize("commands", &wide).unwrap(), [0xac, 0x02, 0x2b, 0x01]);
        assert_eq!(set.size_of("commands", &wide).unwrap(), 4);

        let huge = Value::map([("values_len", Value::UInt(0x100_0000)), ("index", Value::UInt(0))]);
        assert!(matches!(
            set.serialize("commands", &huge),
            Err(ProtocolError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_enum_width_thresholds() {
        assert_eq!(enum_width(0), Some("byte"));
        assert_eq!(enum_width(255), Some("byte"));
        assert_eq!(enum_width(256), Some("short"));
        assert_eq!(enum_width(65535), Some("short"));
        assert_eq!(enum_width(65536), Some("int"));
        assert_eq!(enum_width(16777215), Some("int"));
        assert_eq!(enum_width(16777216), None);
    }

    #[test]
    fn test_bitflags_through_compiler() {
        let set = build(
            r#"{ "perms": ["bitflags", { "type": "lu16", "flags": { "build": 0, "mine": 1, "op": 8 }, "shift": true }] }"#,
        );
        let (v, n) = set.read("perms", &[0x03, 0x01], 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(v.get("build"), Some(&Value::Bool(true)));
        assert_eq!(v.get("op"), Some(&Value::Bool(true)));
        assert_eq!(v.get("_value"), Some(&Value::UInt(0x0103)));
        assert_eq!(set.serialize("perms", &v).unwrap(), [0x03, 0x01]);
    }

    #[test]
    fn test_nbt_loop_terminator() {
        let set = build(r#"{ "trees": "nbtLoop" }"#);
        let tree = Value::from(NamedTag::new("", Tag::Compound(vec![("a".into(), Tag::Byte(1))])));
        let value = Value::List(vec![tree.clone(), tree]);
        let mut bytes = roundtrip(&set, "trees", &value);
        assert_eq!(bytes.last(), Some(&0));

        // Trailing bytes after the terminator are left alone.
        bytes.push(0xaa);
        let (_, n) = set.read("trees", &bytes, 0).unwrap();
        assert_eq!(n, bytes.len() - 1);

        assert_eq!(roundtrip(&set, "trees", &Value::List(vec![])), [0]);
        assert!(set.contains("nbt"));
    }

    #[test]
    fn test_truncated_reads() {
        let set = build(
            r#"{ "p": ["container", [{ "name": "a", "type": "li32" }, { "name": "s", "type": ["pstring", { "countType": "varint" }] }]] }"#,
        );
        for buf in [&[1u8, 0][..], &[1, 0, 0, 0][..], &[1, 0, 0, 0, 5, b'a'][..]] {
            assert!(set.read("p", buf, 0).unwrap_err().is_incomplete());
        }
    }

    #[test]
    fn test_collection_limit() {
        let schema = parse_schema(r#"{ "a": ["array", { "countType": "varint", "type": "void" }] }"#).unwrap();
        let config = CodecConfig {
            max_collection_length: 10,
            ..CodecConfig::default()
        };
        let set = compile_with(&schema, &ExtensionRegistry::default(), &config).unwrap();
        assert_eq!(set.read("a", &[10], 0).unwrap().0.as_list().map(<[Value]>::len), Some(10));
        assert!(matches!(set.read("a", &[11], 0), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_empty_elements_are_capped() {
        let set = build(r#"{ "a": ["array", { "countType": "varint", "type": "void" }] }"#);
        // 16777215 voids from four bytes
        assert!(matches!(
            set.read("a", &[0xff, 0xff, 0xff, 0x07], 0),
            Err(ProtocolError::Malformed(_))
        ));
        let (value, n) = set.read("a", &[0x80, 0x20], 0).unwrap();
        assert_eq!(value.as_list().map(<[Value]>::len), Some(MAX_EMPTY_ELEMENTS));
        assert_eq!(n, 2);
    }

    #[test]
    fn test_count_beyond_remaining_bytes_is_truncated() {
        let set = build(
            r#"{ "a": ["array", { "countType": "varint", "type": "lu16" }],
                 "r": ["container", [{ "name": "x", "type": "u8" }, { "name": "id", "type": "uuid" }]],
                 "b": ["array", { "countType": "varint", "type": "r" }] }"#,
        );
        match set.read("a", &[0xe8, 0x07, 1, 2], 0) {
            Err(ProtocolError::Truncated { needed, available }) => {
                assert_eq!(needed, 2000);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match set.read("b", &[3, 0], 0) {
            Err(ProtocolError::Truncated { needed, .. }) => assert_eq!(needed, 51),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn self_nesting_tree(depth: usize) -> Value {
        let mut node = Value::map([("t", Value::UInt(0)), ("c", Value::List(vec![]))]);
        for _ in 0..depth {
            node = Value::map([("t", Value::UInt(1)), ("c", Value::List(vec![node]))]);
        }
        Value::List(vec![node])
    }

    #[test]
    fn test_nesting_limit_covers_context_reentry() {
        // A schema-defined node that recurses through nbtLoop
        let schema = parse_schema(
            r#"{
                "nbt": ["container", [{ "name": "t", "type": "u8" }, { "name": "c", "type": "nbtLoop" }]],
                "tree": "nbtLoop"
            }"#,
        )
        .unwrap();
        let set = compile(&schema, &ExtensionRegistry::default()).unwrap();

        let hostile = vec![1u8; 200_000];
        assert!(matches!(
            set.read("tree", &hostile, 0),
            Err(ProtocolError::Malformed(ref m)) if m == constants::ERR_NESTING_TOO_DEEP
        ));

        let shallow = self_nesting_tree(8);
        roundtrip(&set, "tree", &shallow);

        let deep = self_nesting_tree(200);
        assert!(matches!(set.size_of("tree", &deep), Err(ProtocolError::InvalidValue(_))));
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            set.write("tree", &deep, &mut buf, 0),
            Err(ProtocolError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unknown_type_at_call_time() {
        let set = build(r#"{ "a": "u8" }"#);
        assert!(matches!(set.read("b", &[0], 0), Err(ProtocolError::UnknownType(_))));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let json = r#"{ "z": "u8", "a": ["array", { "countType": "u8", "type": "z" }], "m": "uuid" }"#;
        let first = build(json);
        let second = build(json);
        assert_eq!(first.names().collect::<Vec<_>>(), second.names().collect::<Vec<_>>());
        let v: Value = [Value::UInt(1), Value::UInt(2)].into_iter().collect();
        assert_eq!(first.serialize("a", &v).unwrap(), second.serialize("a", &v).unwrap());
    }
}
