//! # Schema Definitions
//!
//! The JSON vocabulary consumed by the compiler.
//!
//! A type definition is a bare name (`"varint"`, another schema type, an extension),
//! the literal `"native"`, or a `[kind, params]` pair such as
//! `["array", { "countType": "varint", "type": "string" }]`.
//!
//! A protocol definition bundles a schema with its packet envelope:
//!
//! ```json
//! {
//!   "version": 431,
//!   "envelope": { "idType": "varint", "packets": { "0x0a": "set_time" } },
//!   "types": { "packet_set_time": ["container", [{ "name": "time", "type": "zigzag32" }]] }
//! }
//! ```

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Type name → definition
pub type Schema = BTreeMap<String, TypeDef>;

/// Marker for names implemented by a primitive or a registered extension
pub const NATIVE: &str = "native";

/// One type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeDef {
    /// Reference by name, or `"native"`
    Name(String),
    /// `[kind, params]`
    Parametrized(String, serde_json::Value),
}

impl TypeDef {
    pub fn name(name: impl Into<String>) -> Self {
        TypeDef::Name(name.into())
    }

    /// Kind of a parametrized definition, or the referenced name.
    pub fn head(&self) -> &str {
        match self {
            TypeDef::Name(name) | TypeDef::Parametrized(name, _) => name,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, TypeDef::Name(name) if name == NATIVE)
    }
}

/// A container field: `{ "name": "x", "type": ... }` or `{ "anon": true, "type": ... }`
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub anon: bool,
    #[serde(rename = "type")]
    pub ty: TypeDef,
}

/// Where a collection length comes from: a literal or a sibling field path
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CountDef {
    Fixed(u64),
    Field(String),
}

/// Parameters shared by `array`, `pstring` and `buffer`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountedParams {
    #[serde(rename = "type", default)]
    pub ty: Option<TypeDef>,
    #[serde(default)]
    pub count_type: Option<TypeDef>,
    #[serde(default)]
    pub count: Option<CountDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchParams {
    pub compare_to: String,
    #[serde(default)]
    pub fields: BTreeMap<String, TypeDef>,
    #[serde(default)]
    pub default: Option<TypeDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapperParams {
    #[serde(rename = "type")]
    pub ty: TypeDef,
    pub mappings: BTreeMap<String, String>,
}

/// Flag names as sequential bits, or as a name → mask (or bit position) table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlagsDef {
    List(Vec<String>),
    Table(BTreeMap<String, u64>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitflagsParams {
    #[serde(rename = "type")]
    pub ty: String,
    pub flags: FlagsDef,
    /// Table values are bit positions rather than masks
    #[serde(default)]
    pub shift: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumWidthParams {
    #[serde(default = "default_count_field")]
    pub count_field: String,
}

impl Default for EnumWidthParams {
    fn default() -> Self {
        Self {
            count_field: default_count_field(),
        }
    }
}

fn default_count_field() -> String {
    "values_len".to_string()
}

/// Packet id ↔ name table of one protocol version
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeDef {
    #[serde(default = "default_id_type")]
    pub id_type: String,
    /// Packet id (decimal or `0x` hex) → packet name
    pub packets: BTreeMap<String, String>,
}

fn default_id_type() -> String {
    "varint".to_string()
}

/// A complete protocol definition
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolDef {
    pub version: u32,
    pub envelope: EnvelopeDef,
    pub types: Schema,
}

impl ProtocolDef {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ProtocolError::Schema(format!("invalid protocol definition: {e}")))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to read protocol definition {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&json)
    }
}

/// Parse a bare `types` mapping.
pub fn parse_schema(json: &str) -> Result<Schema> {
    serde_json::from_str(json).map_err(|e| ProtocolError::Schema(format!("invalid schema: {e}")))
}

/// Parse a mapping or case key written in decimal or `0x` hex.
pub fn parse_int_key(key: &str) -> Option<i128> {
    let key = key.trim();
    let (negative, digits) = match key.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, key),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Canonical form of a case key: integers in decimal, anything else verbatim.
pub(crate) fn normalize_key(key: &str) -> String {
    parse_int_key(key).map_or_else(|| key.to_string(), |v| v.to_string())
}

/// Deserialize kind parameters, reporting the kind on failure.
pub(crate) fn params<T: serde::de::DeserializeOwned>(
    kind: &str,
    params: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| ProtocolError::Schema(format!("invalid `{kind}` parameters: {e}")))
}
