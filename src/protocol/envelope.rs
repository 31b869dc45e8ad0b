//! Packet envelope: `[packet id] [body]`.
//!
//! The id width comes from the protocol definition (`idType`, `varint` unless
//! stated otherwise). Ids and names form a bijection checked when the envelope
//! is built; each packet `name` has its body under the schema type `packet_<name>`.

use crate::codec::{CodecSet, Primitive, TypeId, Value};
use crate::codec::primitives::IntFormat;
use crate::codec::schema::{parse_int_key, EnvelopeDef};
use crate::error::{ProtocolError, Result};
use crate::protocol::Protocol;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Prefix of the schema type holding a packet's body
pub const BODY_PREFIX: &str = "packet_";

/// One decoded or to-be-encoded packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub name: String,
    pub params: Value,
}

impl Packet {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum IdCodec {
    Primitive(Primitive),
    Schema(TypeId),
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    body: TypeId,
}

/// Id ↔ name table plus the body codec of every packet
#[derive(Debug, Clone)]
pub struct Envelope {
    id_codec: IdCodec,
    by_id: HashMap<u64, Entry>,
    by_name: HashMap<String, u64>,
}

impl Envelope {
    /// Resolve `def` against a compiled schema.
    ///
    /// # Errors
    /// `ProtocolError::Schema` on a non-integer id type, an unparseable or
    /// duplicate id, a duplicate name, or a packet without a body type.
    pub fn new(def: &EnvelopeDef, set: &CodecSet) -> Result<Self> {
        let unsigned = |f: IntFormat| !f.signed;
        let id_codec = match set.id(&def.id_type) {
            Some(id) if set.int_format_of(id).is_some_and(unsigned) => Some(IdCodec::Schema(id)),
            Some(_) => None,
            None => Primitive::from_name(&def.id_type)
                .filter(|p| p.int_format().is_some_and(unsigned))
                .map(IdCodec::Primitive),
        }
        .ok_or_else(|| {
            ProtocolError::Schema(format!(
                "packet id type `{}` is not an unsigned integer type",
                def.id_type
            ))
        })?;

        let mut by_id = HashMap::with_capacity(def.packets.len());
        let mut by_name = HashMap::with_capacity(def.packets.len());
        for (key, name) in &def.packets {
            let id = parse_int_key(key)
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| ProtocolError::Schema(format!("invalid packet id `{key}`")))?;
            let body_name = format!("{BODY_PREFIX}{name}");
            let body = set.id(&body_name).ok_or_else(|| {
                ProtocolError::Schema(format!("packet `{name}` has no body type `{body_name}`"))
            })?;
            if by_name.insert(name.clone(), id).is_some() {
                return Err(ProtocolError::Schema(format!(
                    "packet name `{name}` is mapped to more than one id"
                )));
            }
            let entry = Entry {
                name: name.clone(),
                body,
            };
            if by_id.insert(id, entry).is_some() {
                return Err(ProtocolError::Schema(format!(
                    "packet id {id} is mapped to more than one name"
                )));
            }
        }

        Ok(Self {
            id_codec,
            by_id,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(|e| e.name.as_str())
    }

    /// Packet names in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Decode one packet from the front of `buf`, returning it with the bytes consumed.
    ///
    /// # Errors
    /// `Truncated` if `buf` ends early, `UnknownPacketId` on an unmapped id, or
    /// whatever the body codec reports.
    pub fn decode(&self, set: &CodecSet, buf: &[u8]) -> Result<(Packet, usize)> {
        let (id, id_len) = self.read_id(set, buf)?;
        let entry = self
            .by_id
            .get(&id)
            .ok_or(ProtocolError::UnknownPacketId(id))?;
        let (params, body_len) = set.read_id(entry.body, buf, id_len)?;
        Ok((Packet::new(entry.name.clone(), params), id_len + body_len))
    }

    /// Encode `params` as packet `name`.
    ///
    /// # Errors
    /// `UnknownPacketName` if `name` is not in the table, or whatever the body
    /// codec reports for `params`.
    pub fn encode(&self, set: &CodecSet, name: &str, params: &Value) -> Result<Vec<u8>> {
        let id = self
            .id_of(name)
            .ok_or_else(|| ProtocolError::UnknownPacketName(name.to_string()))?;
        let body = self.by_id[&id].body;
        let id_value = Value::UInt(id);
        let id_len = self.size_of_id(set, &id_value)?;
        let mut buf = vec![0u8; id_len + set.size_of_id(body, params)?];
        let offset = self.write_id(set, &id_value, &mut buf)?;
        let end = set.write_id(body, params, &mut buf, offset)?;
        buf.truncate(end);
        Ok(buf)
    }

    fn read_id(&self, set: &CodecSet, buf: &[u8]) -> Result<(u64, usize)> {
        let (value, len) = match self.id_codec {
            IdCodec::Primitive(p) => p.read(buf, 0)?,
            IdCodec::Schema(id) => set.read_id(id, buf, 0)?,
        };
        let id = value.as_u64().ok_or_else(|| {
            ProtocolError::Malformed(format!("packet id decoded as {}", value.kind()))
        })?;
        Ok((id, len))
    }

    fn write_id(&self, set: &CodecSet, id: &Value, buf: &mut [u8]) -> Result<usize> {
        match self.id_codec {
            IdCodec::Primitive(p) => p.write(id, buf, 0),
            IdCodec::Schema(type_id) => set.write_id(type_id, id, buf, 0),
        }
    }

    fn size_of_id(&self, set: &CodecSet, id: &Value) -> Result<usize> {
        match self.id_codec {
            IdCodec::Primitive(p) => p.size_of(id),
            IdCodec::Schema(type_id) => set.size_of_id(type_id, id),
        }
    }
}

/// `tokio_util` codec reading and writing back-to-back packets.
///
/// A packet cut short leaves the buffer untouched and waits for more bytes.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    protocol: Arc<Protocol>,
}

impl EnvelopeCodec {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.protocol.decode_prefix(&src[..]) {
            Ok((packet, consumed)) => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Packet> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let bytes = self.protocol.encode(&item.name, &item.params)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
