//! # Protocol Versions
//!
//! A [`Protocol`] is one compiled protocol version: its codec set and its packet
//! envelope. It is immutable after loading and is meant to be shared through an
//! `Arc` by every connection speaking that version.
//!
//! ```rust
//! use bedrock_wire::codec::{ExtensionRegistry, Value};
//! use bedrock_wire::protocol::Protocol;
//!
//! let protocol = Protocol::from_json(
//!     r#"{
//!         "version": 431,
//!         "envelope": { "packets": { "0x0a": "set_time" } },
//!         "types": {
//!             "packet_set_time": ["container", [{ "name": "time", "type": "zigzag32" }]]
//!         }
//!     }"#,
//!     &ExtensionRegistry::default(),
//! )
//! .unwrap();
//!
//! let params = Value::map([("time", Value::Int(5433771))]);
//! let bytes = protocol.encode("set_time", &params).unwrap();
//! assert_eq!(bytes, [0x0a, 0xd6, 0xa6, 0x97, 0x05]);
//! assert_eq!(protocol.decode(&bytes).unwrap().params, params);
//! ```

pub mod batch;
pub mod envelope;


pub use batch::{decode_batch, encode_batch};
pub use envelope::{Envelope, EnvelopeCodec, Packet};

use crate::codec::{compile_with, CodecSet, ExtensionRegistry, ProtocolDef, Value};
use crate::config::{CodecConfig, MIN_PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::{global_metrics, Timer};
use std::path::Path;
use tracing::{info, instrument, warn};

/// One compiled protocol version
#[derive(Debug, Clone)]
pub struct Protocol {
    version: u32,
    codecs: CodecSet,
    envelope: Envelope,
    verify_roundtrip: bool,
}

impl Protocol {
    /// Compile a parsed definition.
    ///
    /// # Errors
    /// `ProtocolError::Schema` if the version is below [`MIN_PROTOCOL_VERSION`],
    /// the schema does not compile, or the envelope is not a bijection.
    #[instrument(skip_all, fields(version = def.version))]
    pub fn from_def(
        def: &ProtocolDef,
        registry: &ExtensionRegistry,
        config: &CodecConfig,
    ) -> Result<Self> {
        if def.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::Schema(format!(
                "protocol version {} is older than the supported minimum {MIN_PROTOCOL_VERSION}",
                def.version
            )));
        }
        let _timer = Timer::start("protocol_compile");
        let codecs = compile_with(&def.types, registry, config)?;
        let envelope = Envelope::new(&def.envelope, &codecs)?;
        info!(packets = envelope.len(), "Protocol loaded");
        Ok(Self {
            version: def.version,
            codecs,
            envelope,
            verify_roundtrip: config.verify_roundtrip,
        })
    }

    /// Compile a JSON definition with the default codec limits.
    pub fn from_json(json: &str, registry: &ExtensionRegistry) -> Result<Self> {
        Self::from_json_with(json, registry, &CodecConfig::default())
    }

    pub fn from_json_with(
        json: &str,
        registry: &ExtensionRegistry,
        config: &CodecConfig,
    ) -> Result<Self> {
        Self::from_def(&ProtocolDef::from_json(json)?, registry, config)
    }

    /// Load a JSON definition from disk with the builtin extensions.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = CodecConfig::default();
        let registry = ExtensionRegistry::builtin(&config);
        Self::from_def(&ProtocolDef::from_file(path)?, &registry, &config)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn codecs(&self) -> &CodecSet {
        &self.codecs
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn id_of(&self, name: &str) -> Option<u64> {
        self.envelope.id_of(name)
    }

    pub fn name_of(&self, id: u64) -> Option<&str> {
        self.envelope.name_of(id)
    }

    /// Encode packet `name` with `params`.
    pub fn encode(&self, name: &str, params: &Value) -> Result<Vec<u8>> {
        let bytes = self.envelope.encode(&self.codecs, name, params)?;
        global_metrics().packet_encoded();
        Ok(bytes)
    }

    pub fn encode_packet(&self, packet: &Packet) -> Result<Vec<u8>> {
        self.encode(&packet.name, &packet.params)
    }

    /// Decode one packet occupying the whole of `bytes`.
    ///
    /// Trailing bytes after the body are logged and ignored.
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        let (packet, consumed) = self.decode_prefix(bytes)?;
        if consumed < bytes.len() {
            warn!(
                packet = %packet.name,
                trailing = bytes.len() - consumed,
                "Trailing bytes after packet body"
            );
        }
        if self.verify_roundtrip {
            self.check_roundtrip(&packet, &bytes[..consumed])?;
        }
        Ok(packet)
    }

    /// Decode the packet at the front of `bytes`, returning the bytes it used.
    pub fn decode_prefix(&self, bytes: &[u8]) -> Result<(Packet, usize)> {
        match self.envelope.decode(&self.codecs, bytes) {
            Ok(decoded) => {
                global_metrics().packet_decoded();
                Ok(decoded)
            }
            Err(e) => {
                if !e.is_incomplete() {
                    global_metrics().decode_error();
                }
                Err(e)
            }
        }
    }

    /// Decode `bytes`, re-encode the result and require identical output.
    ///
    /// # Errors
    /// `ProtocolError::RoundTripMismatch` when the bytes differ.
    pub fn verify_roundtrip(&self, bytes: &[u8]) -> Result<Packet> {
        let (packet, consumed) = self.decode_prefix(bytes)?;
        self.check_roundtrip(&packet, &bytes[..consumed])?;
        Ok(packet)
    }

    fn check_roundtrip(&self, packet: &Packet, original: &[u8]) -> Result<()> {
        let reencoded = self.envelope.encode(&self.codecs, &packet.name, &packet.params)?;
        if reencoded != original {
            warn!(packet = %packet.name, "Re-encoded packet differs from received bytes");
            return Err(ProtocolError::RoundTripMismatch {
                name: packet.name.clone(),
            });
        }
        Ok(())
    }
}
