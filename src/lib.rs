//! # bedrock-wire
//!
//! Wire layer for the Bedrock game protocol: schema-compiled packet codecs and a
//! secure frame pipeline.
//!
//! ## Layers
//! - **codec**: compiles a declarative type schema into `read` / `write` / `size_of` codecs
//! - **protocol**: one compiled protocol version, its packet envelope and batching
//! - **core**: deflate, truncated SHA-256 checksum and AES-256-CFB8 per frame
//! - **service**: a packet session over any ordered message transport
//!
//! ## Guarantees
//! - A compiled [`Protocol`] is immutable and shared by every connection of that version
//! - Frame counters are never sent; a dropped, replayed or reordered frame fails its checksum
//! - An integrity failure poisons the receive pipeline for good
//!
//! ## Quick Start
//! ```rust,no_run
//! use bedrock_wire::{Packet, Protocol, SecretMaterial, SecureConnection, Value, WireConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//! use tokio_util::codec::{Framed, LengthDelimitedCodec};
//!
//! # async fn run(key: [u8; 32], iv: [u8; 16]) -> bedrock_wire::Result<()> {
//! let protocol = Arc::new(Protocol::from_file("protocol.json")?);
//! let stream = TcpStream::connect("127.0.0.1:19132").await?;
//! let transport = Framed::new(stream, LengthDelimitedCodec::new());
//!
//! let mut conn = SecureConnection::new(
//!     transport,
//!     protocol,
//!     SecretMaterial::new(key, iv),
//!     &WireConfig::default(),
//! )?;
//! conn.send("set_time", &Value::map([("time", Value::Int(6000))])).await?;
//! let Packet { name, params } = conn.recv().await?;
//! # let _ = (name, params);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use codec::{compile, CodecSet, Value};
pub use config::WireConfig;
pub use core::frame::{FramePipeline, SecretMaterial};
pub use error::{ProtocolError, Result};
pub use protocol::{Packet, Protocol};
pub use service::SecureConnection;
