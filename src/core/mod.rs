//! # Secure Frame Pipeline
//!
//! Compression, checksum and stream cipher applied to every packet on the wire.
//!
//! ## Wire Format
//! ```text
//! AES-256-CFB8( deflate(packet) ‖ sha256(le64(counter) ‖ deflate(packet) ‖ key)[..8] )
//! ```
//!
//! There is no length or counter field: frame boundaries come from the transport,
//! and the counter is implied by frame order.

pub mod checksum;
pub mod frame;

pub use frame::{FrameDecryptor, FrameEncryptor, FramePipeline, SecretMaterial};
