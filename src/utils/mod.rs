//! # Utility Modules
//!
//! Supporting pieces for the frame pipeline and the session wrapper.
//!
//! ## Components
//! - **Crypto**: AES-256-CFB8 with library and software backends
//! - **Compression**: Bounded raw deflate
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers
//! - **Metrics**: Thread-safe observability counters

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crypto::{Cfb8, CipherBackend};
