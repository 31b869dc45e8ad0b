//! # Secure Sessions
//!
//! Joins a [`Protocol`](crate::protocol::Protocol) and a frame pipeline over a
//! message transport supplied by the caller.

pub mod secure;

pub use secure::{SecureConnection, SecureReceiver, SecureSender};
