//! Onion Node Core Library
//!
//! This crate provides the I/O-free building blocks of the onion node secure
//! channel: the asymmetric node key pair, the symmetric session key, and the
//! wire-level protocol vocabulary shared by nodes and clients.
//!
//! # Modules
//!
//! - [`crypto`]: RSA node key pair and AES session key
//! - [`protocol`]: Sentinels, frame classification, connection state
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod protocol;

pub use crypto::{NodeKeyPair, SessionKey};
pub use error::{Error, Result};
pub use protocol::{AckMode, ConnectionState, InboundFrame};
