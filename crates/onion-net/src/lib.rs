//! Networking primitives for the onion node secure channel
//!
//! This crate provides:
//! - Length-prefixed framing over any async byte stream
//! - Node key storage
//! - The public-key / session-key handshake state machine
//! - The session-key encrypted message relay
//! - A per-connection session driver and a dialing client

pub mod channel;
pub mod client;
pub mod framing;
pub mod handshake;
pub mod keystore;
pub mod relay;
pub mod session;
pub mod source;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelConfig, FramedChannel};
pub use client::{Client, ClientError};
pub use framing::{FrameCodec, FrameError};
pub use handshake::{HandshakeConfig, HandshakeEngine, HandshakeError, HandshakeStep};
pub use keystore::{FsKeyStore, KeyStore, KeyStoreError, MemoryKeyStore, NodeIdentity};
pub use relay::{RelayError, RelayEvent, RelayStats, SecureRelay};
pub use session::{Session, SessionError, SessionOutcome};
pub use source::{FixedReply, LogSink, MessageSink, MessageSource, NoReply, ScriptedSource};
