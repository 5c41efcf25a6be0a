//! Wire-level protocol vocabulary
//!
//! Frames carry no type tag: a pre-session frame is either the literal
//! public-key request or an RSA-encrypted session key, and every frame after
//! the session key is AES ciphertext. [`InboundFrame::classify`] turns that
//! content sniffing into a tagged value so callers never branch on raw bytes.

use std::fmt;

/// Literal payload asking a node for its public key
pub const PUBLIC_KEY_REQUEST: &[u8] = b"GivePK!!!";

/// Plaintext that ends a session, compared case-insensitively
pub const QUIT_COMMAND: &str = "quit";

/// Returns true if a decrypted message is the session-termination sentinel
pub fn is_quit(message: &str) -> bool {
    message.eq_ignore_ascii_case(QUIT_COMMAND)
}

/// Acknowledgement text a node sends after accepting a session key
pub fn session_ack_text(node_label: &str) -> String {
    format!("Secret key set at server {}", node_label)
}

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing received yet
    AwaitingRequest,
    /// Public key served at least once; waiting for the session key
    AwaitingSessionKey,
    /// Session key installed; all frames are relay traffic
    Established,
    /// Terminated by quit, peer close, or a fatal error
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingRequest => "awaiting-request",
            Self::AwaitingSessionKey => "awaiting-session-key",
            Self::Established => "established",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tagged view of an inbound frame payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    /// Public key request sentinel
    KeyRequest,
    /// RSA-encrypted session key
    KeyDelivery(&'a [u8]),
    /// Session-key-encrypted relay message
    Application(&'a [u8]),
}

impl<'a> InboundFrame<'a> {
    /// Classify a payload given the connection state it arrived in.
    ///
    /// Once established, even a payload equal to the request sentinel is
    /// relay ciphertext.
    pub fn classify(payload: &'a [u8], state: ConnectionState) -> Self {
        match state {
            ConnectionState::Established | ConnectionState::Closed => Self::Application(payload),
            _ if payload == PUBLIC_KEY_REQUEST => Self::KeyRequest,
            _ => Self::KeyDelivery(payload),
        }
    }
}

/// How a node answers an accepted session key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// No reply (baseline node)
    #[default]
    Silent,
    /// Reply with [`session_ack_text`] encrypted under the new session key
    Encrypted,
}
