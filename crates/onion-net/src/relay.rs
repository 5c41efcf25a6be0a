//! Secure message relay
//!
//! After the handshake every frame is a UTF-8 message encrypted under the
//! connection's session key. A message equal to `quit` (any case) ends the
//! session instead of being delivered.

use bytes::Bytes;
use onion_core::protocol::is_quit;
use onion_core::SessionKey;
use std::string::FromUtf8Error;
use thiserror::Error;
use tracing::debug;

/// Relay errors. A frame that fails to open cannot be recovered.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Decryption failed: {0}")]
    Decryption(#[source] onion_core::Error),
    #[error("Encryption failed: {0}")]
    Encryption(#[source] onion_core::Error),
    #[error("Message is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
}

/// Decoded inbound relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Application message
    Message(String),
    /// Peer asked to end the session
    Quit,
}

/// Relay statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Session-key encrypted message relay for one connection
pub struct SecureRelay {
    session_key: SessionKey,
    stats: RelayStats,
}

impl SecureRelay {
    pub fn new(session_key: SessionKey) -> Self {
        Self {
            session_key,
            stats: RelayStats::default(),
        }
    }

    /// Open an inbound frame
    pub fn on_inbound_frame(&mut self, frame: &[u8]) -> Result<RelayEvent, RelayError> {
        let plaintext = self
            .session_key
            .decrypt(frame)
            .map_err(RelayError::Decryption)?;
        let text = String::from_utf8(plaintext)?;

        if is_quit(&text) {
            debug!("Received quit");
            return Ok(RelayEvent::Quit);
        }

        self.stats.messages_received += 1;
        self.stats.bytes_received += text.len() as u64;
        Ok(RelayEvent::Message(text))
    }

    /// Encrypt an outbound message into a frame payload
    pub fn seal(&mut self, message: &str) -> Result<Bytes, RelayError> {
        let ciphertext = self
            .session_key
            .encrypt(message.as_bytes())
            .map_err(RelayError::Encryption)?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += message.len() as u64;
        Ok(Bytes::from(ciphertext))
    }

    /// Get relay statistics
    pub fn stats(&self) -> RelayStats {
        self.stats.clone()
    }
}
