//! Handshake state machine
//!
//! Drives one connection from its first frame to an installed session key:
//! the public key is served on request (any number of times), and the first
//! other frame is taken as the RSA-encrypted session key. The engine does no
//! I/O; it returns what should be written back.

use bytes::Bytes;
use onion_core::protocol::{session_ack_text, AckMode, ConnectionState, InboundFrame};
use onion_core::{NodeKeyPair, SessionKey};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Handshake errors. All of them close the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unexpected frame before session key: {0}")]
    UnexpectedFrame(&'static str),
    #[error("Session key decryption failed: {0}")]
    KeyDecryption(#[source] onion_core::Error),
    #[error("Invalid session key: {0}")]
    InvalidSessionKey(#[source] onion_core::Error),
    #[error("Acknowledgement encryption failed: {0}")]
    Acknowledgement(#[source] onion_core::Error),
    #[error("Handshake already complete")]
    AlreadyEstablished,
    #[error("Connection closed")]
    Closed,
}

/// Handshake settings
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Reply sent after a session key is accepted
    pub ack_mode: AckMode,
    /// How the node names itself in acknowledgements (`ip:port`)
    pub node_label: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Silent,
            node_label: "unknown".to_string(),
        }
    }
}

/// Result of feeding one frame to the engine
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this frame back and keep handshaking
    Reply(Bytes),
    /// Session key installed; send `reply` if present
    Established {
        session_key: SessionKey,
        reply: Option<Bytes>,
    },
}

/// Per-connection handshake state machine
pub struct HandshakeEngine {
    keypair: Arc<NodeKeyPair>,
    config: HandshakeConfig,
    state: ConnectionState,
    key_requests: u32,
}

impl HandshakeEngine {
    /// Create an engine for a freshly accepted connection
    pub fn new(keypair: Arc<NodeKeyPair>, config: HandshakeConfig) -> Self {
        Self {
            keypair,
            config,
            state: ConnectionState::AwaitingRequest,
            key_requests: 0,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of public key requests served
    pub fn key_requests(&self) -> u32 {
        self.key_requests
    }

    /// Mark the connection closed
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Process one inbound frame
    pub fn on_frame(&mut self, payload: &[u8]) -> Result<HandshakeStep, HandshakeError> {
        match self.state {
            ConnectionState::Established => return Err(HandshakeError::AlreadyEstablished),
            ConnectionState::Closed => return Err(HandshakeError::Closed),
            _ => {}
        }

        match InboundFrame::classify(payload, self.state) {
            InboundFrame::KeyRequest => {
                self.key_requests += 1;
                self.state = ConnectionState::AwaitingSessionKey;
                debug!(
                    requests = self.key_requests,
                    "Serving public key {}",
                    self.keypair.fingerprint()
                );
                Ok(HandshakeStep::Reply(Bytes::copy_from_slice(
                    self.keypair.public_key_der(),
                )))
            }
            InboundFrame::KeyDelivery(ciphertext) => self.accept_session_key(ciphertext),
            InboundFrame::Application(_) => Err(HandshakeError::AlreadyEstablished),
        }
    }

    fn accept_session_key(&mut self, ciphertext: &[u8]) -> Result<HandshakeStep, HandshakeError> {
        if ciphertext.is_empty() {
            return Err(self.fail(HandshakeError::UnexpectedFrame("empty payload")));
        }
        if ciphertext.len() != self.keypair.ciphertext_len() {
            debug!(
                length = ciphertext.len(),
                expected = self.keypair.ciphertext_len(),
                "Pre-session frame is neither a key request nor an RSA ciphertext"
            );
            return Err(self.fail(HandshakeError::UnexpectedFrame(
                "payload length does not match RSA modulus",
            )));
        }
        if self.state == ConnectionState::AwaitingRequest {
            // No type tag on the wire: without a prior key request this
            // frame could be anything, so treat it as a key and say so.
            debug!(
                length = ciphertext.len(),
                "Frame arrived before any public key request; treating as session key"
            );
        }

        let raw_key = match self.keypair.decrypt(ciphertext) {
            Ok(raw_key) => raw_key,
            Err(e) => return Err(self.fail(HandshakeError::KeyDecryption(e))),
        };
        let session_key = match SessionKey::from_bytes(raw_key) {
            Ok(session_key) => session_key,
            Err(e) => return Err(self.fail(HandshakeError::InvalidSessionKey(e))),
        };

        let reply = match self.config.ack_mode {
            AckMode::Silent => None,
            AckMode::Encrypted => {
                let text = session_ack_text(&self.config.node_label);
                match session_key.encrypt(text.as_bytes()) {
                    Ok(ciphertext) => Some(Bytes::from(ciphertext)),
                    Err(e) => return Err(self.fail(HandshakeError::Acknowledgement(e))),
                }
            }
        };

        self.state = ConnectionState::Established;
        info!("Secret key received ({} bits)", session_key.bits());

        Ok(HandshakeStep::Established { session_key, reply })
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        self.state = ConnectionState::Closed;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_keypair;
    use onion_core::crypto::{decode_public_key, encrypt_to};

    fn engine(ack_mode: AckMode) -> HandshakeEngine {
        HandshakeEngine::new(
            test_keypair(),
            HandshakeConfig {
                ack_mode,
                node_label: "127.0.0.1:9000".to_string(),
            },
        )
    }

    fn deliver(engine: &mut HandshakeEngine, key: &SessionKey) -> HandshakeStep {
        let public_key = decode_public_key(test_keypair().public_key_der()).unwrap();
        let ciphertext = encrypt_to(&public_key, key.as_bytes()).unwrap();
        engine.on_frame(&ciphertext).unwrap()
    }

    #[test]
    fn test_key_request_is_idempotent() {
        let mut engine = engine(AckMode::Silent);
        assert_eq!(engine.state(), ConnectionState::AwaitingRequest);

        let mut replies = Vec::new();
        for _ in 0..3 {
            match engine.on_frame(b"GivePK!!!").unwrap() {
                HandshakeStep::Reply(der) => replies.push(der),
                other => panic!("unexpected step: {:?}", other),
            }
        }

        assert_eq!(engine.state(), ConnectionState::AwaitingSessionKey);
        assert_eq!(engine.key_requests(), 3);
        assert!(replies.iter().all(|der| &der[..] == test_keypair().public_key_der()));
    }

    #[test]
    fn test_session_key_delivery() {
        let mut engine = engine(AckMode::Silent);
        engine.on_frame(b"GivePK!!!").unwrap();

        let key = SessionKey::generate(128).unwrap();
        match deliver(&mut engine, &key) {
            HandshakeStep::Established { session_key, reply } => {
                assert_eq!(session_key, key);
                assert!(reply.is_none());
            }
            other => panic!("unexpected step: {:?}", other),
        }
        assert_eq!(engine.state(), ConnectionState::Established);
    }

    #[test]
    fn test_delivery_without_request() {
        let mut engine = engine(AckMode::Silent);
        let key = SessionKey::generate(256).unwrap();
        assert!(matches!(
            deliver(&mut engine, &key),
            HandshakeStep::Established { .. }
        ));
    }

    #[test]
    fn test_encrypted_ack() {
        let mut engine = engine(AckMode::Encrypted);
        let key = SessionKey::generate(128).unwrap();

        match deliver(&mut engine, &key) {
            HandshakeStep::Established { reply: Some(reply), .. } => {
                let text = key.decrypt(&reply).unwrap();
                assert_eq!(text, b"Secret key set at server 127.0.0.1:9000");
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_application_frame_before_key_fails() {
        // An application-shaped frame (AES ciphertext) before key delivery
        // must never decode as a message.
        let mut engine = engine(AckMode::Silent);
        let key = SessionKey::generate(128).unwrap();
        let frame = key.encrypt(b"hello").unwrap();

        assert!(matches!(
            engine.on_frame(&frame),
            Err(HandshakeError::UnexpectedFrame(_))
        ));
        assert_eq!(engine.state(), ConnectionState::Closed);
        assert!(matches!(
            engine.on_frame(b"GivePK!!!"),
            Err(HandshakeError::Closed)
        ));
    }

    #[test]
    fn test_misshaped_frames_are_protocol_errors() {
        for frame in [&b"GivePK!!!\n"[..], &b"hello"[..], &[0u8; 16][..], &[0u8; 129][..]] {
            let mut engine = engine(AckMode::Silent);
            engine.on_frame(b"GivePK!!!").unwrap();
            assert!(matches!(
                engine.on_frame(frame),
                Err(HandshakeError::UnexpectedFrame(_))
            ));
            assert_eq!(engine.state(), ConnectionState::Closed);
        }
    }

    #[test]
    fn test_modulus_sized_garbage_fails_decryption() {
        let mut engine = engine(AckMode::Silent);
        let frame = vec![0u8; test_keypair().ciphertext_len()];
        assert!(matches!(
            engine.on_frame(&frame),
            Err(HandshakeError::KeyDecryption(_))
        ));
        assert_eq!(engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_empty_frame_is_protocol_error() {
        let mut engine = engine(AckMode::Silent);
        assert!(matches!(
            engine.on_frame(b""),
            Err(HandshakeError::UnexpectedFrame(_))
        ));
        assert_eq!(engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_wrong_length_key_rejected() {
        let mut engine = engine(AckMode::Silent);
        let public_key = decode_public_key(test_keypair().public_key_der()).unwrap();
        let ciphertext = encrypt_to(&public_key, b"not-an-aes-key").unwrap();

        assert!(matches!(
            engine.on_frame(&ciphertext),
            Err(HandshakeError::InvalidSessionKey(_))
        ));
    }

    #[test]
    fn test_no_second_session_key() {
        let mut engine = engine(AckMode::Silent);
        let key = SessionKey::generate(128).unwrap();
        deliver(&mut engine, &key);

        assert!(matches!(
            engine.on_frame(b"GivePK!!!"),
            Err(HandshakeError::AlreadyEstablished)
        ));
        assert_eq!(engine.state(), ConnectionState::Established);
    }
}
