//! Error types for the onion node core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cryptographic error types
#[derive(Debug, Error)]
pub enum Error {
    /// The RSA primitive could not produce a key pair
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Key material could not be DER-encoded
    #[error("key encoding failed: {0}")]
    KeyEncode(String),

    /// Key material could not be decoded
    #[error("key decoding failed: {0}")]
    KeyDecode(String),

    /// Session key has a length AES does not accept
    #[error("invalid session key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidSessionKeyLength(usize),

    /// Asymmetric encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Asymmetric decryption or symmetric unpadding failed
    #[error("decryption failed")]
    Decryption,
}
