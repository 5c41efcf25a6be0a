//! Cryptographic primitives for the secure channel
//!
//! The node holds an RSA key pair; each connection gets an AES session key
//! delivered under RSA PKCS#1 v1.5. Session traffic is AES in ECB mode with
//! PKCS#7 padding, which is what peers speaking this protocol expect.

use crate::error::{Error, Result};
use ecb::cipher::{
    block_padding::Pkcs7, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::fmt;

/// Default RSA modulus size for node key pairs
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Default session key size (AES-128)
pub const DEFAULT_SESSION_KEY_BITS: usize = 128;

/// AES key lengths accepted for a session key, in bytes
pub const SESSION_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// RSA key pair identifying a node for the lifetime of one run
#[derive(Clone)]
pub struct NodeKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    /// DER SubjectPublicKeyInfo, served verbatim to clients
    public_der: Vec<u8>,
}

impl NodeKeyPair {
    /// Generate a fresh key pair with the given modulus size
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Build a key pair around an existing private key
    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_der = encode_public_key(&public_key)?;
        Ok(Self {
            private_key,
            public_key,
            public_der,
        })
    }

    /// Get the public key
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// DER-encoded public key as sent on the wire
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// DER-encoded PKCS#8 private key
    pub fn private_key_der(&self) -> Result<Vec<u8>> {
        let document = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| Error::KeyEncode(e.to_string()))?;
        Ok(document.as_bytes().to_vec())
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// Length of every RSA ciphertext addressed to this node
    pub fn ciphertext_len(&self) -> usize {
        self.public_key.size()
    }

    /// Short printable fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_der)
    }

    /// Decrypt an RSA PKCS#1 v1.5 ciphertext addressed to this node
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| Error::Decryption)
    }
}

impl fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("bits", &self.bits())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Encode a public key as DER SubjectPublicKeyInfo
pub fn encode_public_key(public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    let document = public_key
        .to_public_key_der()
        .map_err(|e| Error::KeyEncode(e.to_string()))?;
    Ok(document.as_bytes().to_vec())
}

/// Decode a DER SubjectPublicKeyInfo public key
pub fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| Error::KeyDecode(e.to_string()))
}

/// RSA PKCS#1 v1.5 encrypt to a node's public key
pub fn encrypt_to(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))
}

/// BLAKE3 fingerprint (first 8 bytes, hex) of encoded key material
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(&blake3::hash(der).as_bytes()[..8])
}

/// Symmetric key for one connection
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    bytes: Vec<u8>,
}

impl SessionKey {
    /// Wrap raw key bytes, rejecting lengths AES does not support
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if !SESSION_KEY_LENGTHS.contains(&bytes.len()) {
            return Err(Error::InvalidSessionKeyLength(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// Generate a random key of the given size (128, 192 or 256 bits)
    pub fn generate(bits: usize) -> Result<Self> {
        if bits % 8 != 0 || !SESSION_KEY_LENGTHS.contains(&(bits / 8)) {
            return Err(Error::InvalidSessionKeyLength(bits / 8));
        }
        let mut bytes = vec![0u8; bits / 8];
        OsRng.fill_bytes(&mut bytes);
        Ok(Self { bytes })
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key size in bits
    pub fn bits(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Encrypt with AES-ECB/PKCS#7
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.bytes.len() {
            16 => ecb_encrypt::<aes::Aes128>(&self.bytes, plaintext),
            24 => ecb_encrypt::<aes::Aes192>(&self.bytes, plaintext),
            _ => ecb_encrypt::<aes::Aes256>(&self.bytes, plaintext),
        }
    }

    /// Decrypt with AES-ECB/PKCS#7, validating the padding
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.bytes.len() {
            16 => ecb_decrypt::<aes::Aes128>(&self.bytes, ciphertext),
            24 => ecb_decrypt::<aes::Aes192>(&self.bytes, ciphertext),
            _ => ecb_decrypt::<aes::Aes256>(&self.bytes, ciphertext),
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({} bits)", self.bits())
    }
}

fn ecb_encrypt<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut,
    ecb::Encryptor<C>: KeyInit + BlockEncryptMut,
{
    let cipher = ecb::Encryptor::<C>::new_from_slice(key)
        .map_err(|_| Error::InvalidSessionKeyLength(key.len()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn ecb_decrypt<C>(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut,
    ecb::Decryptor<C>: KeyInit + BlockDecryptMut,
{
    let cipher = ecb::Decryptor::<C>::new_from_slice(key)
        .map_err(|_| Error::InvalidSessionKeyLength(key.len()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption)
}
