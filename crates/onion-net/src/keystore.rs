//! Node key storage
//!
//! A node's RSA key pair is generated at startup, persisted under a location
//! derived from its identity (the listening port), loaded back, and purged
//! when the node exits. Concurrent `persist` calls for one identity must be
//! serialised by the caller.

use onion_core::crypto::{self, NodeKeyPair, DEFAULT_RSA_BITS};
use parking_lot::RwLock;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File holding the DER SubjectPublicKeyInfo
pub const PUBLIC_KEY_FILE: &str = "rsa_pub.pub";

/// File holding the DER PKCS#8 private key
pub const PRIVATE_KEY_FILE: &str = "rsa_pvt.key";

/// Key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[source] onion_core::Error),
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No key material for node {0}")]
    KeyNotFound(NodeIdentity),
    #[error("Key encode failed for node {identity}: {source}")]
    KeyEncode {
        identity: NodeIdentity,
        #[source]
        source: onion_core::Error,
    },
    #[error("Key decode failed for node {identity}: {source}")]
    KeyDecode {
        identity: NodeIdentity,
        #[source]
        source: onion_core::Error,
    },
}

/// Identity a key pair is stored under (the node's listening port)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeIdentity(pub u16);

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for NodeIdentity {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

/// Storage for node key pairs
pub trait KeyStore: Send + Sync {
    /// RSA modulus size used by [`KeyStore::generate`]
    fn key_bits(&self) -> usize {
        DEFAULT_RSA_BITS
    }

    /// Create a fresh key pair for `identity`
    fn generate(&self, identity: NodeIdentity) -> Result<NodeKeyPair, KeyStoreError> {
        let bits = self.key_bits();
        debug!("Generating {}-bit RSA key pair for node {}", bits, identity);
        NodeKeyPair::generate(bits).map_err(KeyStoreError::KeyGeneration)
    }

    /// Store both halves of a key pair under `identity`
    fn persist(&self, identity: NodeIdentity, keypair: &NodeKeyPair) -> Result<(), KeyStoreError>;

    /// Load the stored public key
    fn load_public(&self, identity: NodeIdentity) -> Result<RsaPublicKey, KeyStoreError>;

    /// Load the stored private key
    fn load_private(&self, identity: NodeIdentity) -> Result<RsaPrivateKey, KeyStoreError>;

    /// Erase stored key material. Best-effort: failures are logged only.
    fn purge(&self, identity: NodeIdentity);

    /// Load a complete key pair, checking that both halves match
    fn load(&self, identity: NodeIdentity) -> Result<NodeKeyPair, KeyStoreError> {
        let public_key = self.load_public(identity)?;
        let private_key = self.load_private(identity)?;
        let keypair = NodeKeyPair::from_private_key(private_key)
            .map_err(|source| KeyStoreError::KeyDecode { identity, source })?;

        if keypair.public_key() != &public_key {
            return Err(KeyStoreError::KeyDecode {
                identity,
                source: onion_core::Error::KeyDecode(
                    "public key does not match private key".to_string(),
                ),
            });
        }
        Ok(keypair)
    }

    /// Generate, persist and read back the key pair a node runs with
    fn provision(&self, identity: NodeIdentity) -> Result<NodeKeyPair, KeyStoreError> {
        let generated = self.generate(identity)?;
        self.persist(identity, &generated)?;
        let keypair = self.load(identity)?;
        info!(
            "Provisioned {}-bit key pair for node {} (fingerprint {})",
            keypair.bits(),
            identity,
            keypair.fingerprint()
        );
        Ok(keypair)
    }
}

/// Filesystem key store: `<root>/keys_<port>/{rsa_pub.pub, rsa_pvt.key}`
#[derive(Debug, Clone)]
pub struct FsKeyStore {
    root: PathBuf,
    key_bits: usize,
}

impl FsKeyStore {
    /// Store keys below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_bits: DEFAULT_RSA_BITS,
        }
    }

    /// Set the RSA modulus size for generated keys
    pub fn with_key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = key_bits;
        self
    }

    /// Directory holding the keys of `identity`
    pub fn identity_dir(&self, identity: NodeIdentity) -> PathBuf {
        self.root.join(format!("keys_{}", identity.0))
    }

    fn read_key_file(&self, identity: NodeIdentity, name: &str) -> Result<Vec<u8>, KeyStoreError> {
        let path = self.identity_dir(identity).join(name);
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => KeyStoreError::KeyNotFound(identity),
            _ => KeyStoreError::Storage { path, source },
        })
    }
}

impl KeyStore for FsKeyStore {
    fn key_bits(&self) -> usize {
        self.key_bits
    }

    fn persist(&self, identity: NodeIdentity, keypair: &NodeKeyPair) -> Result<(), KeyStoreError> {
        let dir = self.identity_dir(identity);
        fs::create_dir_all(&dir).map_err(|source| KeyStoreError::Storage {
            path: dir.clone(),
            source,
        })?;

        let private_der = keypair
            .private_key_der()
            .map_err(|source| KeyStoreError::KeyEncode { identity, source })?;

        write_key_file(&dir.join(PUBLIC_KEY_FILE), keypair.public_key_der(), false)?;
        write_key_file(&dir.join(PRIVATE_KEY_FILE), &private_der, true)?;

        debug!("Persisted key pair for node {} in {}", identity, dir.display());
        Ok(())
    }

    fn load_public(&self, identity: NodeIdentity) -> Result<RsaPublicKey, KeyStoreError> {
        let der = self.read_key_file(identity, PUBLIC_KEY_FILE)?;
        crypto::decode_public_key(&der).map_err(|source| KeyStoreError::KeyDecode { identity, source })
    }

    fn load_private(&self, identity: NodeIdentity) -> Result<RsaPrivateKey, KeyStoreError> {
        let der = self.read_key_file(identity, PRIVATE_KEY_FILE)?;
        RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| KeyStoreError::KeyDecode {
            identity,
            source: onion_core::Error::KeyDecode(e.to_string()),
        })
    }

    fn purge(&self, identity: NodeIdentity) {
        let dir = self.identity_dir(identity);
        // remove_dir_all unlinks symlinks instead of following them
        match fs::remove_dir_all(&dir) {
            Ok(()) => info!("Purged key material for node {}", identity),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No key material to purge for node {}", identity)
            }
            Err(e) => warn!("Failed to purge {}: {}", dir.display(), e),
        }
    }
}

fn write_key_file(path: &Path, contents: &[u8], private: bool) -> Result<(), KeyStoreError> {
    let storage_err = |source: io::Error| KeyStoreError::Storage {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if private {
        owner_only(&mut options);
    }

    let mut file = options.open(path).map_err(storage_err)?;
    file.write_all(contents).map_err(storage_err)?;
    file.sync_all().map_err(storage_err)
}

#[cfg(unix)]
fn owner_only(options: &mut fs::OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
}

#[cfg(not(unix))]
fn owner_only(_options: &mut fs::OpenOptions) {}

#[derive(Clone)]
struct StoredKeys {
    public_der: Vec<u8>,
    private_der: Vec<u8>,
}

/// In-memory key store for tests and nodes that never touch disk
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<NodeIdentity, StoredKeys>>,
    key_bits: Option<usize>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RSA modulus size for generated keys
    pub fn with_key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = Some(key_bits);
        self
    }

    /// Number of stored identities
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn stored(&self, identity: NodeIdentity) -> Result<StoredKeys, KeyStoreError> {
        self.keys
            .read()
            .get(&identity)
            .cloned()
            .ok_or(KeyStoreError::KeyNotFound(identity))
    }
}

impl KeyStore for MemoryKeyStore {
    fn key_bits(&self) -> usize {
        self.key_bits.unwrap_or(DEFAULT_RSA_BITS)
    }

    fn persist(&self, identity: NodeIdentity, keypair: &NodeKeyPair) -> Result<(), KeyStoreError> {
        let private_der = keypair
            .private_key_der()
            .map_err(|source| KeyStoreError::KeyEncode { identity, source })?;
        self.keys.write().insert(
            identity,
            StoredKeys {
                public_der: keypair.public_key_der().to_vec(),
                private_der,
            },
        );
        Ok(())
    }

    fn load_public(&self, identity: NodeIdentity) -> Result<RsaPublicKey, KeyStoreError> {
        let stored = self.stored(identity)?;
        crypto::decode_public_key(&stored.public_der)
            .map_err(|source| KeyStoreError::KeyDecode { identity, source })
    }

    fn load_private(&self, identity: NodeIdentity) -> Result<RsaPrivateKey, KeyStoreError> {
        let stored = self.stored(identity)?;
        RsaPrivateKey::from_pkcs8_der(&stored.private_der).map_err(|e| KeyStoreError::KeyDecode {
            identity,
            source: onion_core::Error::KeyDecode(e.to_string()),
        })
    }

    fn purge(&self, identity: NodeIdentity) {
        if self.keys.write().remove(&identity).is_none() {
            debug!("No key material to purge for node {}", identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_fs_provision_and_load() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path()).with_key_bits(TEST_BITS);
        let identity = NodeIdentity(9000);

        let keypair = store.provision(identity).unwrap();
        assert_eq!(keypair.bits(), TEST_BITS);

        let key_dir = dir.path().join("keys_9000");
        assert!(key_dir.join(PUBLIC_KEY_FILE).exists());
        assert!(key_dir.join(PRIVATE_KEY_FILE).exists());

        // Public file holds exactly what is served on the wire
        let public_der = fs::read(key_dir.join(PUBLIC_KEY_FILE)).unwrap();
        assert_eq!(public_der, keypair.public_key_der());

        let reloaded = store.load(identity).unwrap();
        assert_eq!(reloaded.public_key(), keypair.public_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path()).with_key_bits(TEST_BITS);
        store.provision(NodeIdentity(9001)).unwrap();

        let meta = fs::metadata(dir.path().join("keys_9001").join(PRIVATE_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_fs_missing_identity() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path());
        assert!(matches!(
            store.load_public(NodeIdentity(1)),
            Err(KeyStoreError::KeyNotFound(NodeIdentity(1)))
        ));
    }

    #[test]
    fn test_fs_corrupt_key() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path());
        let key_dir = store.identity_dir(NodeIdentity(2));
        fs::create_dir_all(&key_dir).unwrap();
        fs::write(key_dir.join(PUBLIC_KEY_FILE), b"not a key").unwrap();

        assert!(matches!(
            store.load_public(NodeIdentity(2)),
            Err(KeyStoreError::KeyDecode { .. })
        ));
    }

    #[test]
    fn test_fs_purge() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path()).with_key_bits(TEST_BITS);
        let identity = NodeIdentity(9002);
        store.provision(identity).unwrap();

        store.purge(identity);
        assert!(!store.identity_dir(identity).exists());
        assert!(matches!(
            store.load(identity),
            Err(KeyStoreError::KeyNotFound(_))
        ));

        // Purging again is harmless
        store.purge(identity);
    }

    #[test]
    fn test_identities_are_isolated() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path()).with_key_bits(TEST_BITS);
        let a = store.provision(NodeIdentity(1)).unwrap();
        let b = store.provision(NodeIdentity(2)).unwrap();
        assert_ne!(a.public_key_der(), b.public_key_der());

        store.purge(NodeIdentity(1));
        assert!(store.load(NodeIdentity(2)).is_ok());
    }

    #[test]
    fn test_fs_mismatched_halves() {
        let dir = tempdir().unwrap();
        let store = FsKeyStore::new(dir.path()).with_key_bits(TEST_BITS);
        store.provision(NodeIdentity(1)).unwrap();
        store.provision(NodeIdentity(2)).unwrap();

        fs::copy(
            store.identity_dir(NodeIdentity(2)).join(PUBLIC_KEY_FILE),
            store.identity_dir(NodeIdentity(1)).join(PUBLIC_KEY_FILE),
        )
        .unwrap();

        assert!(store.load_public(NodeIdentity(1)).is_ok());
        assert!(matches!(
            store.load(NodeIdentity(1)),
            Err(KeyStoreError::KeyDecode { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryKeyStore::new().with_key_bits(TEST_BITS);
        assert!(store.is_empty());

        let keypair = store.provision(NodeIdentity(7)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load_public(NodeIdentity(7)).unwrap(),
            *keypair.public_key()
        );

        store.purge(NodeIdentity(7));
        assert!(store.is_empty());
        assert!(matches!(
            store.load_private(NodeIdentity(7)),
            Err(KeyStoreError::KeyNotFound(_))
        ));
    }
}
