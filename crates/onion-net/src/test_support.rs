//! Shared fixtures for unit tests

use onion_core::NodeKeyPair;
use std::sync::{Arc, OnceLock};

/// One 1024-bit node key pair shared by every test in the crate
pub fn test_keypair() -> Arc<NodeKeyPair> {
    static KEYPAIR: OnceLock<Arc<NodeKeyPair>> = OnceLock::new();
    KEYPAIR
        .get_or_init(|| Arc::new(NodeKeyPair::generate(1024).unwrap()))
        .clone()
}
