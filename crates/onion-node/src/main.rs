//! onion-node - single-hop onion node
//!
//! Serves its RSA public key on request, accepts an RSA-encrypted AES session
//! key from each client, then relays AES-encrypted messages until either side
//! sends `quit`.

use clap::Parser;
use onion_net::{FsKeyStore, KeyStore, MemoryKeyStore, NodeIdentity};
use onion_node::config::NodeConfig;
use onion_node::logging;
use onion_node::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = NodeConfig::parse();

    logging::init(config.log_format, config.verbose);

    info!(
        "onion-node v{} - single-hop onion node",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    let store: Box<dyn KeyStore> = if config.ephemeral_keys {
        Box::new(MemoryKeyStore::new().with_key_bits(config.rsa_bits))
    } else {
        Box::new(FsKeyStore::new(config.key_dir.clone()).with_key_bits(config.rsa_bits))
    };
    let identity = NodeIdentity(config.port);

    let keypair = match store.provision(identity) {
        Ok(keypair) => Arc::new(keypair),
        Err(e) => {
            error!("Failed to provision node keys: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server = Arc::new(Server::new(config.server_config(), keypair));

    // Install signal handler
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_server.shutdown();
        }
    });

    let result = server.run().await;

    if config.keep_keys {
        info!("Keeping key material for {}", identity);
    } else {
        store.purge(identity);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
