//! onion-node server - accept loop and per-connection sessions

use crate::config::{ConnectionMode, ServerConfig};
use onion_core::NodeKeyPair;
use onion_net::{FramedChannel, HandshakeConfig, HandshakeEngine, LogSink, Session};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Connections accepted
    pub accepted: u64,
    /// Connections that installed a session key
    pub established: u64,
    /// Connections that ended with an error
    pub failed: u64,
    /// Connections currently open
    pub active: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Plaintext bytes relayed in each direction
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Counts a connection as active until dropped, including when its task is
/// cancelled mid-session
struct ActiveConnection<'a> {
    stats: &'a RwLock<ServerStats>,
}

impl<'a> ActiveConnection<'a> {
    fn open(stats: &'a RwLock<ServerStats>) -> Self {
        {
            let mut stats = stats.write();
            stats.accepted += 1;
            stats.active += 1;
        }
        Self { stats }
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        let mut stats = self.stats.write();
        stats.active = stats.active.saturating_sub(1);
    }
}

/// Node listener
pub struct Server {
    config: ServerConfig,
    keypair: Arc<NodeKeyPair>,
    stats: RwLock<ServerStats>,
    next_connection_id: AtomicU64,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server around an already provisioned key pair
    pub fn new(config: ServerConfig, keypair: Arc<NodeKeyPair>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            keypair,
            stats: RwLock::new(ServerStats::default()),
            next_connection_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        info!("Listening on {}", listener.local_addr()?);

        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown, or until the first
    /// connection ends in single-connection mode
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            debug!("Waiting for connection...");
            let (stream, addr) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

            if self.config.once || self.config.mode == ConnectionMode::Sequential {
                tokio::select! {
                    _ = self.clone().handle_connection(stream, addr, id) => {}
                    _ = shutdown_rx.recv() => {
                        info!("Shutting down...");
                        break;
                    }
                }
                if self.config.once {
                    info!("Connection finished, exiting");
                    break;
                }
                continue;
            }

            let permit = tokio::select! {
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, addr, id).await;
                drop(permit);
            });
        }

        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, id: u64) {
        let span = info_span!("conn", id, peer = %addr);
        async move {
            info!("Connection established");
            let active = ActiveConnection::open(&self.stats);

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
            let node_label = stream
                .local_addr()
                .map(|local| local.to_string())
                .unwrap_or_else(|_| self.config.listen.to_string());

            let engine = HandshakeEngine::new(
                self.keypair.clone(),
                HandshakeConfig {
                    ack_mode: self.config.ack_mode,
                    node_label,
                },
            );
            let channel = FramedChannel::new(stream, self.config.channel.clone());
            let mut session = Session::new(channel, engine);
            let mut source = self.config.replies.make_source();
            let mut sink = LogSink;

            let result = session.run(source.as_mut(), &mut sink).await;
            drop(active);

            let mut stats = self.stats.write();
            if let Some(relay) = session.relay_stats() {
                stats.established += 1;
                stats.messages_received += relay.messages_received;
                stats.messages_sent += relay.messages_sent;
                stats.bytes_received += relay.bytes_received;
                stats.bytes_sent += relay.bytes_sent;
            }
            match result {
                Ok(outcome) => info!(?outcome, "Connection closed"),
                Err(e) => {
                    stats.failed += 1;
                    warn!("Connection error from {}: {}", addr, e);
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        self.stats.read().clone()
    }
}
