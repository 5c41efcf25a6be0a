//! Dialing side of the secure channel
//!
//! Requests the node's public key, delivers a fresh session key encrypted to
//! it, then exchanges encrypted messages.

use crate::channel::{ChannelConfig, FramedChannel};
use crate::framing::FrameError;
use crate::relay::{RelayError, RelayEvent, RelayStats, SecureRelay};
use bytes::Bytes;
use onion_core::crypto::{decode_public_key, encrypt_to, fingerprint};
use onion_core::protocol::{AckMode, PUBLIC_KEY_REQUEST, QUIT_COMMAND};
use onion_core::SessionKey;
use rsa::RsaPublicKey;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] onion_core::Error),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("No public key received yet")]
    NoPublicKey,
    #[error("Session not established")]
    NotEstablished,
    #[error("Session already established")]
    AlreadyEstablished,
    #[error("Peer ended the session")]
    PeerQuit,
}

/// Client end of one connection
pub struct Client<S> {
    channel: FramedChannel<S>,
    server_key: Option<RsaPublicKey>,
    relay: Option<SecureRelay>,
}

impl Client<TcpStream> {
    /// Connect to a node over TCP
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ChannelConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(FrameError::Io)?;
        stream.set_nodelay(true).map_err(FrameError::Io)?;
        if let Ok(peer) = stream.peer_addr() {
            info!("Connected to {}", peer);
        }
        Ok(Self::new(FramedChannel::new(stream, config)))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Use an already connected channel
    pub fn new(channel: FramedChannel<S>) -> Self {
        Self {
            channel,
            server_key: None,
            relay: None,
        }
    }

    /// Ask the node for its public key
    pub async fn request_public_key(&mut self) -> Result<RsaPublicKey, ClientError> {
        if self.relay.is_some() {
            return Err(ClientError::AlreadyEstablished);
        }

        self.channel
            .send_frame(Bytes::from_static(PUBLIC_KEY_REQUEST))
            .await?;
        let der = self.channel.recv_frame().await?;
        let public_key = decode_public_key(&der)?;

        debug!("Received node public key {}", fingerprint(&der));
        self.server_key = Some(public_key.clone());
        Ok(public_key)
    }

    /// Send `session_key` encrypted to the node's public key.
    ///
    /// Returns the node's acknowledgement text when `ack_mode` expects one.
    pub async fn deliver_session_key(
        &mut self,
        session_key: SessionKey,
        ack_mode: AckMode,
    ) -> Result<Option<String>, ClientError> {
        if self.relay.is_some() {
            return Err(ClientError::AlreadyEstablished);
        }
        let server_key = self.server_key.as_ref().ok_or(ClientError::NoPublicKey)?;

        let ciphertext = encrypt_to(server_key, session_key.as_bytes())?;
        self.channel.send_frame(ciphertext).await?;

        let mut relay = SecureRelay::new(session_key);
        let ack = match ack_mode {
            AckMode::Silent => None,
            AckMode::Encrypted => {
                let frame = self.channel.recv_frame().await?;
                match relay.on_inbound_frame(&frame)? {
                    RelayEvent::Message(text) => Some(text),
                    RelayEvent::Quit => return Err(ClientError::PeerQuit),
                }
            }
        };

        self.relay = Some(relay);
        Ok(ack)
    }

    /// Full handshake with a freshly generated session key
    pub async fn establish(
        &mut self,
        key_bits: usize,
        ack_mode: AckMode,
    ) -> Result<Option<String>, ClientError> {
        if self.server_key.is_none() {
            self.request_public_key().await?;
        }
        let session_key = SessionKey::generate(key_bits)?;
        self.deliver_session_key(session_key, ack_mode).await
    }

    /// Send an encrypted message
    pub async fn send(&mut self, message: &str) -> Result<(), ClientError> {
        let relay = self.relay.as_mut().ok_or(ClientError::NotEstablished)?;
        let frame = relay.seal(message)?;
        self.channel.send_frame(frame).await?;
        Ok(())
    }

    /// Wait for the next encrypted message
    pub async fn recv(&mut self) -> Result<RelayEvent, ClientError> {
        if self.relay.is_none() {
            return Err(ClientError::NotEstablished);
        }
        let frame = self.channel.recv_frame().await?;
        let relay = self.relay.as_mut().ok_or(ClientError::NotEstablished)?;
        Ok(relay.on_inbound_frame(&frame)?)
    }

    /// Send the quit sentinel and close the connection
    pub async fn quit(mut self) -> Result<(), ClientError> {
        self.send(QUIT_COMMAND).await?;
        self.channel.close().await?;
        Ok(())
    }

    /// Relay statistics, once established
    pub fn relay_stats(&self) -> Option<RelayStats> {
        self.relay.as_ref().map(SecureRelay::stats)
    }

    /// Raw frame access, bypassing the protocol
    pub fn channel_mut(&mut self) -> &mut FramedChannel<S> {
        &mut self.channel
    }
}
