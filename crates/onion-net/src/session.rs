//! Per-connection session driver
//!
//! Reads frames strictly in arrival order. Until the handshake installs a
//! session key every frame goes to the [`HandshakeEngine`]; from then on every
//! frame goes to the [`SecureRelay`]. Nothing is ever decoded as a message
//! before the key exists.

use crate::channel::FramedChannel;
use crate::framing::FrameError;
use crate::handshake::{HandshakeEngine, HandshakeError, HandshakeStep};
use crate::relay::{RelayError, RelayEvent, RelayStats, SecureRelay};
use crate::source::{MessageSink, MessageSource};
use onion_core::protocol::{is_quit, ConnectionState};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Session errors. Each one ends the connection it occurred on.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Session not established")]
    NotEstablished,
}

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Quit sentinel exchanged; `by_peer` is false if we sent it
    Quit { by_peer: bool },
    /// Peer closed the stream between frames
    PeerClosed,
}

/// One accepted connection
pub struct Session<S> {
    channel: FramedChannel<S>,
    engine: HandshakeEngine,
    relay: Option<SecureRelay>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(channel: FramedChannel<S>, engine: HandshakeEngine) -> Self {
        Self {
            channel,
            engine,
            relay: None,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Relay statistics, once established
    pub fn relay_stats(&self) -> Option<RelayStats> {
        self.relay.as_ref().map(SecureRelay::stats)
    }

    /// Encrypt and send one message outside the reply loop
    pub async fn send_message(&mut self, message: &str) -> Result<(), SessionError> {
        let relay = self.relay.as_mut().ok_or(SessionError::NotEstablished)?;
        let frame = relay.seal(message)?;
        self.channel.send_frame(frame).await?;
        Ok(())
    }

    /// Run the connection to completion.
    ///
    /// Inbound messages go to `sink`; after each one `source` is asked for a
    /// reply. The source is closed however the session ends.
    pub async fn run<Src, Snk>(
        &mut self,
        source: &mut Src,
        sink: &mut Snk,
    ) -> Result<SessionOutcome, SessionError>
    where
        Src: MessageSource + ?Sized,
        Snk: MessageSink + ?Sized,
    {
        let result = self.drive(source, sink).await;
        if result.is_err() {
            self.engine.close();
        }
        source.close().await;

        debug!(
            frames_in = self.channel.frames_received(),
            frames_out = self.channel.frames_sent(),
            key_requests = self.engine.key_requests(),
            "Session ended"
        );
        result
    }

    async fn drive<Src, Snk>(
        &mut self,
        source: &mut Src,
        sink: &mut Snk,
    ) -> Result<SessionOutcome, SessionError>
    where
        Src: MessageSource + ?Sized,
        Snk: MessageSink + ?Sized,
    {
        loop {
            let frame = match self.channel.recv_frame().await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    debug!("Peer closed connection in state {}", self.engine.state());
                    self.engine.close();
                    return Ok(SessionOutcome::PeerClosed);
                }
                Err(e) => return Err(e.into()),
            };

            let relay = match self.relay.as_mut() {
                Some(relay) => relay,
                None => {
                    self.handshake(&frame).await?;
                    continue;
                }
            };

            match relay.on_inbound_frame(&frame)? {
                RelayEvent::Quit => {
                    info!("Peer sent quit, closing connection");
                    self.shutdown().await;
                    return Ok(SessionOutcome::Quit { by_peer: true });
                }
                RelayEvent::Message(text) => {
                    sink.deliver(&text);

                    if let Some(reply) = source.next_message(&text).await {
                        let sealed = relay.seal(&reply)?;
                        self.channel.send_frame(sealed).await?;
                        debug!("Message sent ({} bytes)", reply.len());

                        if is_quit(&reply) {
                            info!("Sent quit, closing connection");
                            self.shutdown().await;
                            return Ok(SessionOutcome::Quit { by_peer: false });
                        }
                    }
                }
            }
        }
    }

    async fn handshake(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        match self.engine.on_frame(frame)? {
            HandshakeStep::Reply(public_key) => {
                self.channel.send_frame(public_key).await?;
                debug!("Public key was sent");
            }
            HandshakeStep::Established { session_key, reply } => {
                self.relay = Some(SecureRelay::new(session_key));
                if let Some(reply) = reply {
                    self.channel.send_frame(reply).await?;
                    debug!("Session key acknowledged");
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.engine.close();
        if let Err(e) = self.channel.close().await {
            debug!("Error closing channel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::client::Client;
    use crate::handshake::HandshakeConfig;
    use crate::source::{NoReply, ScriptedSource};
    use crate::test_support::test_keypair;
    use bytes::Bytes;
    use onion_core::protocol::AckMode;
    use onion_core::SessionKey;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    type SessionResult = (Result<SessionOutcome, SessionError>, Vec<String>, ConnectionState);

    fn start(
        ack_mode: AckMode,
        mut source: ScriptedSource,
    ) -> (Client<DuplexStream>, JoinHandle<SessionResult>) {
        let (a, b) = duplex(64 * 1024);
        let engine = HandshakeEngine::new(
            test_keypair(),
            HandshakeConfig {
                ack_mode,
                node_label: "127.0.0.1:9000".to_string(),
            },
        );
        let mut session = Session::new(FramedChannel::new(b, ChannelConfig::default()), engine);

        let handle = tokio::spawn(async move {
            let mut sink = Vec::new();
            let result = session.run(&mut source, &mut sink).await;
            (result, sink, session.state())
        });

        (Client::new(FramedChannel::new(a, ChannelConfig::default())), handle)
    }

    #[tokio::test]
    async fn test_full_session() {
        let (mut client, handle) = start(AckMode::Silent, ScriptedSource::new(["hi back"]));

        // Key may be requested repeatedly and is always the same
        let first = client.request_public_key().await.unwrap();
        let second = client.request_public_key().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first, test_keypair().public_key());

        assert_eq!(client.establish(128, AckMode::Silent).await.unwrap(), None);

        client.send("hello").await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            RelayEvent::Message("hi back".to_string())
        );

        client.send("QuIt").await.unwrap();

        let (result, sink, state) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionOutcome::Quit { by_peer: true });
        assert_eq!(sink, vec!["hello".to_string()]);
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_encrypted_ack_mode() {
        let (mut client, handle) = start(AckMode::Encrypted, ScriptedSource::default());

        let ack = client.establish(128, AckMode::Encrypted).await.unwrap();
        assert_eq!(ack.as_deref(), Some("Secret key set at server 127.0.0.1:9000"));

        client.quit().await.unwrap();
        let (result, _, _) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionOutcome::Quit { by_peer: true });
    }

    #[tokio::test]
    async fn test_application_frame_before_key() {
        let (mut client, handle) = start(AckMode::Silent, ScriptedSource::default());

        let key = SessionKey::generate(128).unwrap();
        let frame = key.encrypt(b"hello").unwrap();
        client.channel_mut().send_frame(frame).await.unwrap();

        let (result, sink, state) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::UnexpectedFrame(_)))
        ));
        assert!(sink.is_empty());
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_before_handshake() {
        let (client, handle) = start(AckMode::Silent, ScriptedSource::default());
        drop(client);

        let (result, _, state) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionOutcome::PeerClosed);
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_corrupted_frame_after_established() {
        let (mut client, handle) = start(AckMode::Silent, ScriptedSource::default());
        client.establish(128, AckMode::Silent).await.unwrap();

        client
            .channel_mut()
            .send_frame(Bytes::from_static(b"0123456789abcdef0"))
            .await
            .unwrap();

        let (result, sink, _) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Relay(RelayError::Decryption(_)))
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_local_quit_from_source() {
        let (mut client, handle) = start(AckMode::Silent, ScriptedSource::new(["ok", "QUIT"]));
        client.establish(256, AckMode::Silent).await.unwrap();

        client.send("first").await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            RelayEvent::Message("ok".to_string())
        );
        client.send("second").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), RelayEvent::Quit);

        let (result, sink, _) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionOutcome::Quit { by_peer: false });
        assert_eq!(sink, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_send_message_requires_session_key() {
        let (peer, b) = duplex(1024);
        let engine = HandshakeEngine::new(test_keypair(), HandshakeConfig::default());
        let mut session = Session::new(FramedChannel::new(b, ChannelConfig::default()), engine);

        assert!(matches!(
            session.send_message("hello").await,
            Err(SessionError::NotEstablished)
        ));
        assert!(session.relay_stats().is_none());

        let mut sink = Vec::new();
        drop(peer);
        assert_eq!(
            session.run(&mut NoReply, &mut sink).await.unwrap(),
            SessionOutcome::PeerClosed
        );
    }
}
