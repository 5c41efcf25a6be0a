//! Framed channel over a connected byte stream
//!
//! Wraps any `AsyncRead + AsyncWrite` stream (TCP in production, in-memory
//! duplex pipes in tests) with [`FrameCodec`]. Sends flush before returning.

use crate::framing::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_SIZE};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::trace;

/// Channel settings
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Largest payload accepted or sent
    pub max_frame_bytes: usize,
    /// Give up waiting for a frame after this long (`None` waits forever)
    pub read_timeout: Option<Duration>,
    /// Give up writing a frame after this long (`None` waits forever)
    pub write_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl ChannelConfig {
    /// Apply the same timeout to reads and writes
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    /// Set the payload limit
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// Bidirectional frame channel
pub struct FramedChannel<S> {
    inner: Framed<S, FrameCodec>,
    config: ChannelConfig,
    frames_sent: u64,
    frames_received: u64,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream
    pub fn new(stream: S, config: ChannelConfig) -> Self {
        let codec = FrameCodec::with_max_frame_bytes(config.max_frame_bytes);
        Self {
            inner: Framed::new(stream, codec),
            config,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Write one frame and flush
    pub async fn send_frame(&mut self, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        let payload = payload.into();
        let length = payload.len();

        with_timeout(self.config.write_timeout, self.inner.send(payload)).await?;

        self.frames_sent += 1;
        trace!(length, "frame sent");
        Ok(())
    }

    /// Read exactly one frame.
    ///
    /// A clean close between frames is [`FrameError::ConnectionClosed`];
    /// a close inside a frame is [`FrameError::Truncated`].
    pub async fn recv_frame(&mut self) -> Result<Bytes, FrameError> {
        let limit = self.config.read_timeout;
        let inner = &mut self.inner;
        let next = async move {
            match inner.next().await {
                Some(result) => result,
                None => Err(FrameError::ConnectionClosed),
            }
        };
        let frame = with_timeout(limit, next).await?;

        self.frames_received += 1;
        trace!(length = frame.len(), "frame received");
        Ok(frame)
    }

    /// Flush and shut down the write half
    pub async fn close(&mut self) -> Result<(), FrameError> {
        SinkExt::<Bytes>::close(&mut self.inner).await
    }

    /// Frames written so far
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames read so far
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, FrameError>
where
    F: Future<Output = Result<T, FrameError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FrameError::Timeout)?,
        None => fut.await,
    }
}
