//! Where relay messages come from and go to
//!
//! The relay runs lock-step: each inbound message is handed to a
//! [`MessageSink`], then the [`MessageSource`] is asked for the reply.

use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::info;

/// Pull-based source of outbound messages
#[async_trait]
pub trait MessageSource: Send {
    /// Reply to `inbound`. `None` sends nothing.
    async fn next_message(&mut self, inbound: &str) -> Option<String>;

    /// Release any underlying input when the session ends
    async fn close(&mut self) {}
}

/// Consumer of inbound messages
pub trait MessageSink: Send {
    fn deliver(&mut self, message: &str);
}

/// Never replies
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReply;

#[async_trait]
impl MessageSource for NoReply {
    async fn next_message(&mut self, _inbound: &str) -> Option<String> {
        None
    }
}

/// Replies to every message with the same text
#[derive(Debug, Clone)]
pub struct FixedReply(pub String);

#[async_trait]
impl MessageSource for FixedReply {
    async fn next_message(&mut self, _inbound: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Replies from a queue, then goes quiet
#[derive(Debug, Default, Clone)]
pub struct ScriptedSource {
    replies: VecDeque<String>,
}

impl ScriptedSource {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn next_message(&mut self, _inbound: &str) -> Option<String> {
        self.replies.pop_front()
    }
}

/// Logs each inbound message
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn deliver(&mut self, message: &str) {
        info!("Received message from client: {}", message);
    }
}

impl MessageSink for Vec<String> {
    fn deliver(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_drains() {
        let mut source = ScriptedSource::new(["one", "two"]);
        assert_eq!(source.next_message("x").await.as_deref(), Some("one"));
        assert_eq!(source.next_message("x").await.as_deref(), Some("two"));
        assert_eq!(source.next_message("x").await, None);
        assert_eq!(source.next_message("x").await, None);
    }

    #[tokio::test]
    async fn test_fixed_and_no_reply() {
        let mut fixed = FixedReply("ack".to_string());
        assert_eq!(fixed.next_message("a").await.as_deref(), Some("ack"));
        assert_eq!(fixed.next_message("b").await.as_deref(), Some("ack"));
        assert_eq!(NoReply.next_message("a").await, None);
    }
}
