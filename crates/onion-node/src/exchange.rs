//! One client-side message exchange over an established session

use onion_core::protocol::is_quit;
use onion_net::{Client, ClientError, RelayEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Result of sending one line to the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Sent; carries the node's reply when one was awaited
    Sent(Option<String>),
    /// The session is over
    Ended,
}

/// Send `message`, then wait for the node's reply if `await_reply` is set.
///
/// Sending `quit` ends the session without waiting.
pub async fn exchange<S>(
    client: &mut Client<S>,
    message: &str,
    await_reply: bool,
) -> Result<Exchange, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.send(message).await?;
    if is_quit(message) {
        info!("Session closed");
        return Ok(Exchange::Ended);
    }

    if !await_reply {
        return Ok(Exchange::Sent(None));
    }
    match client.recv().await? {
        RelayEvent::Message(reply) => Ok(Exchange::Sent(Some(reply))),
        RelayEvent::Quit => {
            info!("Node ended the session");
            Ok(Exchange::Ended)
        }
    }
}
