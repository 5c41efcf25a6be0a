//! Operator-typed replies
//!
//! One reader thread owns stdin for the whole process and forwards lines over
//! a channel. Sessions borrow the receiving end in turn, so a line typed while
//! no session is waiting goes to the next one. The thread never blocks
//! runtime shutdown.

use async_trait::async_trait;
use onion_net::source::MessageSource;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const PROMPT: &str = "Write your message to the client: ";

/// Lines buffered ahead of the session that will consume them
const INPUT_BUFFER: usize = 16;

/// Shared handle to the operator's input lines
#[derive(Clone)]
pub struct OperatorInput {
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl OperatorInput {
    /// Read lines from the process's stdin
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(std::io::stdin()))
    }

    /// Read lines from `reader` on a dedicated thread
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(INPUT_BUFFER);

        let spawned = thread::Builder::new()
            .name("operator-input".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if tx.blocking_send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read operator input: {}", e);
                            break;
                        }
                    }
                }
                debug!("Operator input closed");
            });
        if let Err(e) = spawned {
            warn!("Failed to start operator input reader: {}", e);
        }

        Self {
            lines: Arc::new(Mutex::new(rx)),
        }
    }

    /// Message source for one session
    pub fn source(&self) -> OperatorSource {
        OperatorSource {
            input: self.clone(),
            closed: false,
        }
    }
}

impl fmt::Debug for OperatorInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorInput").finish_non_exhaustive()
    }
}

impl PartialEq for OperatorInput {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lines, &other.lines)
    }
}

impl Eq for OperatorInput {}

/// Prompts the operator for one reply per client message.
///
/// End of input means no more replies; the session keeps relaying inbound
/// messages without answering.
pub struct OperatorSource {
    input: OperatorInput,
    closed: bool,
}

#[async_trait]
impl MessageSource for OperatorSource {
    async fn next_message(&mut self, _inbound: &str) -> Option<String> {
        if self.closed {
            return None;
        }

        print!("{}", PROMPT);
        if let Err(e) = std::io::stdout().flush() {
            debug!("Failed to flush prompt: {}", e);
        }

        let line = self.input.lines.lock().await.recv().await;
        if line.is_none() {
            self.closed = true;
        }
        line
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
