//! onion-node - single-hop onion node
//!
//! This crate provides:
//! - Command-line configuration for the node and client binaries
//! - The listener that runs one secure-channel session per connection
//! - Operator input as a message source
//! - The client's send-and-await-reply step
//! - Logging setup

pub mod config;
pub mod exchange;
pub mod interactive;
pub mod logging;
pub mod server;

pub use config::{ClientConfig, ConnectionMode, NodeConfig, ReplyPolicy, ServerConfig};
pub use exchange::{exchange, Exchange};
pub use interactive::{OperatorInput, OperatorSource};
pub use server::{Server, ServerError, ServerStats};
