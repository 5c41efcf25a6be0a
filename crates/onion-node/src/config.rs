//! Configuration for onion-node and onion-client

use crate::interactive::OperatorInput;
use clap::{Parser, ValueEnum};
use onion_core::crypto::{DEFAULT_RSA_BITS, DEFAULT_SESSION_KEY_BITS};
use onion_core::protocol::AckMode;
use onion_net::framing::DEFAULT_MAX_FRAME_SIZE;
use onion_net::source::{FixedReply, MessageSource, NoReply};
use onion_net::ChannelConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Acknowledgement mode on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AckArg {
    /// No reply to the session key
    Silent,
    /// Encrypted "Secret key set" reply
    Encrypted,
}

impl From<AckArg> for AckMode {
    fn from(arg: AckArg) -> Self {
        match arg {
            AckArg::Silent => AckMode::Silent,
            AckArg::Encrypted => AckMode::Encrypted,
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// onion-node - single-hop onion node
#[derive(Parser, Debug, Clone)]
#[command(name = "onion-node")]
#[command(author, version, about, long_about = None)]
pub struct NodeConfig {
    /// Port to listen on; also names this node's key directory
    #[arg(short, long, env = "ONION_PORT")]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Directory holding per-node key material
    #[arg(long, env = "ONION_KEY_DIR", default_value = "./keys")]
    pub key_dir: PathBuf,

    /// RSA modulus size for the node key pair
    #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
    pub rsa_bits: usize,

    /// Reply sent after a session key is accepted
    #[arg(long, value_enum, default_value_t = AckArg::Silent)]
    pub ack: AckArg,

    /// Read replies to each client message from stdin
    #[arg(long)]
    pub interactive: bool,

    /// Reply to each client message with this text
    #[arg(long, conflicts_with = "interactive")]
    pub reply: Option<String>,

    /// Handle connections concurrently instead of one at a time
    #[arg(long)]
    pub concurrent: bool,

    /// Maximum concurrent connections
    #[arg(long, default_value = "64")]
    pub max_connections: usize,

    /// Exit after the first connection ends
    #[arg(long, conflicts_with = "concurrent")]
    pub once: bool,

    /// Largest accepted frame payload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_bytes: usize,

    /// Read/write timeout in seconds (default: wait forever)
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Leave key material on disk at shutdown
    #[arg(long)]
    pub keep_keys: bool,

    /// Keep key material in memory only
    #[arg(long)]
    pub ephemeral_keys: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl NodeConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port must be non-zero: it names the node's key directory");
        }
        if !(1024..=8192).contains(&self.rsa_bits) || self.rsa_bits % 8 != 0 {
            anyhow::bail!(
                "RSA key size must be a multiple of 8 between 1024 and 8192, got {}",
                self.rsa_bits
            );
        }
        if self.interactive && self.concurrent {
            anyhow::bail!("Interactive replies need sequential connection handling");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max-connections must be at least 1");
        }
        validate_frame_limit(self.max_frame_bytes)?;
        Ok(())
    }

    /// Listener settings. Starts the stdin reader when replies are
    /// interactive, so call this once.
    pub fn server_config(&self) -> ServerConfig {
        let replies = if self.interactive {
            ReplyPolicy::Interactive(OperatorInput::stdin())
        } else if let Some(text) = &self.reply {
            ReplyPolicy::Fixed(text.clone())
        } else {
            ReplyPolicy::None
        };

        ServerConfig {
            listen: SocketAddr::new(self.bind, self.port),
            mode: if self.concurrent {
                ConnectionMode::Concurrent
            } else {
                ConnectionMode::Sequential
            },
            max_connections: self.max_connections,
            once: self.once,
            channel: channel_config(self.max_frame_bytes, self.io_timeout_secs),
            ack_mode: self.ack.into(),
            replies,
        }
    }
}

/// onion-client - connect to an onion node and exchange encrypted messages
#[derive(Parser, Debug, Clone)]
#[command(name = "onion-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Node address (host:port)
    #[arg(short, long)]
    pub connect: String,

    /// Session key size in bits (128, 192 or 256)
    #[arg(long, default_value_t = DEFAULT_SESSION_KEY_BITS)]
    pub key_bits: usize,

    /// Acknowledgement mode the node runs with
    #[arg(long, value_enum, default_value_t = AckArg::Silent)]
    pub ack: AckArg,

    /// Message to send (repeatable); reads stdin lines when absent
    #[arg(short, long)]
    pub message: Vec<String>,

    /// Wait for a reply after each message
    #[arg(long)]
    pub await_replies: bool,

    /// Largest accepted frame payload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_bytes: usize,

    /// Read/write timeout in seconds (default: wait forever)
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if ![128, 192, 256].contains(&self.key_bits) {
            anyhow::bail!("Session key size must be 128, 192 or 256, got {}", self.key_bits);
        }
        validate_frame_limit(self.max_frame_bytes)
    }

    /// Channel settings
    pub fn channel_config(&self) -> ChannelConfig {
        channel_config(self.max_frame_bytes, self.io_timeout_secs)
    }
}

fn validate_frame_limit(max_frame_bytes: usize) -> anyhow::Result<()> {
    if max_frame_bytes == 0 || max_frame_bytes > u32::MAX as usize {
        anyhow::bail!("max-frame-bytes must be between 1 and {}", u32::MAX);
    }
    Ok(())
}

fn channel_config(max_frame_bytes: usize, io_timeout_secs: Option<u64>) -> ChannelConfig {
    ChannelConfig::default()
        .with_max_frame_bytes(max_frame_bytes)
        .with_io_timeout(io_timeout_secs.map(Duration::from_secs))
}

/// Whether connections are served one at a time or in parallel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Finish each connection before accepting the next
    Sequential,
    /// One task per connection
    Concurrent,
}

/// How the node answers client messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Never reply
    None,
    /// Same text every time
    Fixed(String),
    /// Operator types each reply
    Interactive(OperatorInput),
}

impl ReplyPolicy {
    /// Fresh message source for one connection
    pub fn make_source(&self) -> Box<dyn MessageSource> {
        match self {
            Self::None => Box::new(NoReply),
            Self::Fixed(text) => Box::new(FixedReply(text.clone())),
            Self::Interactive(input) => Box::new(input.source()),
        }
    }
}

/// Listener settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub mode: ConnectionMode,
    pub max_connections: usize,
    pub once: bool,
    pub channel: ChannelConfig,
    pub ack_mode: AckMode,
    pub replies: ReplyPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_port_is_required() {
        // Ignore ONION_PORT from the surrounding environment
        let err = NodeConfig::command()
            .mut_arg("port", |arg| arg.env(None::<&'static str>))
            .try_get_matches_from(["onion-node"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::try_parse_from(["onion-node", "-p", "9000"]).unwrap();
        assert!(config.validate().is_ok());

        let server = config.server_config();
        assert_eq!(server.listen, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(server.mode, ConnectionMode::Sequential);
        assert_eq!(server.ack_mode, AckMode::Silent);
        assert_eq!(server.replies, ReplyPolicy::None);
        assert!(server.channel.read_timeout.is_none());
        assert_eq!(server.channel.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_server_options() {
        let config = NodeConfig::try_parse_from([
            "onion-node",
            "--port",
            "9100",
            "--bind",
            "127.0.0.1",
            "--ack",
            "encrypted",
            "--reply",
            "noted",
            "--concurrent",
            "--io-timeout-secs",
            "5",
        ])
        .unwrap();
        assert!(config.validate().is_ok());

        let server = config.server_config();
        assert_eq!(server.listen, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(server.mode, ConnectionMode::Concurrent);
        assert_eq!(server.ack_mode, AckMode::Encrypted);
        assert_eq!(server.replies, ReplyPolicy::Fixed("noted".to_string()));
        assert_eq!(server.channel.write_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_combinations() {
        let config =
            NodeConfig::try_parse_from(["onion-node", "-p", "9000", "--interactive", "--concurrent"])
                .unwrap();
        assert!(config.validate().is_err());

        let config = NodeConfig::try_parse_from(["onion-node", "-p", "9000", "--rsa-bits", "512"])
            .unwrap();
        assert!(config.validate().is_err());

        let config = NodeConfig::try_parse_from(["onion-node", "-p", "0"]).unwrap();
        assert!(config.validate().is_err());

        assert!(NodeConfig::try_parse_from([
            "onion-node",
            "-p",
            "9000",
            "--interactive",
            "--reply",
            "x"
        ])
        .is_err());

        let err =
            NodeConfig::try_parse_from(["onion-node", "-p", "9000", "--once", "--concurrent"])
                .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_interactive_sources_share_one_input() {
        let input = OperatorInput::from_reader(&b""[..]);
        let policy = ReplyPolicy::Interactive(input.clone());
        assert_eq!(policy, ReplyPolicy::Interactive(input));
        assert_ne!(policy, ReplyPolicy::None);
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::try_parse_from([
            "onion-client",
            "--connect",
            "127.0.0.1:9000",
            "-m",
            "hello",
            "-m",
            "world",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_bits, 128);
        assert_eq!(config.message, vec!["hello", "world"]);

        let config = ClientConfig::try_parse_from([
            "onion-client",
            "--connect",
            "127.0.0.1:9000",
            "--key-bits",
            "100",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
