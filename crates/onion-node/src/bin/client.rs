//! onion-client - talk to an onion node over its secure channel

use anyhow::Context;
use clap::Parser;
use onion_core::crypto::{encode_public_key, fingerprint};
use onion_net::{Client, ClientError};
use onion_node::config::ClientConfig;
use onion_node::exchange::{exchange, Exchange};
use onion_node::logging;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ClientConfig::parse();

    logging::init(config.log_format, config.verbose);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut client = Client::connect(config.connect.as_str(), config.channel_config())
        .await
        .with_context(|| format!("failed to connect to {}", config.connect))?;

    let public_key = client
        .request_public_key()
        .await
        .context("public key request failed")?;
    info!(
        "Node public key {}",
        fingerprint(&encode_public_key(&public_key)?)
    );

    if let Some(ack) = client
        .establish(config.key_bits, config.ack.into())
        .await
        .context("session key delivery failed")?
    {
        info!("{}", ack);
    }
    info!("Session established ({}-bit key)", config.key_bits);

    if config.message.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if !send_line(&mut client, &line, config.await_replies).await? {
                return Ok(());
            }
        }
    } else {
        for message in &config.message {
            if !send_line(&mut client, message, config.await_replies).await? {
                return Ok(());
            }
        }
    }

    log_summary(&client);
    client.quit().await?;
    info!("Session closed");
    Ok(())
}

/// Print any reply; false once the session has ended
async fn send_line<S>(client: &mut Client<S>, message: &str, await_reply: bool) -> Result<bool, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match exchange(client, message, await_reply).await? {
        Exchange::Sent(Some(reply)) => println!("{}", reply),
        Exchange::Sent(None) => {}
        Exchange::Ended => {
            log_summary(client);
            return Ok(false);
        }
    }
    Ok(true)
}

fn log_summary<S>(client: &Client<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(stats) = client.relay_stats() {
        info!(
            sent = stats.messages_sent,
            received = stats.messages_received,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            "Session summary"
        );
    }
}
