//! Listen on a set of channels and print what arrives.
//!
//! Usage:
//!   cargo run --example listen -- --subscribe-key sub-c-... --channel lobby \
//!     --channel alerts --presence --publish "hello"
//!
//! Set `RUST_LOG=comet_sdk=debug` to watch the subscribe loop at work.

use anyhow::Result;
use clap::Parser;
use comet_sdk::{Client, ClientConfig, Event, Listener};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "listen", about = "Long-poll subscriber example")]
struct Args {
    #[arg(long, env = "COMET_PUBLISH_KEY", default_value = "demo")]
    publish_key: String,
    #[arg(long, env = "COMET_SUBSCRIBE_KEY", default_value = "demo")]
    subscribe_key: String,
    /// Shared message encryption key
    #[arg(long, env = "COMET_CIPHER_KEY")]
    cipher_key: Option<String>,
    #[arg(long, env = "COMET_AUTH_KEY")]
    auth_key: Option<String>,
    /// Channel to subscribe to (repeatable)
    #[arg(long = "channel", default_value = "lobby")]
    channels: Vec<String>,
    /// Also listen for join/leave events
    #[arg(long)]
    presence: bool,
    /// Resume from the last timetoken after a reconnect
    #[arg(long)]
    resume: bool,
    /// Disable TLS
    #[arg(long)]
    insecure: bool,
    /// Long-poll timeout in seconds
    #[arg(long, default_value_t = 310)]
    timeout: u64,
    /// Publish this text to the first channel once connected
    #[arg(long)]
    publish: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comet_sdk=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = ClientConfig {
        cipher_key: args.cipher_key,
        auth_key: args.auth_key,
        resume_on_reconnect: args.resume,
        tls: !args.insecure,
        subscribe_timeout: Duration::from_secs(args.timeout),
        ..ClientConfig::new(&args.publish_key, &args.subscribe_key)
    };
    let client = Client::new(config)?;
    println!("uuid {}", client.uuid());

    let (listener, mut events) = Listener::channel();
    client.subscribe(&args.channels, &listener).await?;
    if args.presence {
        for channel in &args.channels {
            client.presence(channel, &listener).await?;
        }
    }

    let mut pending_publish = args.publish;
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                Event::Message { channel, payload } => {
                    let body = serde_json::to_string(&payload)?;
                    println!("[{channel}] {body}");
                }
                Event::Connected { channel, timetoken } => {
                    println!("connected to {channel} at {timetoken}");
                    if let Some(text) = pending_publish.take() {
                        let receipt = client.publish(&channel, &serde_json::json!(text)).await?;
                        println!("published at {}", receipt.timetoken);
                    }
                }
                Event::Reconnected { channel, timetoken } => {
                    println!("reconnected to {channel} at {timetoken}");
                }
                Event::Disconnected { channel, timetoken } => {
                    println!("disconnected from {channel} (resume at {timetoken})");
                }
                Event::Error { channel, error } => {
                    eprintln!("error on {channel}: {error}");
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let left = client.unsubscribe_all().await?;
    println!("left {}", left.join(", "));
    client.shutdown().await?;
    Ok(())
}
