//! comet-sdk: client for HTTP long-poll publish/subscribe messaging.
//!
//! Provides:
//! - A self-renewing subscribe loop with per-channel listeners
//! - Resume from the last timetoken after a reconnect
//! - Optional AES-256-GCM message encryption
//! - One-shot publish, history, presence and time calls
//!
//! ```no_run
//! use comet_sdk::{Client, ClientConfig, Event, Listener};
//!
//! # async fn demo() -> comet_sdk::Result<()> {
//! let client = Client::new(ClientConfig::new("pub-key", "sub-key"))?;
//! let (listener, mut events) = Listener::channel();
//! client.subscribe(&["lobby"], &listener).await?;
//! while let Some(event) = events.recv().await {
//!     if let Event::Message { channel, payload } = event {
//!         println!("{channel}: {payload:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod generation;
pub mod manager;
pub mod operations;
pub mod registry;
pub mod request;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use engine::SubscribeOutcome;
pub use error::{DecryptError, EncryptError, Error, Result};
pub use event::{Event, Listener, Payload};
pub use operations::{HereNow, HistoryPage, HistoryQuery, PublishReceipt};
pub use transport::{ReqwestTransport, Transport};
