//! Publish/subscribe client.
//!
//! This is the main entry point for SDK consumers. A [`Client`] is a cheap
//! handle onto a background task that owns the subscribe loop; cloning it
//! shares that loop. Stream activity is reported per channel through the
//! [`Listener`] passed to [`Client::subscribe`].
//!
//! ## Subscribe loop
//!
//! The task owns a [`SubscribeEngine`] and a [`SubscribeManager`]. Commands
//! from handles and completions from the manager are both fed into the
//! engine, and the engine's [`Step`] is applied to the manager. Only one
//! long-poll is ever in flight.
//!
//! ## One-shot calls
//!
//! `publish`, `history`, `detailed_history`, `here_now` and `time` run on
//! the caller's task through a separate manager with a short timeout, and
//! never interfere with the subscribe loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::crypto::{CryptoCodec, PRESENCE_SUFFIX};
use crate::engine::{self, Step, SubscribeEngine, SubscribeOutcome};
use crate::error::{Error, Result};
use crate::event::{Listener, Payload};
use crate::manager::{ManagerEvent, NonSubscribeManager, RetryPolicy, SubscribeManager};
use crate::operations::{self, Endpoint, HereNow, HistoryPage, HistoryQuery, PublishReceipt};
use crate::request::Origin;
use crate::transport::{ReqwestTransport, Transport};

/// Commands handles send to the subscribe task.
#[derive(Debug)]
enum Command {
    Subscribe {
        channels: Vec<String>,
        listener: Listener,
        timetoken: Option<String>,
        reply: oneshot::Sender<SubscribeOutcome>,
    },
    Unsubscribe {
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    UnsubscribeAll {
        reply: oneshot::Sender<Vec<String>>,
    },
    DisconnectAndResubscribe {
        timetoken: Option<String>,
    },
    SetAuthKey(Option<String>),
    SetResumeOnReconnect(bool),
    SetSubscribeTimeout(Duration),
    SetMaxRetries(u32),
    SetRetryInterval(Duration),
    SubscribedChannels(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// State shared by every handle and the subscribe task.
struct Shared<T> {
    publish_key: String,
    subscribe_key: String,
    uuid: String,
    codec: CryptoCodec,
    auth_key: RwLock<Option<String>>,
    /// One-shot calls stay on the initial origin; only the subscribe loop
    /// rotates.
    origin: Origin,
    non_subscribe: NonSubscribeManager<T>,
}

impl<T> Shared<T> {
    fn endpoint(&self) -> Endpoint {
        Endpoint {
            origin: self.origin.url(),
            publish_key: self.publish_key.clone(),
            subscribe_key: self.subscribe_key.clone(),
            uuid: self.uuid.clone(),
            auth_key: self.auth_key.read().clone(),
        }
    }
}

/// A handle to a running client.
pub struct Client<T: Transport = ReqwestTransport> {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uuid", &self.shared.uuid)
            .field("subscribe_key", &self.shared.subscribe_key)
            .finish_non_exhaustive()
    }
}

impl Client<ReqwestTransport> {
    /// Build a client over HTTP. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new()?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport> Client<T> {
    /// Build a client over any [`Transport`]. Must be called inside a tokio
    /// runtime.
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let transport = Arc::new(transport);
        let uuid = config.resolve_uuid();
        let codec = CryptoCodec::new(config.cipher_key.as_deref());

        let shared = Arc::new(Shared {
            publish_key: config.publish_key.clone(),
            subscribe_key: config.subscribe_key.clone(),
            uuid: uuid.clone(),
            codec: codec.clone(),
            auth_key: RwLock::new(config.auth_key.clone().filter(|k| !k.is_empty())),
            origin: Origin::new(config.tls, &config.hostname, &config.domain),
            non_subscribe: NonSubscribeManager::new(
                Arc::clone(&transport),
                RetryPolicy::non_subscribe(&config),
            ),
        });

        let engine = SubscribeEngine::new(&config, uuid, codec);
        let (manager, events) = SubscribeManager::spawn(transport, RetryPolicy::subscribe(&config));
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        tracing::info!(uuid = %shared.uuid, "client started");
        tokio::spawn(run_subscribe_loop(
            engine,
            manager,
            events,
            cmd_rx,
            Arc::clone(&shared),
        ));

        Self { cmd_tx, shared }
    }

    pub fn uuid(&self) -> &str {
        &self.shared.uuid
    }

    pub fn auth_key(&self) -> Option<String> {
        self.shared.auth_key.read().clone()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Closed)
    }

    async fn ask<R>(&self, cmd: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.send(cmd(reply)).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    // ── Subscribe stream ───────────────────────────────────────────

    /// Start listening on `channels`. Events for every channel go to
    /// `listener`.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        channels: &[S],
        listener: &Listener,
    ) -> Result<SubscribeOutcome> {
        self.subscribe_from(channels, listener, None).await
    }

    /// Like [`subscribe`](Self::subscribe), starting from `timetoken`.
    pub async fn subscribe_with_timetoken<S: AsRef<str>>(
        &self,
        channels: &[S],
        listener: &Listener,
        timetoken: &str,
    ) -> Result<SubscribeOutcome> {
        self.subscribe_from(channels, listener, Some(timetoken.to_string()))
            .await
    }

    /// Listen for join/leave events on `channel`.
    pub async fn presence(&self, channel: &str, listener: &Listener) -> Result<SubscribeOutcome> {
        engine::validate_channels(&[channel])?;
        self.subscribe(&[format!("{channel}{PRESENCE_SUFFIX}")], listener)
            .await
    }

    async fn subscribe_from<S: AsRef<str>>(
        &self,
        channels: &[S],
        listener: &Listener,
        timetoken: Option<String>,
    ) -> Result<SubscribeOutcome> {
        engine::validate_channels(channels)?;
        if listener.is_closed() {
            return Err(Error::invalid_argument("listener receiver has been dropped"));
        }
        let channels = channels.iter().map(|c| c.as_ref().to_string()).collect();
        let listener = listener.clone();
        self.ask(|reply| Command::Subscribe {
            channels,
            listener,
            timetoken,
            reply,
        })
        .await
    }

    /// Stop listening on `channels`. Returns the channels that were
    /// actually subscribed; unknown names are ignored.
    pub async fn unsubscribe<S: AsRef<str>>(&self, channels: &[S]) -> Result<Vec<String>> {
        engine::validate_channels(channels)?;
        let channels = channels.iter().map(|c| c.as_ref().to_string()).collect();
        self.ask(|reply| Command::Unsubscribe { channels, reply })
            .await
    }

    pub async fn unsubscribe_presence(&self, channel: &str) -> Result<Vec<String>> {
        engine::validate_channels(&[channel])?;
        self.unsubscribe(&[format!("{channel}{PRESENCE_SUFFIX}")])
            .await
    }

    pub async fn unsubscribe_all(&self) -> Result<Vec<String>> {
        self.ask(|reply| Command::UnsubscribeAll { reply }).await
    }

    /// Channels currently registered, in wire order.
    pub async fn subscribed_channels(&self) -> Result<Vec<String>> {
        self.ask(Command::SubscribedChannels).await
    }

    /// Tear the stream down and re-establish it. Every channel receives
    /// [`Error::Disconnected`] first.
    pub async fn disconnect_and_resubscribe(&self) -> Result<()> {
        self.send(Command::DisconnectAndResubscribe { timetoken: None })
            .await
    }

    /// As [`disconnect_and_resubscribe`](Self::disconnect_and_resubscribe),
    /// resuming from `timetoken` when resume-on-reconnect is enabled.
    pub async fn disconnect_and_resubscribe_with_timetoken(&self, timetoken: &str) -> Result<()> {
        self.send(Command::DisconnectAndResubscribe {
            timetoken: Some(timetoken.to_string()),
        })
        .await
    }

    // ── Settings ───────────────────────────────────────────────────

    /// Replace the access token. Restarts the stream with the new token.
    pub async fn set_auth_key(&self, auth_key: Option<&str>) -> Result<()> {
        let auth_key = auth_key.filter(|k| !k.is_empty()).map(str::to_string);
        *self.shared.auth_key.write() = auth_key.clone();
        self.send(Command::SetAuthKey(auth_key)).await
    }

    pub async fn set_resume_on_reconnect(&self, resume: bool) -> Result<()> {
        self.send(Command::SetResumeOnReconnect(resume)).await
    }

    /// Change the long-poll timeout. Restarts the stream.
    pub async fn set_subscribe_timeout(&self, timeout: Duration) -> Result<()> {
        self.send(Command::SetSubscribeTimeout(timeout)).await
    }

    pub async fn set_max_retries(&self, max_retries: u32) -> Result<()> {
        self.send(Command::SetMaxRetries(max_retries)).await
    }

    pub async fn set_retry_interval(&self, interval: Duration) -> Result<()> {
        self.send(Command::SetRetryInterval(interval)).await
    }

    pub fn set_non_subscribe_timeout(&self, timeout: Duration) {
        self.shared.non_subscribe.set_request_timeout(timeout);
    }

    /// Stop the subscribe loop and cancel the in-flight poll. Every handle
    /// fails with [`Error::Closed`] afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    // ── One-shot calls ─────────────────────────────────────────────

    /// Publish `message` to `channel`, encrypted when a cipher key is set.
    pub async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<PublishReceipt> {
        check_channel(channel)?;
        let wire = self.shared.codec.encode_message(message)?;
        let request = self.shared.endpoint().publish(channel, &wire);
        let body = self.shared.non_subscribe.request(&request).await?;
        operations::parse_publish(&body)
    }

    /// The last `limit` messages stored for `channel`.
    pub async fn history(&self, channel: &str, limit: u32) -> Result<Vec<Payload>> {
        check_channel(channel)?;
        let request = self.shared.endpoint().history(channel, limit);
        let body = self.shared.non_subscribe.request(&request).await?;
        operations::parse_history(&body, &self.shared.codec)
    }

    pub async fn detailed_history(&self, channel: &str, query: &HistoryQuery) -> Result<HistoryPage> {
        check_channel(channel)?;
        let request = self.shared.endpoint().detailed_history(channel, query);
        let body = self.shared.non_subscribe.request(&request).await?;
        operations::parse_detailed_history(&body, &self.shared.codec)
    }

    pub async fn here_now(&self, channel: &str) -> Result<HereNow> {
        check_channel(channel)?;
        let request = self.shared.endpoint().here_now(channel);
        let body = self.shared.non_subscribe.request(&request).await?;
        operations::parse_here_now(&body)
    }

    /// Current server timetoken.
    pub async fn time(&self) -> Result<String> {
        let request = self.shared.endpoint().time();
        let body = self.shared.non_subscribe.request(&request).await?;
        operations::parse_time(&body)
    }
}

fn check_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(Error::invalid_argument("channel missing"));
    }
    Ok(())
}

async fn run_subscribe_loop<T: Transport>(
    mut engine: SubscribeEngine,
    manager: SubscribeManager,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared<T>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("all client handles dropped");
                    break;
                };
                match cmd {
                    Command::Subscribe { channels, listener, timetoken, reply } => {
                        let (outcome, step) = engine.subscribe(&channels, listener, timetoken.as_deref());
                        apply(&manager, step);
                        let _ = reply.send(outcome);
                    }
                    Command::Unsubscribe { channels, reply } => {
                        let (removed, step) = engine.unsubscribe(&channels);
                        apply(&manager, step);
                        send_leaves(&shared, &removed);
                        let _ = reply.send(removed);
                    }
                    Command::UnsubscribeAll { reply } => {
                        let (removed, step) = engine.unsubscribe_all();
                        apply(&manager, step);
                        send_leaves(&shared, &removed);
                        let _ = reply.send(removed);
                    }
                    Command::DisconnectAndResubscribe { timetoken } => {
                        let step = match timetoken {
                            Some(tt) => engine.disconnect_and_resubscribe_with_timetoken(&tt, Error::Disconnected),
                            None => engine.disconnect_and_resubscribe(Error::Disconnected),
                        };
                        apply(&manager, step);
                    }
                    Command::SetAuthKey(auth_key) => {
                        let step = engine.set_auth_key(auth_key);
                        apply(&manager, step);
                    }
                    Command::SetResumeOnReconnect(resume) => engine.set_resume_on_reconnect(resume),
                    Command::SetSubscribeTimeout(timeout) => {
                        manager.set_request_timeout(timeout);
                        let step = engine.disconnect_and_resubscribe(Error::Disconnected);
                        apply(&manager, step);
                    }
                    Command::SetMaxRetries(max_retries) => manager.set_max_retries(max_retries),
                    Command::SetRetryInterval(interval) => {
                        manager.set_retry_interval(interval);
                        engine.set_retry_interval(interval);
                    }
                    Command::SubscribedChannels(reply) => {
                        let _ = reply.send(engine.registry().names());
                    }
                    Command::Shutdown => {
                        tracing::info!("client shutting down");
                        break;
                    }
                }
            }
            Some(event) = events.recv() => {
                let step = match event {
                    ManagerEvent::TimedOut { request, attempt } => {
                        tracing::debug!(attempt, "subscribe attempt timed out");
                        engine.on_timeout(&request)
                    }
                    ManagerEvent::Finished { request, result: Ok(body) } => {
                        engine.on_response(&request, &body)
                    }
                    ManagerEvent::Finished { request, result: Err(err) } => {
                        engine.on_failure(&request, err)
                    }
                };
                apply(&manager, step);
            }
        }
    }
    manager.reset_and_abort();
}

fn apply(manager: &SubscribeManager, step: Step) {
    match step {
        Step::Poll {
            request,
            abort_in_flight,
        } => {
            if abort_in_flight {
                manager.reset_and_abort();
            }
            manager.queue(request);
        }
        Step::Backoff { request, delay } => manager.queue_after(request, delay),
        Step::Halt { abort_in_flight } => {
            if abort_in_flight {
                manager.reset_and_abort();
            }
        }
        Step::Wait => {}
    }
}

/// Fire-and-forget presence leave for each channel.
fn send_leaves<T: Transport>(shared: &Arc<Shared<T>>, channels: &[String]) {
    for channel in channels {
        let shared = Arc::clone(shared);
        let request = shared.endpoint().leave(channel);
        tokio::spawn(async move {
            if let Err(err) = shared.non_subscribe.request(&request).await {
                tracing::debug!(error = %err, url = %request.url(), "leave failed");
            }
        });
    }
}
