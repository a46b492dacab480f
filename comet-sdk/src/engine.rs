//! The subscribe engine: a synchronous state machine over the long-poll
//! chain.
//!
//! The engine never performs I/O. Every entry point returns a [`Step`]
//! telling the driver what to do with the subscribe manager next, which
//! keeps the whole protocol testable without a network.
//!
//! ```text
//!            subscribe               response
//!   Idle ──────────────► Polling ───────────► Dispatching ──► Polling
//!    ▲                    │  ▲
//!    │ last unsubscribe   │  │ restart
//!    └────────────────────┤  │
//!                         └─►Recovering (error / topology change)
//! ```

use std::time::Duration;

use serde_json::Value;

use crate::config::ClientConfig;
use crate::crypto::{CryptoCodec, is_presence_channel};
use crate::error::{Error, Result};
use crate::event::{Event, Listener, Payload};
use crate::generation::Generations;
use crate::registry::{AddOutcome, ChannelRegistry, Notice};
use crate::request::{Origin, Request, RequestKind};

/// "Start now, no history."
pub const BOOTSTRAP_TIMETOKEN: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub timetoken: String,
    /// Position captured before a disconnect; "0" when nothing is saved.
    pub saved_timetoken: String,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            timetoken: BOOTSTRAP_TIMETOKEN.to_string(),
            saved_timetoken: BOOTSTRAP_TIMETOKEN.to_string(),
        }
    }
}

impl CursorState {
    fn save_current(&mut self) {
        if self.timetoken != BOOTSTRAP_TIMETOKEN {
            self.saved_timetoken = self.timetoken.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Polling,
    Dispatching,
    Recovering,
}

/// What the driver should do next.
#[derive(Debug)]
pub enum Step {
    /// Queue this poll, superseding the in-flight one if asked to.
    Poll {
        request: Request,
        abort_in_flight: bool,
    },
    /// Queue this poll once `delay` has passed.
    Backoff { request: Request, delay: Duration },
    /// Stop polling.
    Halt { abort_in_flight: bool },
    /// Nothing to do; the manager keeps going on its own.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Every requested channel is already connected.
    AlreadyListening,
}

/// A parsed `[messages, next_timetoken, channel_csv?]` reply.
#[derive(Debug)]
struct PollResponse {
    messages: Vec<Value>,
    next_timetoken: String,
    channels: Option<Vec<String>>,
}

fn parse_response(body: &str) -> Result<PollResponse> {
    let value: Value = serde_json::from_str(body).map_err(|e| Error::Parsing(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(Error::Parsing("subscribe reply is not an array".into()));
    };
    if items.len() < 2 {
        return Err(Error::Parsing(format!(
            "subscribe reply has {} elements",
            items.len()
        )));
    }

    let channels = match items.get(2) {
        Some(Value::String(csv)) => Some(csv.split(',').map(str::to_string).collect()),
        Some(other) => {
            return Err(Error::Parsing(format!("unexpected channel list {other}")));
        }
        None => None,
    };
    let next_timetoken = match &items[1] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(Error::Parsing(format!("unexpected timetoken {other}"))),
    };
    let Value::Array(messages) = items.swap_remove(0) else {
        return Err(Error::Parsing("message list is not an array".into()));
    };

    Ok(PollResponse {
        messages,
        next_timetoken,
        channels,
    })
}

/// Reject channel names before anything touches the registry.
pub fn validate_channels<S: AsRef<str>>(channels: &[S]) -> Result<()> {
    if channels.is_empty() {
        return Err(Error::invalid_argument("channel missing"));
    }
    for name in channels {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::invalid_argument("channel missing"));
        }
        if name.contains(',') {
            return Err(Error::invalid_argument(format!(
                "channel name {name:?} contains a comma"
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct SubscribeEngine {
    subscribe_key: String,
    uuid: String,
    auth_key: Option<String>,
    resume_on_reconnect: bool,
    registry: ChannelRegistry,
    cursor: CursorState,
    origin: Origin,
    generations: Generations,
    codec: CryptoCodec,
    state: EngineState,
    /// Reconnect has been announced for the current generation.
    reconnect_announced: bool,
    /// Unusable replies in a row.
    parse_failures: u32,
    retry_interval: Duration,
}

impl SubscribeEngine {
    pub fn new(config: &ClientConfig, uuid: String, codec: CryptoCodec) -> Self {
        Self {
            subscribe_key: config.subscribe_key.clone(),
            uuid,
            auth_key: config.auth_key.clone().filter(|k| !k.is_empty()),
            resume_on_reconnect: config.resume_on_reconnect,
            registry: ChannelRegistry::new(),
            cursor: CursorState::default(),
            origin: Origin::new(config.tls, &config.hostname, &config.domain),
            generations: Generations::new(),
            codec,
            state: EngineState::Idle,
            reconnect_announced: false,
            parse_failures: 0,
            retry_interval: config.retry_interval,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn generations(&self) -> &Generations {
        &self.generations
    }

    pub fn set_resume_on_reconnect(&mut self, resume: bool) {
        self.resume_on_reconnect = resume;
    }

    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    // ── Public operations ──────────────────────────────────────────

    /// Register `channels` and (re)start the loop from `timetoken`.
    pub fn subscribe<S: AsRef<str>>(
        &mut self,
        channels: &[S],
        listener: Listener,
        timetoken: Option<&str>,
    ) -> (SubscribeOutcome, Step) {
        let mut changed = false;
        for name in channels {
            match self.registry.add(name.as_ref(), listener.clone()) {
                AddOutcome::Added | AddOutcome::Pending => changed = true,
                AddOutcome::AlreadyListening => {
                    tracing::debug!(channel = name.as_ref(), "already listening");
                }
            }
        }
        if !changed {
            return (SubscribeOutcome::AlreadyListening, Step::Wait);
        }

        self.cursor.save_current();
        self.cursor.timetoken = timetoken
            .filter(|t| !t.is_empty())
            .unwrap_or(BOOTSTRAP_TIMETOKEN)
            .to_string();

        if self.state != EngineState::Idle {
            self.origin.rotate();
        }
        self.start_generation();
        (SubscribeOutcome::Subscribed, self.poll(false, true))
    }

    /// Drop `channels`. Returns the names that were actually removed.
    pub fn unsubscribe<S: AsRef<str>>(&mut self, channels: &[S]) -> (Vec<String>, Step) {
        let removed = self.registry.remove(channels);
        if removed.is_empty() {
            return (removed, Step::Wait);
        }
        tracing::info!(channels = ?removed, "unsubscribed");
        if self.registry.is_empty() {
            return (removed, self.go_idle());
        }
        (removed, self.resubscribe(None))
    }

    pub fn unsubscribe_all(&mut self) -> (Vec<String>, Step) {
        let removed = self.registry.remove_all();
        if removed.is_empty() {
            return (removed, Step::Wait);
        }
        tracing::info!(channels = ?removed, "unsubscribed from everything");
        (removed, self.go_idle())
    }

    pub fn set_auth_key(&mut self, auth_key: Option<String>) -> Step {
        self.auth_key = auth_key.filter(|k| !k.is_empty());
        self.resubscribe(None)
    }

    /// Tell every channel the stream is being torn down, then recover.
    pub fn disconnect_and_resubscribe(&mut self, error: Error) -> Step {
        tracing::info!(%error, "disconnect and resubscribe");
        self.registry
            .invoke_on_all(&Notice::Error(error), &self.cursor.timetoken.clone());
        self.resubscribe(None)
    }

    /// As [`disconnect_and_resubscribe`](Self::disconnect_and_resubscribe),
    /// resuming from `timetoken` when resume-on-reconnect is enabled.
    pub fn disconnect_and_resubscribe_with_timetoken(&mut self, timetoken: &str, error: Error) -> Step {
        tracing::info!(%error, timetoken, "disconnect and resubscribe");
        self.registry.invoke_on_all(&Notice::Error(error), timetoken);
        self.resubscribe(Some(timetoken))
    }

    // ── Manager outcomes ───────────────────────────────────────────

    pub fn on_response(&mut self, request: &Request, body: &str) -> Step {
        if !request.is_live() {
            tracing::debug!("dropping response from a superseded generation");
            return Step::Wait;
        }
        self.state = EngineState::Dispatching;

        let response = match parse_response(body) {
            Ok(response) => response,
            Err(err) => return self.repoll_after_unusable_reply(request, err),
        };
        self.parse_failures = 0;

        let effective = if self.resume_on_reconnect && self.cursor.saved_timetoken != BOOTSTRAP_TIMETOKEN {
            self.cursor.saved_timetoken.clone()
        } else {
            response.next_timetoken.clone()
        };
        tracing::debug!(
            next = %response.next_timetoken,
            saved = %self.cursor.saved_timetoken,
            effective = %effective,
            "advancing cursor"
        );
        self.cursor.timetoken = effective.clone();
        self.cursor.saved_timetoken = BOOTSTRAP_TIMETOKEN.to_string();

        if request.is_recovery_replay && !self.reconnect_announced {
            self.registry.invoke_on_all(&Notice::Reconnect, &effective);
            self.reconnect_announced = true;
        }
        self.registry.invoke_on_all(&Notice::Connect, &effective);

        match response.channels {
            Some(names) => {
                if names.len() != response.messages.len() {
                    tracing::warn!(
                        channels = names.len(),
                        messages = response.messages.len(),
                        "channel list and message list disagree"
                    );
                }
                for (name, message) in names.iter().zip(response.messages) {
                    self.dispatch(request, name, message);
                }
            }
            None => {
                if let Some(first) = self.registry.first().map(|c| c.name.clone()) {
                    for message in response.messages {
                        self.dispatch(request, &first, message);
                    }
                }
            }
        }

        self.poll(request.is_bootstrap && request.is_recovery_replay, false)
    }

    /// One attempt timed out. The manager decides whether to retry.
    pub fn on_timeout(&mut self, request: &Request) -> Step {
        if !request.is_live() {
            return Step::Wait;
        }
        let timetoken = if !self.resume_on_reconnect {
            BOOTSTRAP_TIMETOKEN.to_string()
        } else if self.cursor.saved_timetoken != BOOTSTRAP_TIMETOKEN {
            self.cursor.saved_timetoken.clone()
        } else {
            self.cursor.timetoken.clone()
        };
        tracing::info!(%timetoken, "subscribe timed out, notifying channels");
        self.registry.invoke_on_all(&Notice::Disconnect, &timetoken);
        Step::Wait
    }

    /// The manager gave up on `request`.
    pub fn on_failure(&mut self, request: &Request, error: Error) -> Step {
        if !request.is_live() {
            return Step::Wait;
        }
        match error {
            Error::Timeout => {
                tracing::warn!("subscribe retries exhausted, stopping until the next change");
                self.registry
                    .invoke_on_all(&Notice::Error(Error::Timeout), &self.cursor.timetoken.clone());
                self.state = EngineState::Idle;
                Step::Halt {
                    abort_in_flight: false,
                }
            }
            error => {
                tracing::warn!(%error, "subscribe failed, recovering");
                self.disconnect_and_resubscribe(error)
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// The first unusable reply is re-polled at once; a run of them waits
    /// `retry_interval` between polls.
    fn repoll_after_unusable_reply(&mut self, request: &Request, err: Error) -> Step {
        self.parse_failures += 1;
        if self.parse_failures == 1 {
            tracing::debug!(error = %err, "unusable subscribe reply, polling again");
            return self.poll(request.is_recovery_replay, false);
        }
        tracing::warn!(
            error = %err,
            failures = self.parse_failures,
            delay = ?self.retry_interval,
            "subscribe replies keep failing to parse, backing off"
        );
        match self.poll(request.is_recovery_replay, false) {
            Step::Poll { request, .. } => Step::Backoff {
                request,
                delay: self.retry_interval,
            },
            other => other,
        }
    }

    fn start_generation(&mut self) {
        let generation = self.generations.advance();
        self.reconnect_announced = false;
        self.parse_failures = 0;
        tracing::debug!(generation = generation.id(), "new subscribe generation");
    }

    /// Rotate origin, park the cursor, new generation, poll again.
    fn resubscribe(&mut self, timetoken: Option<&str>) -> Step {
        if self.registry.is_empty() {
            return self.go_idle();
        }
        self.state = EngineState::Recovering;
        self.origin.rotate();
        match timetoken {
            Some(tt) if tt != BOOTSTRAP_TIMETOKEN => self.cursor.saved_timetoken = tt.to_string(),
            Some(_) => {}
            None => self.cursor.save_current(),
        }
        self.cursor.timetoken = BOOTSTRAP_TIMETOKEN.to_string();
        tracing::debug!(saved = %self.cursor.saved_timetoken, "resubscribing");
        self.start_generation();
        self.poll(true, true)
    }

    fn go_idle(&mut self) -> Step {
        self.cursor.save_current();
        self.cursor.timetoken = BOOTSTRAP_TIMETOKEN.to_string();
        self.generations.advance();
        self.state = EngineState::Idle;
        Step::Halt {
            abort_in_flight: true,
        }
    }

    fn poll(&mut self, recovery_replay: bool, abort_in_flight: bool) -> Step {
        if self.registry.is_empty() {
            self.state = EngineState::Idle;
            return Step::Halt { abort_in_flight };
        }
        let Some(channel_list) = self.registry.channel_list() else {
            tracing::warn!("channel list could not be built");
            self.registry.invoke_on_all(
                &Notice::Error(Error::Parsing("channel list could not be built".into())),
                &self.cursor.timetoken.clone(),
            );
            self.state = EngineState::Idle;
            return Step::Halt { abort_in_flight };
        };

        let mut request = Request::new(RequestKind::Subscribe, self.origin.url())
            .literal("subscribe")
            .literal(self.subscribe_key.as_str())
            .encoded(channel_list)
            .literal("0")
            .literal(self.cursor.timetoken.as_str())
            .param("uuid", self.uuid.as_str());
        if let Some(auth) = &self.auth_key {
            request = request.param("auth", auth.as_str());
        }
        request.is_bootstrap = self.cursor.timetoken == BOOTSTRAP_TIMETOKEN;
        request.is_recovery_replay = recovery_replay;
        let generation = self.generations.current();
        tracing::debug!(
            timetoken = %self.cursor.timetoken,
            generation = generation.id(),
            bootstrap = request.is_bootstrap,
            replay = recovery_replay,
            "subscribing"
        );
        request.generation = Some(generation);

        self.state = EngineState::Polling;
        Step::Poll {
            request,
            abort_in_flight,
        }
    }

    fn dispatch(&self, request: &Request, channel: &str, message: Value) {
        if !request.is_live() {
            return;
        }
        let decoded = if is_presence_channel(channel) {
            Ok(Payload::from_value(message))
        } else {
            self.codec.decode_message(message)
        };
        let event = match decoded {
            Ok(payload) => Event::Message {
                channel: channel.to_string(),
                payload,
            },
            Err(err) => {
                tracing::debug!(channel, error = %err, "message failed to decrypt");
                Event::Error {
                    channel: channel.to_string(),
                    error: Error::Decryption(err),
                }
            }
        };
        if self.registry.deliver(channel, event).is_none() {
            tracing::warn!(channel, "message for a channel that is not registered");
        }
    }
}
