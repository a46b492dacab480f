//! Events emitted by the subscribe loop for listeners to consume.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Error;

/// A delivered message body.
///
/// Payloads that parse as JSON arrays, objects, numbers or booleans are
/// [`Payload::Structured`]; bare strings stay [`Payload::Text`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(serde_json::Value),
    Text(String),
}

impl Payload {
    /// Interpret decrypted plaintext.
    pub fn from_plaintext(text: String) -> Self {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::String(s)) => Payload::Text(s),
            Ok(value) => Payload::Structured(value),
            Err(_) => Payload::Text(text),
        }
    }

    /// Interpret a message element taken directly off the wire.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Payload::Text(s),
            other => Payload::Structured(other),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Structured(_) => None,
        }
    }
}

/// Events delivered to a [`Listener`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A message published on `channel`.
    Message { channel: String, payload: Payload },

    /// Something went wrong for `channel`: a message failed to decrypt, or
    /// the whole stream failed and is being recovered.
    Error { channel: String, error: Error },

    /// First successful poll including `channel`.
    Connected { channel: String, timetoken: String },

    /// The stream timed out; `timetoken` is where it will resume from, or
    /// `"0"` when resume-on-reconnect is off.
    Disconnected { channel: String, timetoken: String },

    /// The stream is flowing again after a disconnect or recovery.
    Reconnected { channel: String, timetoken: String },
}

impl Event {
    pub fn channel(&self) -> &str {
        match self {
            Event::Message { channel, .. }
            | Event::Error { channel, .. }
            | Event::Connected { channel, .. }
            | Event::Disconnected { channel, .. }
            | Event::Reconnected { channel, .. } => channel,
        }
    }
}

/// The sending half handed to `subscribe`. Every channel subscribed with
/// the same listener reports into the same receiver.
#[derive(Debug, Clone)]
pub struct Listener {
    tx: mpsc::UnboundedSender<Event>,
}

impl Listener {
    /// Create a listener and the receiver its events arrive on.
    pub fn channel() -> (Listener, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Listener { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Never blocks. A receiver that has gone away is not an error for the
    /// stream, the event is just dropped.
    pub(crate) fn emit(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            tracing::debug!(channel = err.0.channel(), "listener hung up, dropping event");
        }
    }
}
