//! Stateless request/response calls: publish, history, presence and time.
//!
//! Each call is a request builder plus a reply parser. The client runs
//! them over the non-subscribe manager; nothing here touches the subscribe
//! loop.

use serde::Deserialize;
use serde_json::Value;

use crate::crypto::CryptoCodec;
use crate::error::{Error, Result};
use crate::event::Payload;
use crate::request::{Request, RequestKind};

/// Publish signing is not performed.
const UNSIGNED: &str = "0";

/// Page size the service uses when none is requested.
pub const DEFAULT_HISTORY_COUNT: u32 = 100;

/// Identity and credentials shared by every one-shot call.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub origin: String,
    pub publish_key: String,
    pub subscribe_key: String,
    pub uuid: String,
    pub auth_key: Option<String>,
}

impl Endpoint {
    fn request(&self, kind: RequestKind) -> Request {
        Request::new(kind, self.origin.clone())
    }

    fn with_auth(&self, request: Request) -> Request {
        match &self.auth_key {
            Some(auth) => request.param("auth", auth.as_str()),
            None => request,
        }
    }

    /// `message` is already serialized (and encrypted) for the wire.
    pub fn publish(&self, channel: &str, message: &str) -> Request {
        let request = self
            .request(RequestKind::Publish)
            .literal("publish")
            .literal(self.publish_key.as_str())
            .literal(self.subscribe_key.as_str())
            .literal(UNSIGNED)
            .encoded(channel)
            .literal("0")
            .encoded(message);
        self.with_auth(request)
    }

    pub fn history(&self, channel: &str, limit: u32) -> Request {
        let request = self
            .request(RequestKind::History)
            .literal("history")
            .literal(self.subscribe_key.as_str())
            .encoded(channel)
            .literal("0")
            .literal(limit.to_string());
        self.with_auth(request)
    }

    pub fn detailed_history(&self, channel: &str, query: &HistoryQuery) -> Request {
        let mut request = self
            .request(RequestKind::DetailedHistory)
            .literal("v2")
            .literal("history")
            .literal("sub-key")
            .literal(self.subscribe_key.as_str())
            .literal("channel")
            .encoded(channel)
            .param("count", query.count.unwrap_or(DEFAULT_HISTORY_COUNT).to_string())
            .param("reverse", query.reverse.to_string());
        if let Some(start) = query.start {
            request = request.param("start", start.to_string());
        }
        if let Some(end) = query.end {
            request = request.param("end", end.to_string());
        }
        self.with_auth(request)
    }

    pub fn here_now(&self, channel: &str) -> Request {
        let request = self
            .request(RequestKind::HereNow)
            .literal("v2")
            .literal("presence")
            .literal("sub_key")
            .literal(self.subscribe_key.as_str())
            .literal("channel")
            .encoded(channel);
        self.with_auth(request)
    }

    pub fn time(&self) -> Request {
        let request = self.request(RequestKind::Time).literal("time").literal("0");
        self.with_auth(request)
    }

    /// Leave carries the identity only.
    pub fn leave(&self, channel: &str) -> Request {
        self.request(RequestKind::Leave)
            .literal("v2")
            .literal("presence")
            .literal("sub_key")
            .literal(self.subscribe_key.as_str())
            .literal("channel")
            .encoded(channel)
            .literal("leave")
            .param("uuid", self.uuid.as_str())
    }
}

/// Options for [`Client::detailed_history`](crate::client::Client::detailed_history).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Timetoken to start from (exclusive).
    pub start: Option<u64>,
    /// Timetoken to stop at (inclusive).
    pub end: Option<u64>,
    /// Defaults to [`DEFAULT_HISTORY_COUNT`].
    pub count: Option<u32>,
    /// Oldest first.
    pub reverse: bool,
}

/// One page of stored messages and the timetoken range it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<Payload>,
    pub start: String,
    pub end: String,
}

/// Acknowledgement of a publish, e.g. `[1,"Sent","13769502243124018"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub status: i64,
    pub description: String,
    pub timetoken: String,
}

/// Who is currently subscribed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HereNow {
    pub occupancy: u64,
    #[serde(default)]
    pub uuids: Vec<String>,
}

fn parse_json(body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| Error::Parsing(e.to_string()))
}

fn timetoken_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Parsing(format!("unexpected timetoken {other}"))),
    }
}

fn decode_all(codec: &CryptoCodec, messages: Vec<Value>) -> Result<Vec<Payload>> {
    messages
        .into_iter()
        .map(|m| codec.decode_message(m).map_err(Error::from))
        .collect()
}

pub(crate) fn parse_publish(body: &str) -> Result<PublishReceipt> {
    let Value::Array(items) = parse_json(body)? else {
        return Err(Error::Parsing("publish reply is not an array".into()));
    };
    let status = items
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Parsing("publish reply has no status".into()))?;
    let description = items
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timetoken = match items.get(2) {
        Some(value) => timetoken_text(value)?,
        None => String::new(),
    };
    Ok(PublishReceipt {
        status,
        description,
        timetoken,
    })
}

pub(crate) fn parse_history(body: &str, codec: &CryptoCodec) -> Result<Vec<Payload>> {
    let Value::Array(messages) = parse_json(body)? else {
        return Err(Error::Parsing("history reply is not an array".into()));
    };
    decode_all(codec, messages)
}

/// `[[messages...], start, end]`
pub(crate) fn parse_detailed_history(body: &str, codec: &CryptoCodec) -> Result<HistoryPage> {
    let Value::Array(mut items) = parse_json(body)? else {
        return Err(Error::Parsing("history reply is not an array".into()));
    };
    if items.len() < 3 {
        return Err(Error::Parsing(format!(
            "history reply has {} elements",
            items.len()
        )));
    }
    let start = timetoken_text(&items[1])?;
    let end = timetoken_text(&items[2])?;
    let Value::Array(messages) = items.swap_remove(0) else {
        return Err(Error::Parsing("history messages are not an array".into()));
    };
    Ok(HistoryPage {
        messages: decode_all(codec, messages)?,
        start,
        end,
    })
}

/// `{"uuids": [...], "occupancy": n}`
pub(crate) fn parse_here_now(body: &str) -> Result<HereNow> {
    let value = parse_json(body)?;
    if !value.is_object() {
        return Err(Error::Parsing(format!("unexpected presence reply {value}")));
    }
    serde_json::from_value(value).map_err(|e| Error::Parsing(e.to_string()))
}

/// `[15000000000000000]`
pub(crate) fn parse_time(body: &str) -> Result<String> {
    match parse_json(body)? {
        Value::Array(items) if !items.is_empty() => timetoken_text(&items[0]),
        other => Err(Error::Parsing(format!("unexpected time reply {other}"))),
    }
}
