//! Origin selection and protocol request descriptors.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::generation::Generation;

/// Everything except RFC 3986 unreserved characters.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, ENCODE_SET).to_string()
}

/// `{scheme}://{hostname}-{suffix}.{domain}`. The suffix is re-rolled on
/// every recovery so repeated failures do not keep hitting the same path.
#[derive(Debug, Clone)]
pub struct Origin {
    tls: bool,
    hostname: String,
    domain: String,
    suffix: u32,
}

impl Origin {
    pub fn new(tls: bool, hostname: &str, domain: &str) -> Self {
        Self {
            tls,
            hostname: hostname.to_string(),
            domain: domain.to_string(),
            suffix: 1,
        }
    }

    /// Always lands on a different host.
    pub fn rotate(&mut self) {
        let next: u32 = rand::random();
        self.suffix = if next == self.suffix { next.wrapping_add(1) } else { next };
        tracing::debug!(origin = %self.url(), "origin rotated");
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}-{}.{}", self.hostname, self.suffix, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Sent as is.
    Literal(String),
    /// Percent-encoded.
    Encoded(String),
}

/// What the request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe,
    Leave,
    Publish,
    History,
    DetailedHistory,
    HereNow,
    Time,
}

/// One protocol request plus the loop-control flags the subscribe engine
/// needs back when the response arrives.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    pub origin: String,
    pub path: Vec<Segment>,
    pub query: Vec<(String, String)>,
    /// Issued with timetoken "0".
    pub is_bootstrap: bool,
    /// Issued as part of a disconnect-and-resubscribe cycle.
    pub is_recovery_replay: bool,
    pub generation: Option<Generation>,
}

impl Request {
    pub fn new(kind: RequestKind, origin: String) -> Self {
        Self {
            kind,
            origin,
            path: Vec::new(),
            query: Vec::new(),
            is_bootstrap: false,
            is_recovery_replay: false,
            generation: None,
        }
    }

    pub fn literal(mut self, segment: impl Into<String>) -> Self {
        self.path.push(Segment::Literal(segment.into()));
        self
    }

    pub fn encoded(mut self, segment: impl Into<String>) -> Self {
        self.path.push(Segment::Encoded(segment.into()));
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// The request is stale once its generation has been superseded.
    /// Requests outside the subscribe loop carry no generation and are
    /// always live.
    pub fn is_live(&self) -> bool {
        self.generation.as_ref().is_none_or(Generation::is_live)
    }

    /// The timetoken segment of a subscribe request.
    pub fn timetoken(&self) -> Option<&str> {
        if self.kind != RequestKind::Subscribe {
            return None;
        }
        match self.path.last()? {
            Segment::Literal(s) | Segment::Encoded(s) => Some(s),
        }
    }

    pub fn url(&self) -> String {
        let mut url = self.origin.clone();
        for segment in &self.path {
            url.push('/');
            match segment {
                Segment::Literal(s) => url.push_str(s),
                Segment::Encoded(s) => url.push_str(&url_encode(s)),
            }
        }
        for (i, (key, value)) in self.query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&url_encode(key));
            url.push('=');
            url.push_str(&url_encode(value));
        }
        url
    }
}
