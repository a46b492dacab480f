//! Client configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for a [`Client`](crate::client::Client).
///
/// Fields map one-to-one onto the service's configuration surface. All
/// fields have defaults, so hosts can deserialize a partial document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Key required to publish.
    pub publish_key: String,
    /// Key required to subscribe and to read history and presence.
    pub subscribe_key: String,
    /// Secret used for publish signing. Signing is not performed; the
    /// field is carried so configurations round-trip.
    pub secret_key: String,
    /// Shared message encryption key. Empty disables encryption.
    pub cipher_key: Option<String>,
    /// Use `https` origins.
    pub tls: bool,
    /// Client identity sent with every subscribe and leave. Generated when
    /// not set.
    pub uuid: Option<String>,
    /// Access token appended as `auth=` when set.
    pub auth_key: Option<String>,
    /// Resume from the last known timetoken after a reconnect instead of
    /// starting over from "now".
    pub resume_on_reconnect: bool,
    /// Hostname prefix of the origin (`{hostname}-{suffix}.{domain}`).
    pub hostname: String,
    pub domain: String,
    /// Client-side cap on one long-poll.
    #[serde(with = "millis")]
    pub subscribe_timeout: Duration,
    /// Cap on publish/history/presence/time requests.
    #[serde(with = "millis")]
    pub non_subscribe_timeout: Duration,
    /// Attempts after the first one before the subscribe manager gives up.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            publish_key: String::new(),
            subscribe_key: String::new(),
            secret_key: String::new(),
            cipher_key: None,
            tls: true,
            uuid: None,
            auth_key: None,
            resume_on_reconnect: false,
            hostname: "pubsub".to_string(),
            domain: "pubnub.com".to_string(),
            subscribe_timeout: Duration::from_secs(310),
            non_subscribe_timeout: Duration::from_secs(15),
            max_retries: 5,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(publish_key: &str, subscribe_key: &str) -> Self {
        Self {
            publish_key: publish_key.to_string(),
            subscribe_key: subscribe_key.to_string(),
            ..Self::default()
        }
    }

    /// The configured UUID, or a freshly generated one.
    pub(crate) fn resolve_uuid(&self) -> String {
        match &self.uuid {
            Some(uuid) if !uuid.is_empty() => uuid.clone(),
            _ => generate_uuid(),
        }
    }
}

/// Random version-4 UUID.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
