//! Error types surfaced by the SDK.
//!
//! Everything that can go wrong on the subscribe stream is delivered to
//! listeners as [`Event::Error`](crate::event::Event::Error), so [`Error`]
//! is `Clone` and carries no foreign error values.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Parsing(String),

    #[error(transparent)]
    Encryption(#[from] EncryptError),

    #[error(transparent)]
    Decryption(#[from] DecryptError),

    /// Network, DNS or TLS failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("unexpected HTTP status {status}")]
    Http { status: u16 },

    #[error("request timed out")]
    Timeout,

    /// Rejected before any network activity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The subscribe stream was torn down and is being re-established.
    #[error("disconnected, resubscribing")]
    Disconnected,

    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if let Some(status) = err.status() {
            Error::Http { status: status.as_u16() }
        } else {
            Error::Transport(err.to_string())
        }
    }
}

/// Outbound encryption failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptError {
    #[error("encryption failed: cipher error")]
    Cipher,
    #[error("encryption failed: payload could not be serialized: {0}")]
    Serialize(String),
}

/// Inbound decryption failure. Each variant is reported separately so a
/// listener can tell a truncated payload from a forged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// Ciphertext is shorter than nonce plus tag.
    #[error("decryption failed: ciphertext length")]
    Length,
    /// Decrypted bytes are not valid UTF-8.
    #[error("decryption failed: plaintext state")]
    State,
    /// Authentication tag did not verify.
    #[error("decryption failed: invalid ciphertext")]
    Ciphertext,
    /// Payload was not valid base64.
    #[error("decryption failed: transport decode")]
    Decode,
}
