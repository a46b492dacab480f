//! Symmetric message encryption keyed by the shared cipher key.
//!
//! Uses:
//! - SHA-256 of the configured cipher key as the AES key
//! - AES-256-GCM with a random 96-bit nonce per message
//!
//! # Wire Format
//!
//! ```text
//! base64( nonce[12] || ciphertext || tag[16] )
//! ```
//!
//! Without a cipher key every operation is a pass-through.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use sha2::{Digest, Sha256};

use crate::error::{DecryptError, EncryptError};
use crate::event::Payload;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Suffix that marks a presence channel. Presence payloads are never
/// encrypted.
pub const PRESENCE_SUFFIX: &str = "-pnpres";

pub fn is_presence_channel(channel: &str) -> bool {
    channel.ends_with(PRESENCE_SUFFIX)
}

#[derive(Clone)]
pub struct CryptoCodec {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for CryptoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCodec")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl CryptoCodec {
    /// A missing or empty key disables encryption.
    pub fn new(cipher_key: Option<&str>) -> Self {
        let cipher = cipher_key.filter(|k| !k.is_empty()).map(|key| {
            let digest = Sha256::digest(key.as_bytes());
            Aes256Gcm::new(&digest)
        });
        Self { cipher }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode(&self, plaintext: &str) -> Result<String, EncryptError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_string());
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EncryptError::Cipher)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(B64.encode(wire))
    }

    pub fn decode(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_string());
        };
        let bytes = B64.decode(ciphertext.trim()).map_err(|_| DecryptError::Decode)?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptError::Length);
        }
        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| DecryptError::Ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| DecryptError::State)
    }

    /// Serialize a message for the publish path.
    ///
    /// Without a key the value is sent as JSON text, so a string keeps its
    /// quotes. With a key, strings are encrypted bare and everything else as
    /// JSON text; the ciphertext then travels as a JSON string.
    pub fn encode_message(&self, message: &serde_json::Value) -> Result<String, EncryptError> {
        if !self.is_enabled() {
            return serde_json::to_string(message)
                .map_err(|e| EncryptError::Serialize(e.to_string()));
        }
        let plaintext = match message {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let ciphertext = self.encode(&plaintext)?;
        serde_json::to_string(&ciphertext).map_err(|e| EncryptError::Serialize(e.to_string()))
    }

    /// Turn one message element off the wire into a payload.
    pub fn decode_message(&self, message: serde_json::Value) -> Result<Payload, DecryptError> {
        if !self.is_enabled() {
            return Ok(Payload::from_value(message));
        }
        let ciphertext = match message {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        self.decode(&ciphertext).map(Payload::from_plaintext)
    }
}
