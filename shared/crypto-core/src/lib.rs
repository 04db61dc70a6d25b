//! Symmetric message encryption for DeskChat conversations.
//!
//! Every conversation owns a chain of AES-256-GCM keys. The newest key in the
//! chain encrypts outbound content; older keys stay in the table so history
//! sealed before a rotation can still be opened by key id.

pub mod service;

pub use service::{EncryptionKey, EncryptionService};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the random nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended by the cipher.
pub const TAG_LEN: usize = 16;

/// Shown in place of content whose key is unknown or whose payload is damaged.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[Unable to decrypt message]";

/// Result type exposed by crypto-core APIs.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors returned by the crypto core.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption not initialized for conversation {0}")]
    NotInitialized(String),
    #[error("unknown key id {0}")]
    UnknownKey(KeyId),
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Identifier of a single key in the key table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub(crate) fn for_conversation(conversation_id: &str, version: u32) -> Self {
        Self(format!(
            "{conversation_id}:v{version}:{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of [`EncryptionService::encrypt_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedContent {
    /// `base64(nonce || ciphertext || tag)`
    pub encrypted_content: String,
    pub key_id: KeyId,
}

/// Encrypts `plaintext` under `key` with a fresh random nonce.
///
/// The nonce is packed in front of the ciphertext so the result can be
/// opened with nothing but the key.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Internal(format!("failed to create cipher: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Internal(format!("encryption failed: {e}")))?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(packed))
}

/// Reverses [`seal`].
pub fn open(key: &[u8; KEY_LEN], sealed: &str) -> Result<Vec<u8>> {
    let packed = general_purpose::STANDARD
        .decode(sealed)
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    if packed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidCiphertext);
    }

    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Internal(format!("failed to create cipher: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; KEY_LEN] {
        [byte; KEY_LEN]
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let sealed = seal(&key(7), b"hello support").unwrap();
        let opened = open(&key(7), &sealed).unwrap();
        assert_eq!(opened, b"hello support");
    }

    #[test]
    fn sealed_payload_layout_is_nonce_ciphertext_tag() {
        let sealed = seal(&key(1), b"abc").unwrap();
        let raw = general_purpose::STANDARD.decode(sealed).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + 3 + TAG_LEN);
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let first = seal(&key(2), b"same text").unwrap();
        let second = seal(&key(2), b"same text").unwrap();
        assert_ne!(first, second);

        let first_raw = general_purpose::STANDARD.decode(first).unwrap();
        let second_raw = general_purpose::STANDARD.decode(second).unwrap();
        assert_ne!(first_raw[..NONCE_LEN], second_raw[..NONCE_LEN]);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&key(3), b"secret").unwrap();
        assert!(matches!(
            open(&key(4), &sealed),
            Err(CryptoError::InvalidCiphertext)
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let short = general_purpose::STANDARD.encode([0u8; NONCE_LEN]);
        assert!(matches!(
            open(&key(5), &short),
            Err(CryptoError::InvalidCiphertext)
        ));
        assert!(matches!(
            open(&key(5), "not base64 !!"),
            Err(CryptoError::InvalidCiphertext)
        ));
    }

    #[test]
    fn encrypted_content_uses_camel_case_fields() {
        let content = EncryptedContent {
            encrypted_content: "abc".into(),
            key_id: KeyId::from("conv:v1:x"),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["encryptedContent"], "abc");
        assert_eq!(json["keyId"], "conv:v1:x");
    }
}
