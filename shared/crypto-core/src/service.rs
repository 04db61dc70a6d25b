//! Process-wide key table shared by every conversation.

use crate::{
    open, seal, CryptoError, EncryptedContent, KeyId, Result, KEY_LEN, UNDECRYPTABLE_PLACEHOLDER,
};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A single symmetric key and its position in a conversation's key chain.
pub struct EncryptionKey {
    id: KeyId,
    material: KeyMaterial,
    created_ms: i64,
    version: u32,
}

impl EncryptionKey {
    fn generate(conversation_id: &str, version: u32) -> Self {
        Self::with_material(conversation_id, version, KeyMaterial::generate())
    }

    fn with_material(conversation_id: &str, version: u32, material: KeyMaterial) -> Self {
        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        Self {
            id: KeyId::for_conversation(conversation_id, version),
            material,
            created_ms,
            version,
        }
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("created_ms", &self.created_ms)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct KeyTable {
    keys: HashMap<KeyId, Arc<EncryptionKey>>,
    current: HashMap<String, KeyId>,
}

impl KeyTable {
    fn current_key(&self, conversation_id: &str) -> Option<&Arc<EncryptionKey>> {
        self.current
            .get(conversation_id)
            .and_then(|id| self.keys.get(id))
    }
}

/// Key lifecycle and content encryption for all conversations in a process.
///
/// Construct one instance at startup and share it behind an `Arc`. Keys are
/// never evicted while the instance lives; [`clear_keys`](Self::clear_keys)
/// is the teardown path (logout, workspace switch).
///
/// Encryption snapshots the current key before sealing, so a concurrent
/// [`rotate_key`](Self::rotate_key) never changes the key under an
/// in-flight call. The table lock is only held for lookups and inserts.
#[derive(Default)]
pub struct EncryptionService {
    table: RwLock<KeyTable>,
}

impl EncryptionService {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, KeyTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, KeyTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the first key (version 1) for a conversation.
    ///
    /// Returns `false` without touching the table when the conversation
    /// already has a key.
    pub fn initialize(&self, conversation_id: &str) -> bool {
        if self.read().current.contains_key(conversation_id) {
            return false;
        }

        let key = EncryptionKey::generate(conversation_id, 1);
        let mut table = self.write();
        if table.current.contains_key(conversation_id) {
            return false;
        }

        debug!(conversation_id, key_id = %key.id, "initialized conversation key");
        table
            .current
            .insert(conversation_id.to_owned(), key.id.clone());
        table.keys.insert(key.id.clone(), Arc::new(key));
        true
    }

    pub fn is_initialized(&self, conversation_id: &str) -> bool {
        self.read().current.contains_key(conversation_id)
    }

    /// Encrypts `plaintext` with the conversation's current key.
    pub fn encrypt_message(
        &self,
        conversation_id: &str,
        plaintext: &str,
    ) -> Result<EncryptedContent> {
        let key = self
            .read()
            .current_key(conversation_id)
            .cloned()
            .ok_or_else(|| CryptoError::NotInitialized(conversation_id.to_owned()))?;

        let encrypted_content = seal(&key.material.0, plaintext.as_bytes())?;
        Ok(EncryptedContent {
            encrypted_content,
            key_id: key.id.clone(),
        })
    }

    /// Decrypts content sealed under any key still in the table.
    pub fn try_decrypt(&self, encrypted_content: &str, key_id: &KeyId) -> Result<String> {
        let key = self
            .read()
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownKey(key_id.clone()))?;

        let plaintext = open(&key.material.0, encrypted_content)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidCiphertext)
    }

    /// Like [`try_decrypt`](Self::try_decrypt) but never fails: unknown keys
    /// and damaged payloads yield [`UNDECRYPTABLE_PLACEHOLDER`].
    pub fn decrypt_message(&self, encrypted_content: &str, key_id: &KeyId) -> String {
        match self.try_decrypt(encrypted_content, key_id) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(%key_id, %err, "message content could not be decrypted");
                UNDECRYPTABLE_PLACEHOLDER.to_owned()
            }
        }
    }

    /// Replaces the conversation's current key with a new one of the next
    /// version. Earlier keys remain available for decryption.
    pub fn rotate_key(&self, conversation_id: &str) -> Result<KeyId> {
        let material = KeyMaterial::generate();
        let mut table = self.write();

        let previous_version = table
            .current_key(conversation_id)
            .map(|key| key.version)
            .ok_or_else(|| CryptoError::NotInitialized(conversation_id.to_owned()))?;

        let version = previous_version + 1;
        let key = EncryptionKey::with_material(conversation_id, version, material);
        let key_id = key.id.clone();

        table
            .current
            .insert(conversation_id.to_owned(), key_id.clone());
        table.keys.insert(key_id.clone(), Arc::new(key));

        info!(conversation_id, %key_id, version, "rotated conversation key");
        Ok(key_id)
    }

    /// Version of the current key, `0` when the conversation has none.
    pub fn current_key_version(&self, conversation_id: &str) -> u32 {
        self.read()
            .current_key(conversation_id)
            .map(|key| key.version)
            .unwrap_or(0)
    }

    pub fn current_key_id(&self, conversation_id: &str) -> Option<KeyId> {
        self.read().current.get(conversation_id).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.read().keys.len()
    }

    /// Drops every key and forgets every conversation.
    pub fn clear_keys(&self) {
        let mut table = self.write();
        let dropped = table.keys.len();
        table.keys.clear();
        table.current.clear();
        info!(dropped, "cleared encryption keys");
    }
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.read();
        f.debug_struct("EncryptionService")
            .field("conversations", &table.current.len())
            .field("keys", &table.keys.len())
            .finish()
    }
}
