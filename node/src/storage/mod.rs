//! Local key-value persistence used by the messaging runtime.
//!
//! Values are JSON strings under flat string keys, mirroring the browser
//! storage the chat widget originally persisted into.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create storage directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("stored value under {key} is corrupted: {source}")]
    Corrupted {
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("stored value under {0} is not valid UTF-8")]
    InvalidUtf8(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// String-keyed storage with a synchronous API.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Storage keys shared by every component that persists state.
pub mod keys {
    pub const TYPING_USER_ID: &str = "chat_typing_user_id";

    pub fn messages(conversation_id: &str) -> String {
        format!("messages_{conversation_id}")
    }

    pub fn conversations(workspace_id: &str) -> String {
        format!("chat_conversations_{workspace_id}")
    }

    pub fn offline_queue(conversation_id: &str) -> String {
        format!("offline_queue_{conversation_id}")
    }
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StorageError::Corrupted {
            key: key.to_owned(),
            source,
        })
}

pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let encoded = serde_json::to_string(value).map_err(|source| StorageError::Encode {
        key: key.to_owned(),
        source,
    })?;
    store.set(key, &encoded)
}
