//! Paginated message history.
//!
//! [`PaginatedMessageStore`] holds the visible window of one conversation and
//! performs all merge and ordering logic without touching storage. Mutations
//! return a [`HistoryChange`] which a [`HistoryLock`] commits.
//!
//! [`HistoryRepository`] keeps the stored set of each conversation in its
//! sealed form, behind one async lock per conversation. Storage is read once
//! per conversation and written after every commit.

use crate::storage::{keys, load_json, save_json, KeyValueStore};
use deskchat_crypto_core::EncryptionService;
use deskchat_messaging::{now_ms, timestamp, ConversationId, Message, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Shape persisted under `messages_<conversationId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredHistory {
    pub messages: Vec<Message>,
    #[serde(with = "timestamp")]
    pub last_updated: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredHistoryRef<'a> {
    messages: &'a [Message],
    #[serde(with = "timestamp")]
    last_updated: i64,
}

/// Messages to write back after a mutation of the visible window.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryChange {
    pub conversation_id: ConversationId,
    /// Messages that were not known before.
    pub added: Vec<Message>,
    /// Replacements for known messages, matched by id.
    pub updated: Vec<Message>,
}

impl HistoryChange {
    /// Folds `other` into this change. Updates to messages added here
    /// replace the added copy.
    pub fn merge(mut self, other: HistoryChange) -> Self {
        self.added.extend(other.added);
        for message in other.updated {
            match self.added.iter_mut().find(|m| m.id == message.id) {
                Some(added) => *added = message,
                None => self.updated.push(message),
            }
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct PaginatedMessageStore {
    conversation_id: ConversationId,
    page_size: usize,
    visible: Vec<Message>,
    visible_ids: HashSet<MessageId>,
    page: usize,
    has_more: bool,
    total_messages: usize,
    is_loading: bool,
}

/// Inserts after any message with the same timestamp so arrival order
/// breaks ties.
fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let at = messages.partition_point(|m| m.timestamp <= message.timestamp);
    messages.insert(at, message);
}

impl PaginatedMessageStore {
    pub fn new(conversation_id: ConversationId, page_size: usize) -> Self {
        Self {
            conversation_id,
            page_size: page_size.max(1),
            visible: Vec::new(),
            visible_ids: HashSet::new(),
            page: 0,
            has_more: false,
            total_messages: 0,
            is_loading: false,
        }
    }

    /// Shows the most recent page of `stored`, which must be sorted by
    /// timestamp. Only that page goes through `reveal`.
    pub fn from_history(
        conversation_id: ConversationId,
        page_size: usize,
        stored: &[Message],
        reveal: impl Fn(&Message) -> Message,
    ) -> Self {
        let mut store = Self::new(conversation_id, page_size);
        let start = stored.len().saturating_sub(store.page_size);
        for message in &stored[start..] {
            if store.visible_ids.insert(message.id.clone()) {
                store.visible.push(reveal(message));
            }
        }
        store.total_messages = stored.len();
        store.page = 1;
        store.has_more = start > 0;
        store
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Visible messages, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.visible
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn total_messages(&self) -> usize {
        self.total_messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.visible_ids.contains(id)
    }

    /// Marks a page load as started. Returns `false` when a load is already
    /// running or there is nothing older to show.
    pub fn begin_load(&mut self) -> bool {
        if self.is_loading || !self.has_more {
            return false;
        }
        self.is_loading = true;
        true
    }

    /// Merges the next older page of `stored` into the visible window and
    /// returns how many messages became visible.
    pub fn finish_load(&mut self, stored: &[Message], reveal: impl Fn(&Message) -> Message) -> usize {
        let next_page = self.page + 1;
        let total = stored.len();
        let start = total.saturating_sub(next_page * self.page_size);
        let end = total.saturating_sub((next_page - 1) * self.page_size);

        let mut added = 0;
        for message in &stored[start..end] {
            if self.visible_ids.insert(message.id.clone()) {
                insert_sorted(&mut self.visible, reveal(message));
                added += 1;
            }
        }
        self.page = next_page;
        self.has_more = start > 0;
        self.total_messages = self.total_messages.max(total);
        self.is_loading = false;

        debug!(
            conversation_id = %self.conversation_id,
            page = self.page,
            added,
            has_more = self.has_more,
            "loaded older messages"
        );
        added
    }

    /// `begin_load` followed by `finish_load`.
    pub fn load_more_messages(&mut self, stored: &[Message], reveal: impl Fn(&Message) -> Message) -> bool {
        if !self.begin_load() {
            return false;
        }
        self.finish_load(stored, reveal);
        true
    }

    pub fn add_message(&mut self, message: Message, stored_ids: &HashSet<MessageId>) -> Option<HistoryChange> {
        self.add_messages(vec![message], stored_ids)
    }

    /// Appends messages neither visible nor in `stored_ids`. Returns `None`
    /// when every message in `batch` was a duplicate.
    pub fn add_messages(
        &mut self,
        batch: Vec<Message>,
        stored_ids: &HashSet<MessageId>,
    ) -> Option<HistoryChange> {
        let mut added = Vec::new();
        for message in batch {
            if stored_ids.contains(&message.id) || !self.visible_ids.insert(message.id.clone()) {
                continue;
            }
            insert_sorted(&mut self.visible, message.clone());
            added.push(message);
        }
        if added.is_empty() {
            return None;
        }

        self.total_messages += added.len();
        Some(HistoryChange {
            conversation_id: self.conversation_id.clone(),
            added,
            updated: Vec::new(),
        })
    }

    /// Replaces a visible message with the same id.
    pub fn update_message(&mut self, message: Message) -> Option<HistoryChange> {
        let slot = self.visible.iter_mut().find(|m| m.id == message.id)?;
        *slot = message.clone();
        Some(HistoryChange {
            conversation_id: self.conversation_id.clone(),
            added: Vec::new(),
            updated: vec![message],
        })
    }
}

#[derive(Default)]
struct StoredSet {
    loaded: bool,
    /// Sealed form, oldest first.
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

type Slot = Arc<tokio::sync::Mutex<StoredSet>>;

/// Reads and writes conversation history in local storage.
///
/// Encrypted messages are kept and written without their plaintext, and
/// opened again through [`HistoryLock::reveal`] only when they become
/// visible. Clones share the same cache.
#[derive(Clone)]
pub struct HistoryRepository {
    store: Arc<dyn KeyValueStore>,
    encryption: Arc<EncryptionService>,
    slots: Arc<Mutex<HashMap<ConversationId, Slot>>>,
}

impl HistoryRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, encryption: Arc<EncryptionService>) -> Self {
        Self {
            store,
            encryption,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, conversation_id: &ConversationId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(conversation_id.clone()).or_default())
    }

    /// Locks the stored history of one conversation, reading it from storage
    /// on first use. A mutation must read, merge and commit under one lock.
    pub async fn lock(&self, conversation_id: &ConversationId) -> HistoryLock {
        let mut set = self.slot(conversation_id).lock_owned().await;
        if !set.loaded {
            set.messages = self.read(conversation_id);
            set.ids = set.messages.iter().map(|m| m.id.clone()).collect();
            set.loaded = true;
        }
        HistoryLock {
            repository: self.clone(),
            conversation_id: conversation_id.clone(),
            set,
        }
    }

    /// Every stored message, opened for display, oldest first.
    pub async fn load(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let history = self.lock(conversation_id).await;
        history.messages().iter().map(|m| history.reveal(m)).collect()
    }

    /// Unreadable history is logged and treated as empty.
    fn read(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let key = keys::messages(conversation_id.as_str());
        let mut messages = match load_json::<StoredHistory>(self.store.as_ref(), &key) {
            Ok(Some(history)) => history.messages,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(conversation_id = %conversation_id, %err, "failed to read message history");
                Vec::new()
            }
        };
        messages.sort_by_key(|message| message.timestamp);

        let mut seen = HashSet::new();
        messages.retain(|message| seen.insert(message.id.clone()));
        for message in messages.iter_mut() {
            *message = message.without_plaintext();
        }
        debug!(conversation_id = %conversation_id, stored = messages.len(), "message history read");
        messages
    }
}

/// Exclusive access to one conversation's stored history.
pub struct HistoryLock {
    repository: HistoryRepository,
    conversation_id: ConversationId,
    set: OwnedMutexGuard<StoredSet>,
}

impl HistoryLock {
    /// Stored messages in sealed form, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.set.messages
    }

    pub fn ids(&self) -> &HashSet<MessageId> {
        &self.set.ids
    }

    pub fn len(&self) -> usize {
        self.set.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.messages.is_empty()
    }

    /// Decrypts a sealed message. Undecryptable content becomes the
    /// placeholder.
    pub fn reveal(&self, message: &Message) -> Message {
        let mut message = message.clone();
        if message.content.is_empty() {
            if let (Some(sealed), Some(key_id)) = (&message.encrypted_content, &message.key_id) {
                message.content = self.repository.encryption.decrypt_message(sealed, key_id);
            }
        }
        message
    }

    /// Applies `change` to the stored set and writes it back.
    pub fn commit(&mut self, change: HistoryChange) {
        let set = &mut *self.set;
        for message in change.updated {
            let sealed = message.without_plaintext();
            match set.messages.iter_mut().find(|m| m.id == sealed.id) {
                Some(existing) => *existing = sealed,
                None => {
                    if set.ids.insert(sealed.id.clone()) {
                        insert_sorted(&mut set.messages, sealed);
                    }
                }
            }
        }
        for message in change.added {
            if set.ids.insert(message.id.clone()) {
                insert_sorted(&mut set.messages, message.without_plaintext());
            }
        }
        self.persist();
    }

    pub fn clear(&mut self) {
        self.set.messages.clear();
        self.set.ids.clear();
        let key = keys::messages(self.conversation_id.as_str());
        if let Err(err) = self.repository.store.remove(&key) {
            warn!(conversation_id = %self.conversation_id, %err, "failed to clear message history");
        }
    }

    fn persist(&self) {
        let history = StoredHistoryRef {
            messages: &self.set.messages,
            last_updated: now_ms(),
        };
        let key = keys::messages(self.conversation_id.as_str());
        if let Err(err) = save_json(self.repository.store.as_ref(), &key, &history) {
            warn!(conversation_id = %self.conversation_id, %err, "failed to persist message history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use deskchat_messaging::Sender;
    use std::cell::Cell;

    fn message(id: &str, timestamp: i64) -> Message {
        let mut message = Message::new(ConversationId::new("c1"), Sender::default(), id);
        message.id = MessageId::new(id);
        message.timestamp = timestamp;
        message
    }

    fn history(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| message(&format!("m{i}"), 1_000 + i as i64))
            .collect()
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    fn id_set(messages: &[Message]) -> HashSet<MessageId> {
        messages.iter().map(|message| message.id.clone()).collect()
    }

    fn shown(message: &Message) -> Message {
        message.clone()
    }

    #[test]
    fn pages_backwards_through_history() {
        let stored = history(45);
        let mut store =
            PaginatedMessageStore::from_history(ConversationId::new("c1"), 20, &stored, shown);

        assert_eq!(store.messages().len(), 20);
        assert_eq!(store.messages()[0].id.as_str(), "m25");
        assert!(store.has_more());
        assert_eq!(store.total_messages(), 45);

        assert!(store.load_more_messages(&stored, shown));
        assert_eq!(store.messages().len(), 40);
        assert!(store.has_more());

        assert!(store.load_more_messages(&stored, shown));
        assert_eq!(store.messages().len(), 45);
        assert!(!store.has_more());
        assert_eq!(store.messages()[0].id.as_str(), "m0");

        assert!(!store.load_more_messages(&stored, shown));
    }

    #[test]
    fn only_the_visible_page_is_revealed() {
        let stored = history(45);
        let revealed = Cell::new(0);
        let reveal = |message: &Message| {
            revealed.set(revealed.get() + 1);
            message.clone()
        };

        let mut store =
            PaginatedMessageStore::from_history(ConversationId::new("c1"), 20, &stored, reveal);
        assert_eq!(revealed.get(), 20);

        store.load_more_messages(&stored, reveal);
        assert_eq!(revealed.get(), 40);
    }

    #[test]
    fn short_history_has_nothing_more() {
        let stored = history(5);
        let mut store =
            PaginatedMessageStore::from_history(ConversationId::new("c1"), 20, &stored, shown);
        assert_eq!(store.messages().len(), 5);
        assert!(!store.has_more());
        assert!(!store.begin_load());
    }

    #[test]
    fn concurrent_load_is_rejected() {
        let stored = history(30);
        let mut store =
            PaginatedMessageStore::from_history(ConversationId::new("c1"), 10, &stored, shown);

        assert!(store.begin_load());
        assert!(store.is_loading());
        assert!(!store.begin_load());

        assert_eq!(store.finish_load(&stored, shown), 10);
        assert!(!store.is_loading());
    }

    #[test]
    fn merges_are_idempotent_and_sorted() {
        let mut store = PaginatedMessageStore::new(ConversationId::new("c1"), 20);

        let a = vec![message("m3", 30), message("m1", 10)];
        let change = store.add_messages(a, &HashSet::new()).unwrap();
        assert_eq!(change.added.len(), 2);

        let b = vec![message("m2", 20), message("m1", 10), message("m2", 20)];
        let change = store.add_messages(b, &id_set(&change.added)).unwrap();
        assert_eq!(ids(&change.added), vec!["m2"]);

        assert_eq!(ids(store.messages()), vec!["m1", "m2", "m3"]);
        assert_eq!(store.total_messages(), 3);

        assert!(store
            .add_messages(vec![message("m3", 30)], &HashSet::new())
            .is_none());
        assert_eq!(store.total_messages(), 3);
    }

    #[test]
    fn messages_only_in_storage_count_as_known() {
        let stored = history(25);
        let mut store =
            PaginatedMessageStore::from_history(ConversationId::new("c1"), 20, &stored, shown);

        // m0 is persisted but outside the visible page.
        assert!(store.add_message(message("m0", 1_000), &id_set(&stored)).is_none());
        assert_eq!(store.total_messages(), 25);
        assert_eq!(store.messages().len(), 20);
    }

    #[test]
    fn update_replaces_in_place() {
        let mut store = PaginatedMessageStore::new(ConversationId::new("c1"), 20);
        let added = store.add_message(message("m1", 10), &HashSet::new()).unwrap();

        let mut edited = message("m1", 10);
        edited.content = "edited".into();
        let change = added.merge(store.update_message(edited).unwrap());

        assert_eq!(change.added.len(), 1);
        assert_eq!(change.added[0].content, "edited");
        assert!(change.updated.is_empty());
        assert_eq!(store.messages()[0].content, "edited");
        assert!(store.update_message(message("zz", 1)).is_none());
    }

    #[tokio::test]
    async fn repository_roundtrip_and_sealing() {
        let store = Arc::new(MemoryStore::new());
        let encryption = Arc::new(EncryptionService::new());
        encryption.initialize("c1");
        let repo = HistoryRepository::new(store.clone(), encryption.clone());
        let c1 = ConversationId::new("c1");

        let plain = message("m1", 10);
        let secret = message("m2", 20)
            .with_encryption(encryption.encrypt_message("c1", "m2").unwrap());
        repo.lock(&c1).await.commit(HistoryChange {
            conversation_id: c1.clone(),
            added: vec![secret, plain],
            updated: Vec::new(),
        });

        let raw = store.get(&keys::messages("c1")).unwrap().unwrap();
        let stored: StoredHistory = serde_json::from_str(&raw).unwrap();
        assert_eq!(ids(&stored.messages), vec!["m1", "m2"]);
        assert_eq!(stored.messages[1].content, "");
        assert!(stored.last_updated > 0);

        let loaded = repo.load(&c1).await;
        assert_eq!(loaded[1].content, "m2");

        encryption.clear_keys();
        let degraded = repo.load(&c1).await;
        assert_eq!(degraded[1].content, deskchat_crypto_core::UNDECRYPTABLE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn storage_is_read_once_per_conversation() {
        let store = Arc::new(MemoryStore::new());
        let repo = HistoryRepository::new(store.clone(), Arc::new(EncryptionService::new()));
        let c1 = ConversationId::new("c1");

        repo.lock(&c1).await.commit(HistoryChange {
            conversation_id: c1.clone(),
            added: history(3),
            updated: Vec::new(),
        });
        store.set(&keys::messages("c1"), "not json").unwrap();

        let cached = repo.clone().lock(&c1).await;
        assert_eq!(cached.len(), 3);
        assert!(cached.ids().contains(&MessageId::new("m2")));
    }

    #[tokio::test]
    async fn commits_are_merged_into_the_stored_set() {
        let store = Arc::new(MemoryStore::new());
        let repo = HistoryRepository::new(store.clone(), Arc::new(EncryptionService::new()));
        let c1 = ConversationId::new("c1");

        for batch in [vec![message("m2", 20)], vec![message("m1", 10), message("m2", 20)]] {
            repo.lock(&c1).await.commit(HistoryChange {
                conversation_id: c1.clone(),
                added: batch,
                updated: Vec::new(),
            });
        }

        let fresh = HistoryRepository::new(store, Arc::new(EncryptionService::new()));
        assert_eq!(ids(&fresh.load(&c1).await), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn corrupted_history_loads_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(&keys::messages("c1"), "not json").unwrap();
        let repo = HistoryRepository::new(store, Arc::new(EncryptionService::new()));
        assert!(repo.load(&ConversationId::new("c1")).await.is_empty());
    }
}
