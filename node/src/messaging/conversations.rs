use crate::storage::{keys, load_json, save_json, KeyValueStore};
use deskchat_crypto_core::UNDECRYPTABLE_PLACEHOLDER;
use deskchat_messaging::{Conversation, ConversationId, Message};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const DEFAULT_TITLE: &str = "New conversation";
const DEFAULT_KIND: &str = "chat";
const PREVIEW_CHARS: usize = 100;

#[derive(Default)]
struct RegistryState {
    conversations: Vec<Conversation>,
    current: Option<ConversationId>,
    /// Conversations whose preview was taken from an encrypted message.
    sealed_previews: HashSet<ConversationId>,
}

/// Conversations of one workspace, persisted as a single list.
///
/// Previews of encrypted messages stay in memory and are never written.
pub struct ConversationRegistry {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<RegistryState>,
}

impl ConversationRegistry {
    pub fn load(store: Arc<dyn KeyValueStore>, workspace_id: &str) -> Self {
        let key = keys::conversations(workspace_id);
        let conversations = match load_json::<Vec<Conversation>>(store.as_ref(), &key) {
            Ok(list) => list.unwrap_or_default(),
            Err(err) => {
                warn!(workspace_id, %err, "failed to read conversation list");
                Vec::new()
            }
        };
        debug!(workspace_id, count = conversations.len(), "loaded conversations");

        Self {
            store,
            key,
            state: Mutex::new(RegistryState {
                conversations,
                ..RegistryState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &RegistryState) {
        let conversations: Vec<Conversation> = state
            .conversations
            .iter()
            .map(|conversation| {
                let mut stored = conversation.clone();
                if state.sealed_previews.contains(&conversation.id) {
                    stored.last_message = None;
                }
                stored
            })
            .collect();
        if let Err(err) = save_json(self.store.as_ref(), &self.key, &conversations) {
            warn!(key = %self.key, %err, "failed to persist conversation list");
        }
    }

    /// Conversations with the most recent activity first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations = self.state().conversations.clone();
        conversations.sort_by(|a, b| b.last_message_timestamp.cmp(&a.last_message_timestamp));
        conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.state()
            .conversations
            .iter()
            .find(|conversation| &conversation.id == id)
            .cloned()
    }

    pub fn current(&self) -> Option<Conversation> {
        let state = self.state();
        let current = state.current.as_ref()?;
        state
            .conversations
            .iter()
            .find(|conversation| &conversation.id == current)
            .cloned()
    }

    pub fn create(&self, title: &str, kind: &str) -> Conversation {
        let conversation = Conversation::new(ConversationId::generate(), title, kind);
        let mut state = self.state();
        state.conversations.push(conversation.clone());
        self.persist(&state);
        info!(conversation_id = %conversation.id, "conversation created");
        conversation
    }

    /// Returns the conversation with `id`, creating it when unknown.
    pub fn ensure(&self, id: &ConversationId, title: Option<&str>) -> Conversation {
        let mut state = self.state();
        if let Some(existing) = state.conversations.iter().find(|c| &c.id == id) {
            return existing.clone();
        }

        let conversation =
            Conversation::new(id.clone(), title.unwrap_or(DEFAULT_TITLE), DEFAULT_KIND);
        state.conversations.push(conversation.clone());
        self.persist(&state);
        info!(conversation_id = %id, "conversation created");
        conversation
    }

    /// Makes `id` the current conversation and resets its unread count.
    pub fn select(&self, id: &ConversationId) -> Option<Conversation> {
        let mut state = self.state();
        let conversation = state.conversations.iter_mut().find(|c| &c.id == id)?;
        conversation.unread_count = 0;
        let selected = conversation.clone();
        state.current = Some(id.clone());
        self.persist(&state);
        Some(selected)
    }

    /// Updates the preview fields for a new message. Inbound messages in a
    /// conversation that is not selected count as unread. Content that
    /// failed to decrypt never becomes the preview.
    pub fn record_message(&self, message: &Message, inbound: bool) -> Conversation {
        let mut state = self.state();
        let is_current = state.current.as_ref() == Some(&message.conversation_id);

        let index = match state
            .conversations
            .iter()
            .position(|c| c.id == message.conversation_id)
        {
            Some(index) => index,
            None => {
                state.conversations.push(Conversation::new(
                    message.conversation_id.clone(),
                    DEFAULT_TITLE,
                    DEFAULT_KIND,
                ));
                state.conversations.len() - 1
            }
        };

        let conversation = &mut state.conversations[index];
        let is_newer = conversation
            .last_message_timestamp
            .map_or(true, |last| message.timestamp >= last);
        let previewed = is_newer && message.content != UNDECRYPTABLE_PLACEHOLDER;
        if previewed {
            conversation.last_message = Some(message.content.chars().take(PREVIEW_CHARS).collect());
            conversation.last_message_timestamp = Some(message.timestamp);
        }
        if inbound && !is_current {
            conversation.unread_count += 1;
        }
        let updated = conversation.clone();

        if previewed {
            if message.is_encrypted() {
                state.sealed_previews.insert(message.conversation_id.clone());
            } else {
                state.sealed_previews.remove(&message.conversation_id);
            }
        }

        self.persist(&state);
        updated
    }
}
