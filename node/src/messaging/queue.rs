//! Durable queue of outbound messages that have not reached the channel yet.

use crate::storage::{keys, load_json, save_json, KeyValueStore};
use deskchat_messaging::{ConversationId, Message, MessageId, QueueStatus, QueuedMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-conversation FIFO queues, each persisted under its own storage key.
///
/// A conversation's queue is read from storage the first time it is touched.
/// Every mutation is written back immediately; a failed write is logged and
/// the in-memory queue stays authoritative for the session.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    queues: Arc<RwLock<HashMap<ConversationId, VecDeque<QueuedMessage>>>>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            queues: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn load(&self, conversation_id: &ConversationId) -> VecDeque<QueuedMessage> {
        let key = keys::offline_queue(conversation_id.as_str());
        match load_json::<VecDeque<QueuedMessage>>(self.store.as_ref(), &key) {
            Ok(Some(mut queue)) => {
                // An attempt interrupted by a restart is retried from scratch.
                for entry in queue.iter_mut() {
                    if entry.status == QueueStatus::Sending {
                        entry.status = QueueStatus::Queued;
                    }
                }
                queue
            }
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!(conversation_id = %conversation_id, %err, "discarding unreadable offline queue");
                VecDeque::new()
            }
        }
    }

    fn persist(&self, conversation_id: &ConversationId, queue: &VecDeque<QueuedMessage>) {
        let key = keys::offline_queue(conversation_id.as_str());
        let result = if queue.is_empty() {
            self.store.remove(&key)
        } else {
            save_json(self.store.as_ref(), &key, queue)
        };
        if let Err(err) = result {
            warn!(conversation_id = %conversation_id, %err, "failed to persist offline queue");
        }
    }

    async fn update<R>(
        &self,
        conversation_id: &ConversationId,
        f: impl FnOnce(&mut VecDeque<QueuedMessage>) -> (R, bool),
    ) -> R {
        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(conversation_id.clone())
            .or_insert_with(|| self.load(conversation_id));
        let (result, dirty) = f(queue);
        if dirty {
            self.persist(conversation_id, queue);
        }
        result
    }

    async fn inspect<R>(
        &self,
        conversation_id: &ConversationId,
        f: impl FnOnce(&VecDeque<QueuedMessage>) -> R,
    ) -> R {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(conversation_id) {
                return f(queue);
            }
        }
        self.update(conversation_id, |queue| (f(queue), false)).await
    }

    /// Appends `message` with `status = queued` and `retry_count = 0`.
    ///
    /// Queueing an id that is already present leaves the existing entry in
    /// place so its position and retry count are kept.
    pub async fn queue_message(&self, message: Message) -> QueuedMessage {
        let conversation_id = message.conversation_id.clone();
        self.update(&conversation_id, |queue| {
            if let Some(existing) = queue.iter().find(|entry| entry.id == message.id) {
                return (existing.clone(), false);
            }
            let entry = QueuedMessage::new(message, conversation_id.as_str());
            debug!(conversation_id = %conversation_id, message_id = %entry.id, depth = queue.len() + 1, "message queued");
            queue.push_back(entry.clone());
            (entry, true)
        })
        .await
    }

    pub async fn has_queued_messages(&self, conversation_id: &ConversationId) -> bool {
        self.inspect(conversation_id, |queue| !queue.is_empty())
            .await
    }

    /// Queued messages, oldest first.
    pub async fn get_queued_messages(&self, conversation_id: &ConversationId) -> Vec<QueuedMessage> {
        self.inspect(conversation_id, |queue| queue.iter().cloned().collect())
            .await
    }

    pub async fn clear_queued_messages(&self, conversation_id: &ConversationId) {
        self.update(conversation_id, |queue| {
            let dropped = queue.len();
            queue.clear();
            debug!(conversation_id = %conversation_id, dropped, "offline queue cleared");
            ((), true)
        })
        .await
    }

    pub async fn peek(&self, conversation_id: &ConversationId) -> Option<QueuedMessage> {
        self.inspect(conversation_id, |queue| queue.front().cloned())
            .await
    }

    pub async fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.inspect(conversation_id, |queue| {
            queue.iter().any(|entry| &entry.id == message_id)
        })
        .await
    }

    /// Removes a delivered message.
    pub async fn remove(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<QueuedMessage> {
        self.update(conversation_id, |queue| {
            match queue.iter().position(|entry| &entry.id == message_id) {
                Some(pos) => (queue.remove(pos), true),
                None => (None, false),
            }
        })
        .await
    }

    pub async fn mark_sending(&self, conversation_id: &ConversationId, message_id: &MessageId) {
        self.update(conversation_id, |queue| {
            match queue.iter_mut().find(|entry| &entry.id == message_id) {
                Some(entry) => {
                    entry.status = QueueStatus::Sending;
                    ((), true)
                }
                None => ((), false),
            }
        })
        .await
    }

    /// Records a failed attempt and puts the message back to `queued`.
    /// Returns the new retry count.
    pub async fn mark_attempt_failed(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<u32> {
        self.update(conversation_id, |queue| {
            match queue.iter_mut().find(|entry| &entry.id == message_id) {
                Some(entry) => {
                    entry.retry_count += 1;
                    entry.status = QueueStatus::Queued;
                    (Some(entry.retry_count), true)
                }
                None => (None, false),
            }
        })
        .await
    }

    pub async fn len(&self, conversation_id: &ConversationId) -> usize {
        self.inspect(conversation_id, VecDeque::len).await
    }
}
