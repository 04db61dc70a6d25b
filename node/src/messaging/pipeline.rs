//! Conversation orchestrator: validation, encryption, delivery, history and
//! typing for one open conversation.

use super::backoff::RetryPolicy;
use super::conversations::ConversationRegistry;
use super::history::{HistoryRepository, PaginatedMessageStore, DEFAULT_PAGE_SIZE};
use super::queue::OfflineQueue;
use super::typing::{local_typing_user_id, TypingIndicatorTracker, SWEEP_INTERVAL, TYPING_EXPIRY};
use super::{PipelineError, Result};
use crate::realtime::{ConnectionState, MessageSubscription, RealtimeTransport};
use crate::storage::KeyValueStore;
use deskchat_crypto_core::{CryptoError, EncryptedContent, EncryptionService, KeyId};
use deskchat_messaging::{
    ChannelEvent, ConversationId, DeliveryEvent, DeliveryState, Message, MessageId,
    MessageStatus, MessageValidationService, Metadata, QueuedMessage, Sender, TypingUser,
    ValidationIssue, ValidationOptions, OFFLINE_METADATA_KEY,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UPDATE_CAPACITY: usize = 128;

/// Configuration for one open conversation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_size: usize,
    pub validation: ValidationOptions,
    pub encryption_enabled: bool,
    pub typing_debounce: Duration,
    pub typing_expiry: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    /// Author of messages sent from this side.
    pub sender: Sender,
    /// Schedule a backoff retry after a failed publish or drain.
    pub auto_retry: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            validation: ValidationOptions::default(),
            encryption_enabled: true,
            typing_debounce: Duration::from_secs(3),
            typing_expiry: TYPING_EXPIRY,
            sweep_interval: SWEEP_INTERVAL,
            retry: RetryPolicy::default(),
            sender: Sender::default(),
            auto_retry: true,
        }
    }
}

/// Process-wide collaborators shared by every open conversation.
///
/// Built once at startup and handed to each [`MessagingOrchestrator`]. The
/// encryption key table and the typing identity live here rather than in
/// globals; call [`EncryptionService::clear_keys`] on logout. Clones share
/// the history cache, so every orchestrator of a conversation commits under
/// the same lock.
#[derive(Clone)]
pub struct MessagingContext {
    pub store: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub encryption: Arc<EncryptionService>,
    pub history: HistoryRepository,
    pub queue: OfflineQueue,
    pub conversations: Arc<ConversationRegistry>,
    pub typing_user_id: String,
}

impl MessagingContext {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn RealtimeTransport>,
        workspace_id: &str,
    ) -> Self {
        let typing_user_id = local_typing_user_id(store.as_ref());
        let encryption = Arc::new(EncryptionService::new());
        Self {
            queue: OfflineQueue::new(Arc::clone(&store)),
            conversations: Arc::new(ConversationRegistry::load(Arc::clone(&store), workspace_id)),
            history: HistoryRepository::new(Arc::clone(&store), Arc::clone(&encryption)),
            encryption,
            store,
            transport,
            typing_user_id,
        }
    }

    /// Shares an existing key table instead of the context's own.
    pub fn with_encryption(mut self, encryption: Arc<EncryptionService>) -> Self {
        self.history = HistoryRepository::new(Arc::clone(&self.store), Arc::clone(&encryption));
        self.encryption = encryption;
        self
    }
}

/// A visible message together with its derived UI status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayMessage {
    #[serde(flatten)]
    pub message: Message,
    pub status: MessageStatus,
}

/// Change notifications for UI observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    MessageAdded(MessageId),
    DeliveryChanged {
        message_id: MessageId,
        state: DeliveryState,
    },
    HistoryLoaded {
        added: usize,
        has_more: bool,
    },
    TypingChanged,
    PresenceChanged,
    ConnectionChanged(ConnectionState),
}

/// Result of one pass over the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub delivered: usize,
    pub remaining: usize,
    /// The message whose publish failed and stopped the pass.
    pub failed: Option<MessageId>,
}

struct ChatState {
    store: PaginatedMessageStore,
    delivery: HashMap<MessageId, DeliveryState>,
    error: Option<String>,
    validation_errors: Vec<ValidationIssue>,
    present_users: BTreeSet<String>,
}

struct Inner {
    conversation_id: ConversationId,
    config: PipelineConfig,
    context: MessagingContext,
    subscription: Arc<MessageSubscription>,
    typing: TypingIndicatorTracker,
    validator: MessageValidationService,
    state: RwLock<ChatState>,
    drain_lock: tokio::sync::Mutex<()>,
    retry_attempt: AtomicU32,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<ChatUpdate>,
}

fn lock_slot(slot: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The single integration point the UI layer talks to for one conversation.
///
/// Opening an orchestrator subscribes to the conversation's channel, loads
/// the latest history page and starts the background tasks that apply
/// inbound events and drain the offline queue whenever the channel attaches.
/// Dropping it stops those tasks.
pub struct MessagingOrchestrator {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl MessagingOrchestrator {
    pub async fn open(
        context: MessagingContext,
        conversation_id: ConversationId,
        config: PipelineConfig,
    ) -> Self {
        context.conversations.ensure(&conversation_id, None);
        if config.encryption_enabled {
            context.encryption.initialize(conversation_id.as_str());
        }

        let (store, stored) = {
            let history = context.history.lock(&conversation_id).await;
            let store = PaginatedMessageStore::from_history(
                conversation_id.clone(),
                config.page_size,
                history.messages(),
                |message| history.reveal(message),
            );
            (store, history.len())
        };

        let channel = context.transport.channel(conversation_id.as_str());
        let (subscription, inbound) = MessageSubscription::subscribe(conversation_id.clone(), channel);
        subscription.mark_known(store.messages().iter().map(|message| &message.id));
        let subscription = Arc::new(subscription);

        let typing = TypingIndicatorTracker::new(
            Arc::clone(&subscription),
            context.typing_user_id.clone(),
            config.typing_expiry,
            config.sweep_interval,
        );

        let mut delivery = HashMap::new();
        for entry in context.queue.get_queued_messages(&conversation_id).await {
            delivery.insert(
                entry.id,
                DeliveryState::Queued {
                    retry_count: entry.retry_count,
                },
            );
        }

        info!(
            conversation_id = %conversation_id,
            stored,
            queued = delivery.len(),
            "conversation opened"
        );

        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let connection = subscription.watch_state();
        let inner = Arc::new(Inner {
            conversation_id,
            config,
            context,
            subscription,
            typing,
            validator: MessageValidationService::new(),
            state: RwLock::new(ChatState {
                store,
                delivery,
                error: None,
                validation_errors: Vec::new(),
                present_users: BTreeSet::new(),
            }),
            drain_lock: tokio::sync::Mutex::new(()),
            retry_attempt: AtomicU32::new(0),
            retry_timer: Mutex::new(None),
            typing_timer: Mutex::new(None),
            updates,
        });

        let tasks = vec![
            tokio::spawn(pump_inbound(Arc::clone(&inner), inbound)),
            tokio::spawn(watch_connection(Arc::clone(&inner), connection)),
        ];

        Self { inner, tasks }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    pub fn typing_user_id(&self) -> &str {
        self.inner.typing.user_id()
    }

    /// Validates, records and delivers a message.
    ///
    /// Returns `true` once the message is accepted, whether it was published
    /// or queued. Returns `false` when validation rejects the content (see
    /// [`validation_errors`](Self::validation_errors)). A cipher failure also
    /// returns `false` and is reported through [`error`](Self::error).
    pub async fn send_message(&self, content: &str, metadata: Option<Metadata>) -> bool {
        let inner = &self.inner;
        let conversation_id = &inner.conversation_id;

        let result = inner
            .validator
            .validate_and_sanitize(content, &inner.config.validation);
        if !result.is_valid {
            inner.state.write().await.validation_errors = result.errors;
            return false;
        }

        let message = Message::new(
            conversation_id.clone(),
            inner.config.sender.clone(),
            result.sanitized_content,
        )
        .with_metadata(metadata.unwrap_or_default());
        let message_id = message.id.clone();
        inner.subscription.mark_known([&message_id]);
        self.stop_typing().await;

        let mut history = inner.context.history.lock(conversation_id).await;
        let mut change = {
            let mut state = inner.state.write().await;
            state.validation_errors.clear();
            state.delivery.insert(message_id.clone(), DeliveryState::composing());
            state.store.add_message(message.clone(), history.ids())
        };
        inner.emit(ChatUpdate::MessageAdded(message_id.clone()));
        debug!(conversation_id = %conversation_id, message_id = %message_id, "message composed");

        let (wire, local) = if inner.config.encryption_enabled {
            match inner.encrypt(&message.content) {
                Ok(encrypted) => {
                    let local = message.clone().with_encryption(encrypted.clone());
                    if let Some(pending) = change.take() {
                        let update = inner.state.write().await.store.update_message(local.clone());
                        change = Some(match update {
                            Some(update) => pending.merge(update),
                            None => pending,
                        });
                    }
                    (message.sealed(encrypted), local)
                }
                Err(err) => {
                    drop(history);
                    let err = PipelineError::from(err);
                    warn!(conversation_id = %conversation_id, message_id = %message_id, %err, "message not sent");
                    inner.state.write().await.error = Some(err.to_string());
                    inner.transition(&message_id, DeliveryEvent::PublishFailed).await;
                    return false;
                }
            }
        } else {
            (message.clone(), message)
        };

        if let Some(change) = change {
            history.commit(change);
        }
        drop(history);
        inner.context.conversations.record_message(&local, false);

        let attached = inner.subscription.connection_state() == ConnectionState::Attached;
        let backlog = inner.context.queue.has_queued_messages(conversation_id).await;

        if attached && !backlog {
            if inner.subscription.publish(&wire).await {
                inner.transition(&message_id, DeliveryEvent::PublishSucceeded).await;
                return true;
            }
            inner.context.queue.queue_message(wire).await;
            inner
                .context
                .queue
                .mark_attempt_failed(conversation_id, &message_id)
                .await;
            inner.transition(&message_id, DeliveryEvent::PublishFailed).await;
            inner.schedule_retry();
        } else {
            // Behind a backlog the message waits its turn to keep FIFO order.
            inner.context.queue.queue_message(wire).await;
            inner.transition(&message_id, DeliveryEvent::WentOffline).await;
        }
        true
    }

    /// Publishes the offline queue in order, stopping at the first failure.
    pub async fn drain_queue(&self) -> DrainOutcome {
        self.inner.drain_and_reschedule().await
    }

    /// Loads the next older page of history. No-op while a load is running or
    /// when everything is already visible.
    pub async fn load_more_messages(&self) -> bool {
        let inner = &self.inner;
        if !inner.state.write().await.store.begin_load() {
            return false;
        }

        let (added, has_more) = {
            let history = inner.context.history.lock(&inner.conversation_id).await;
            let mut state = inner.state.write().await;
            let added = state
                .store
                .finish_load(history.messages(), |message| history.reveal(message));
            (added, state.store.has_more())
        };
        inner.emit(ChatUpdate::HistoryLoaded { added, has_more });
        true
    }

    /// Deletes the stored history and empties the visible window. Messages
    /// still waiting in the offline queue keep their delivery state.
    pub async fn clear_history(&self) {
        let inner = &self.inner;
        let mut history = inner.context.history.lock(&inner.conversation_id).await;
        history.clear();

        let queued: HashSet<MessageId> = inner
            .context
            .queue
            .get_queued_messages(&inner.conversation_id)
            .await
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        {
            let mut state = inner.state.write().await;
            state.store =
                PaginatedMessageStore::new(inner.conversation_id.clone(), inner.config.page_size);
            state.delivery.retain(|id, _| queued.contains(id));
        }
        drop(history);
        info!(conversation_id = %inner.conversation_id, "history cleared");
        inner.emit(ChatUpdate::HistoryLoaded {
            added: 0,
            has_more: false,
        });
    }

    pub async fn send_typing_indicator(&self, is_typing: bool) -> bool {
        let username = self.inner.config.sender.name().map(str::to_owned);
        self.inner
            .typing
            .send_typing_indicator(is_typing, username)
            .await
    }

    /// Announces typing for non-empty input and schedules the matching stop
    /// after the debounce window. Each call replaces the pending stop.
    pub async fn handle_input_change(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.send_typing_indicator(true).await;

        let inner = Arc::clone(&self.inner);
        let debounce = inner.config.typing_debounce;
        let stop = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let username = inner.config.sender.name().map(str::to_owned);
            inner.typing.send_typing_indicator(false, username).await;
        });

        if let Some(previous) = lock_slot(&self.inner.typing_timer).replace(stop) {
            previous.abort();
        }
    }

    async fn stop_typing(&self) {
        let pending = lock_slot(&self.inner.typing_timer).take();
        if let Some(pending) = pending {
            pending.abort();
            self.send_typing_indicator(false).await;
        }
    }

    pub async fn announce_presence(&self, present: bool) -> Result<()> {
        self.inner
            .subscription
            .publish_presence(self.typing_user_id(), present)
            .await?;
        Ok(())
    }

    pub async fn rotate_key(&self) -> Result<KeyId> {
        Ok(self
            .inner
            .context
            .encryption
            .rotate_key(self.inner.conversation_id.as_str())?)
    }

    pub fn current_key_version(&self) -> u32 {
        self.inner
            .context
            .encryption
            .current_key_version(self.inner.conversation_id.as_str())
    }

    /// Visible messages, oldest first, with their delivery status.
    pub async fn messages(&self) -> Vec<DisplayMessage> {
        let state = self.inner.state.read().await;
        state
            .store
            .messages()
            .iter()
            .map(|message| DisplayMessage {
                status: state
                    .delivery
                    .get(&message.id)
                    .map_or(MessageStatus::Sent, DeliveryState::status),
                message: message.clone(),
            })
            .collect()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.state.read().await.store.has_more()
    }

    pub async fn total_messages(&self) -> usize {
        self.inner.state.read().await.store.total_messages()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.state.read().await.store.is_loading()
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.state.read().await.error.clone()
    }

    pub async fn validation_errors(&self) -> Vec<ValidationIssue> {
        self.inner.state.read().await.validation_errors.clone()
    }

    pub async fn delivery_state(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.inner.state.read().await.delivery.get(message_id).copied()
    }

    pub async fn present_users(&self) -> Vec<String> {
        self.inner
            .state
            .read()
            .await
            .present_users
            .iter()
            .cloned()
            .collect()
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        self.inner.typing.typing_users()
    }

    pub fn is_user_typing(&self, user_id: &str) -> bool {
        self.inner.typing.is_user_typing(user_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.subscription.connection_state()
    }

    pub async fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.inner
            .context
            .queue
            .get_queued_messages(&self.inner.conversation_id)
            .await
    }

    pub async fn has_queued_messages(&self) -> bool {
        self.inner
            .context
            .queue
            .has_queued_messages(&self.inner.conversation_id)
            .await
    }

    /// Drops every queued message. Their bubbles stay visible as failed.
    pub async fn clear_queued_messages(&self) {
        let inner = &self.inner;
        let dropped = inner.context.queue.get_queued_messages(&inner.conversation_id).await;
        inner
            .context
            .queue
            .clear_queued_messages(&inner.conversation_id)
            .await;
        for entry in dropped {
            inner.transition(&entry.id, DeliveryEvent::PublishFailed).await;
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ChatUpdate> {
        self.inner.updates.subscribe()
    }
}

impl Drop for MessagingOrchestrator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for slot in [&self.inner.retry_timer, &self.inner.typing_timer] {
            if let Some(handle) = lock_slot(slot).take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn emit(&self, update: ChatUpdate) {
        // No receivers just means nobody is watching.
        let _ = self.updates.send(update);
    }

    /// Encrypts with the conversation's current key, creating a fresh key
    /// when the table was cleared since the conversation was opened.
    fn encrypt(&self, plaintext: &str) -> std::result::Result<EncryptedContent, CryptoError> {
        let encryption = &self.context.encryption;
        let conversation_id = self.conversation_id.as_str();
        match encryption.encrypt_message(conversation_id, plaintext) {
            Err(CryptoError::NotInitialized(_)) => {
                info!(conversation_id, "conversation key missing; generating a new one");
                encryption.initialize(conversation_id);
                encryption.encrypt_message(conversation_id, plaintext)
            }
            other => other,
        }
    }

    async fn transition(&self, message_id: &MessageId, event: DeliveryEvent) -> DeliveryState {
        let next = {
            let mut state = self.state.write().await;
            let entry = state.delivery.entry(message_id.clone()).or_default();
            *entry = entry.apply(event);
            *entry
        };
        debug!(message_id = %message_id, ?event, state = ?next, "delivery state changed");
        self.emit(ChatUpdate::DeliveryChanged {
            message_id: message_id.clone(),
            state: next,
        });
        next
    }

    async fn drain_queue(&self) -> DrainOutcome {
        let _guard = self.drain_lock.lock().await;
        let queue = &self.context.queue;
        let mut outcome = DrainOutcome::default();

        while let Some(entry) = queue.peek(&self.conversation_id).await {
            if self.subscription.connection_state() != ConnectionState::Attached {
                debug!(conversation_id = %self.conversation_id, "channel detached; drain paused");
                break;
            }

            queue.mark_sending(&self.conversation_id, &entry.id).await;
            self.transition(&entry.id, DeliveryEvent::RetryStarted).await;

            let mut outbound = entry.message.clone();
            outbound.mark_offline_origin();
            if self.subscription.publish(&outbound).await {
                queue.remove(&self.conversation_id, &entry.id).await;
                self.transition(&entry.id, DeliveryEvent::PublishSucceeded).await;
                outcome.delivered += 1;
            } else {
                let retry_count = queue
                    .mark_attempt_failed(&self.conversation_id, &entry.id)
                    .await;
                self.transition(&entry.id, DeliveryEvent::PublishFailed).await;
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %entry.id,
                    ?retry_count,
                    "queued message failed; drain stopped"
                );
                outcome.failed = Some(entry.id);
                break;
            }
        }

        outcome.remaining = queue.len(&self.conversation_id).await;
        if outcome.delivered > 0 || outcome.failed.is_some() {
            info!(
                conversation_id = %self.conversation_id,
                delivered = outcome.delivered,
                remaining = outcome.remaining,
                "offline queue drained"
            );
        }
        outcome
    }

    async fn drain_and_reschedule(self: &Arc<Self>) -> DrainOutcome {
        let outcome = self.drain_queue().await;
        if outcome.failed.is_some() {
            self.schedule_retry();
        } else if outcome.remaining == 0 {
            self.retry_attempt.store(0, Ordering::Relaxed);
        }
        outcome
    }

    /// Arms a single backoff timer for the next drain attempt.
    fn schedule_retry(self: &Arc<Self>) {
        if !self.config.auto_retry {
            return;
        }

        let mut slot = lock_slot(&self.retry_timer);
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }

        let attempt = self.retry_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.config.retry.delay_for(attempt);
        debug!(conversation_id = %self.conversation_id, attempt, ?delay, "retry scheduled");

        let inner = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Release the slot so a failure in this pass can arm the next timer.
            lock_slot(&inner.retry_timer).take();
            inner.drain_and_reschedule().await;
        }));
    }

    async fn handle_inbound(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { message } => self.receive_message(message).await,
            ChannelEvent::Typing { .. } => {
                if self.typing.apply(&event) {
                    self.emit(ChatUpdate::TypingChanged);
                }
            }
            ChannelEvent::Presence { user_id, present } => {
                let changed = {
                    let mut state = self.state.write().await;
                    if present {
                        state.present_users.insert(user_id)
                    } else {
                        state.present_users.remove(&user_id)
                    }
                };
                if changed {
                    self.emit(ChatUpdate::PresenceChanged);
                }
            }
        }
    }

    async fn receive_message(&self, mut message: Message) {
        if message.conversation_id != self.conversation_id {
            debug!(conversation_id = %self.conversation_id, other = %message.conversation_id, "ignoring message for another conversation");
            return;
        }

        if message.is_offline_origin() {
            // A replay of one of our own queued messages confirms delivery.
            if self
                .context
                .queue
                .remove(&self.conversation_id, &message.id)
                .await
                .is_some()
            {
                self.transition(&message.id, DeliveryEvent::PublishSucceeded).await;
            }
            message.metadata.remove(OFFLINE_METADATA_KEY);
        }

        if let (Some(sealed), Some(key_id)) = (&message.encrypted_content, &message.key_id) {
            message.content = self.context.encryption.decrypt_message(sealed, key_id);
        }

        let mut history = self.context.history.lock(&self.conversation_id).await;
        let change = {
            let mut state = self.state.write().await;
            let change = state.store.add_message(message.clone(), history.ids());
            if change.is_some() {
                state
                    .delivery
                    .entry(message.id.clone())
                    .or_insert(DeliveryState::Sent);
            }
            change
        };

        let Some(change) = change else {
            debug!(message_id = %message.id, "message already in history");
            return;
        };
        history.commit(change);
        drop(history);
        self.context.conversations.record_message(&message, true);
        debug!(conversation_id = %self.conversation_id, message_id = %message.id, "message received");
        self.emit(ChatUpdate::MessageAdded(message.id));
    }
}

async fn pump_inbound(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = inbound.recv().await {
        inner.handle_inbound(event).await;
    }
}

async fn watch_connection(inner: Arc<Inner>, mut connection: watch::Receiver<ConnectionState>) {
    loop {
        let current = *connection.borrow_and_update();
        inner.emit(ChatUpdate::ConnectionChanged(current));

        if current == ConnectionState::Attached
            && inner
                .context
                .queue
                .has_queued_messages(&inner.conversation_id)
                .await
        {
            inner.drain_and_reschedule().await;
        }

        if connection.changed().await.is_err() {
            return;
        }
    }
}
