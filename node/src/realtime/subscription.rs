use super::{ChannelError, ConnectionState, RealtimeChannel};
use deskchat_messaging::{ChannelEvent, ConversationId, Message, MessageId};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pause before reopening a stream that ended while the channel still
/// reported itself attached.
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Message ids remembered for echo filtering. Older ids fall out first; a
/// late duplicate of one is still caught by the history id set.
const SEEN_CAPACITY: usize = 1_000;

/// Insertion-ordered id set that forgets its oldest entries past capacity.
struct SeenIds {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when `id` is already remembered.
    fn insert(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

type SharedSeenIds = Arc<Mutex<SeenIds>>;

/// Binds a conversation to its realtime channel.
///
/// Inbound message events whose id is already known are dropped, except
/// messages re-published from an offline queue, which are let through so the
/// receiver can reconcile them. Typing and presence events always pass.
pub struct MessageSubscription {
    conversation_id: ConversationId,
    channel: Arc<dyn RealtimeChannel>,
    seen: SharedSeenIds,
    pump: JoinHandle<()>,
}

impl MessageSubscription {
    pub fn subscribe(
        conversation_id: ConversationId,
        channel: Arc<dyn RealtimeChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(SeenIds::with_capacity(SEEN_CAPACITY)));

        let pump = tokio::spawn(pump_events(
            conversation_id.clone(),
            Arc::clone(&channel),
            Arc::clone(&seen),
            tx,
        ));

        debug!(conversation_id = %conversation_id, channel = channel.name(), "subscribed");
        let subscription = Self {
            conversation_id,
            channel,
            seen,
            pump,
        };
        (subscription, rx)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.channel.state().borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.state()
    }

    /// Records ids already present locally so their echoes are ignored.
    pub fn mark_known<'a>(&self, ids: impl IntoIterator<Item = &'a MessageId>) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            seen.insert(id);
        }
    }

    /// Publishes a message event. Returns `false` instead of failing when the
    /// channel is not attached or rejects the publish.
    pub async fn publish(&self, message: &Message) -> bool {
        if self.connection_state() != ConnectionState::Attached {
            debug!(message_id = %message.id, "channel not attached; publish skipped");
            return false;
        }

        self.mark_known([&message.id]);
        let event = ChannelEvent::Message {
            message: message.clone(),
        };
        match self.channel.publish(event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %message.id,
                    %err,
                    "message publish failed"
                );
                false
            }
        }
    }

    pub async fn publish_typing(
        &self,
        user_id: &str,
        username: Option<String>,
        is_typing: bool,
    ) -> bool {
        match self
            .channel
            .publish(ChannelEvent::typing(user_id, username, is_typing))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                debug!(conversation_id = %self.conversation_id, %err, "typing publish failed");
                false
            }
        }
    }

    pub async fn publish_presence(&self, user_id: &str, present: bool) -> Result<(), ChannelError> {
        self.channel
            .publish(ChannelEvent::Presence {
                user_id: user_id.to_owned(),
                present,
            })
            .await
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn admit(seen: &Mutex<SeenIds>, event: &ChannelEvent) -> bool {
    match event {
        ChannelEvent::Message { message } => {
            let fresh = seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(&message.id);
            fresh || message.is_offline_origin()
        }
        ChannelEvent::Typing { .. } | ChannelEvent::Presence { .. } => true,
    }
}

async fn pump_events(
    conversation_id: ConversationId,
    channel: Arc<dyn RealtimeChannel>,
    seen: SharedSeenIds,
    tx: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut state = channel.state();

    loop {
        let mut events = channel.events();
        while let Some(event) = events.next().await {
            if !admit(&seen, &event) {
                debug!(conversation_id = %conversation_id, "duplicate message dropped");
                continue;
            }
            if tx.send(event).is_err() {
                return;
            }
        }

        if *state.borrow_and_update() == ConnectionState::Attached {
            tokio::time::sleep(RESTART_DELAY).await;
            if state.has_changed().is_err() {
                return;
            }
            continue;
        }

        debug!(conversation_id = %conversation_id, "inbound stream ended; waiting for reattach");
        if state
            .wait_for(|current| *current == ConnectionState::Attached)
            .await
            .is_err()
        {
            return;
        }
        debug!(conversation_id = %conversation_id, "channel reattached; reopening stream");
    }
}
