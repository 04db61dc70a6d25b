//! "Who is typing" state for one conversation.

use crate::realtime::MessageSubscription;
use crate::storage::{keys, KeyValueStore};
use deskchat_messaging::{ChannelEvent, TypingUser};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

pub const TYPING_EXPIRY: Duration = Duration::from_secs(5);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Returns the typing identity of this installation, generating and
/// persisting one on first use.
pub fn local_typing_user_id(store: &dyn KeyValueStore) -> String {
    match store.get(keys::TYPING_USER_ID) {
        Ok(Some(id)) if !id.is_empty() => return id,
        Ok(_) => {}
        Err(err) => warn!(%err, "failed to read typing user id"),
    }

    let id = format!("user_{}", Uuid::new_v4().simple());
    if let Err(err) = store.set(keys::TYPING_USER_ID, &id) {
        warn!(%err, "failed to persist typing user id");
    }
    id
}

#[derive(Debug, Clone)]
struct TrackedUser {
    user: TypingUser,
    last_seen: Instant,
}

type TrackedUsers = Arc<Mutex<HashMap<String, TrackedUser>>>;

fn lock(users: &TrackedUsers) -> MutexGuard<'_, HashMap<String, TrackedUser>> {
    users.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sweep_expired(users: &TrackedUsers, expiry: Duration) -> usize {
    let now = Instant::now();
    let mut users = lock(users);
    let before = users.len();
    users.retain(|_, tracked| now.duration_since(tracked.last_seen) <= expiry);
    before - users.len()
}

pub struct TypingIndicatorTracker {
    subscription: Arc<MessageSubscription>,
    user_id: String,
    users: TrackedUsers,
    expiry: Duration,
    sweeper: JoinHandle<()>,
}

impl TypingIndicatorTracker {
    pub fn new(
        subscription: Arc<MessageSubscription>,
        user_id: String,
        expiry: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let users: TrackedUsers = Arc::default();

        let sweeper = tokio::spawn({
            let users = Arc::clone(&users);
            async move {
                let mut ticker = interval(sweep_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let dropped = sweep_expired(&users, expiry);
                    if dropped > 0 {
                        debug!(dropped, "expired typing indicators");
                    }
                }
            }
        });

        Self {
            subscription,
            user_id,
            users,
            expiry,
            sweeper,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Applies an inbound typing event. Returns `true` when the tracked set
    /// changed. Events carrying this tracker's own user id are ignored.
    pub fn apply(&self, event: &ChannelEvent) -> bool {
        let ChannelEvent::Typing {
            user_id,
            username,
            is_typing,
            timestamp,
        } = event
        else {
            return false;
        };
        if *user_id == self.user_id {
            return false;
        }

        let mut users = lock(&self.users);
        if *is_typing {
            users.insert(
                user_id.clone(),
                TrackedUser {
                    user: TypingUser {
                        user_id: user_id.clone(),
                        username: username.clone(),
                        timestamp: *timestamp,
                    },
                    last_seen: Instant::now(),
                },
            );
            true
        } else {
            users.remove(user_id).is_some()
        }
    }

    /// Drops users whose last typing event is older than the expiry window.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.users, self.expiry)
    }

    pub fn is_user_typing(&self, user_id: &str) -> bool {
        lock(&self.users).contains_key(user_id)
    }

    /// Currently typing users, ordered by user id.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        let mut users: Vec<TypingUser> = lock(&self.users)
            .values()
            .map(|tracked| tracked.user.clone())
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn send_typing_indicator(&self, is_typing: bool, username: Option<String>) -> bool {
        self.subscription
            .publish_typing(&self.user_id, username, is_typing)
            .await
    }
}

impl Drop for TypingIndicatorTracker {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{LocalTransport, RealtimeTransport};
    use crate::storage::MemoryStore;
    use deskchat_messaging::ConversationId;

    fn tracker(transport: &LocalTransport) -> TypingIndicatorTracker {
        let (subscription, _rx) =
            MessageSubscription::subscribe(ConversationId::new("c1"), transport.channel("c1"));
        TypingIndicatorTracker::new(
            Arc::new(subscription),
            "me".into(),
            TYPING_EXPIRY,
            SWEEP_INTERVAL,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn typing_users_expire_after_window() {
        let tracker = tracker(&LocalTransport::new());

        assert!(tracker.apply(&ChannelEvent::typing("agent-1", Some("Dana".into()), true)));
        assert!(tracker.is_user_typing("agent-1"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(tracker.is_user_typing("agent-1"));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(!tracker.is_user_typing("agent-1"));
        assert!(tracker.typing_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_the_window() {
        let tracker = tracker(&LocalTransport::new());

        tracker.apply(&ChannelEvent::typing("agent-1", None, true));
        tokio::time::sleep(Duration::from_secs(4)).await;
        tracker.apply(&ChannelEvent::typing("agent-1", None, true));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(tracker.is_user_typing("agent-1"));
    }

    #[tokio::test]
    async fn stop_event_removes_immediately_and_own_events_are_ignored() {
        let tracker = tracker(&LocalTransport::new());

        tracker.apply(&ChannelEvent::typing("agent-1", None, true));
        assert!(tracker.apply(&ChannelEvent::typing("agent-1", None, false)));
        assert!(!tracker.is_user_typing("agent-1"));

        assert!(!tracker.apply(&ChannelEvent::typing("me", None, true)));
        assert!(!tracker.is_user_typing("me"));
    }

    #[tokio::test]
    async fn send_requires_attached_channel() {
        let transport = LocalTransport::new();
        let tracker = tracker(&transport);
        assert!(!tracker.send_typing_indicator(true, None).await);

        transport.attach("c1");
        assert!(tracker.send_typing_indicator(true, Some("Sam".into())).await);
    }

    #[test]
    fn typing_user_id_is_stable() {
        let store = MemoryStore::new();
        let first = local_typing_user_id(&store);
        assert!(first.starts_with("user_"));
        assert_eq!(local_typing_user_id(&store), first);
    }
}
