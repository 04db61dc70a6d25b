use super::{ChannelError, ConnectionState, EventStream, RealtimeChannel, RealtimeTransport};
use async_trait::async_trait;
use deskchat_messaging::ChannelEvent;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// In-process channel: every subscriber sees every published event,
/// including its own.
pub struct LocalChannel {
    name: String,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
}

impl LocalChannel {
    fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Initializing);
        Self {
            name: name.to_owned(),
            events,
            state,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(channel = %self.name, state = ?next, "channel state changed");
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl RealtimeChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn publish(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        if self.current_state() != ConnectionState::Attached {
            return Err(ChannelError::NotAttached(self.name.clone()));
        }
        // No receivers is not a failure; the event simply has no audience yet.
        if self.events.send(event).is_err() {
            debug!(channel = %self.name, "published with no subscribers");
        }
        Ok(())
    }

    fn events(&self) -> EventStream {
        if self.current_state() == ConnectionState::Detached {
            return stream::empty().boxed();
        }

        let name = self.name.clone();
        let rx = self.events.subscribe();
        let state = self.state.subscribe();

        stream::unfold((rx, state), move |(mut rx, mut state)| {
            let name = name.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        received = rx.recv() => match received {
                            Ok(event) => return Some((event, (rx, state))),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(channel = %name, skipped, "subscriber lagged; events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                        changed = state.changed() => {
                            if changed.is_err() || *state.borrow() == ConnectionState::Detached {
                                return None;
                            }
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

/// Registry of [`LocalChannel`]s by name. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct LocalTransport {
    channels: Arc<Mutex<HashMap<String, Arc<LocalChannel>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalChannel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_channel(&self, name: &str) -> Arc<LocalChannel> {
        Arc::clone(
            self.channels()
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(LocalChannel::new(name))),
        )
    }

    pub fn attach(&self, name: &str) {
        self.local_channel(name).set_state(ConnectionState::Attached);
    }

    pub fn detach(&self, name: &str) {
        self.local_channel(name).set_state(ConnectionState::Detached);
    }

    pub fn connection_state(&self, name: &str) -> ConnectionState {
        self.local_channel(name).current_state()
    }
}

impl RealtimeTransport for LocalTransport {
    fn channel(&self, name: &str) -> Arc<dyn RealtimeChannel> {
        self.local_channel(name)
    }
}
