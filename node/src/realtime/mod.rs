//! Named publish/subscribe channels carrying [`ChannelEvent`]s.
//!
//! The hosted realtime provider sits behind [`RealtimeTransport`];
//! [`LocalTransport`] is the in-process implementation used by the node binary
//! and by tests.

mod local;
mod subscription;

pub use local::{LocalChannel, LocalTransport};
pub use subscription::MessageSubscription;

use async_trait::async_trait;
use deskchat_messaging::ChannelEvent;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initializing,
    Attached,
    Detached,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is not attached")]
    NotAttached(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("channel closed")]
    Closed,
}

/// Inbound events of one channel. Ends when the connection drops; a new
/// stream has to be requested after reattaching.
pub type EventStream = BoxStream<'static, ChannelEvent>;

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> watch::Receiver<ConnectionState>;

    async fn publish(&self, event: ChannelEvent) -> Result<(), ChannelError>;

    fn events(&self) -> EventStream;
}

pub trait RealtimeTransport: Send + Sync {
    fn channel(&self, name: &str) -> Arc<dyn RealtimeChannel>;
}
