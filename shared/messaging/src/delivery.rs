//! Delivery lifecycle of an outbound message.
//!
//! ```text
//! composing -> Sending -> Sent
//!                 |
//!                 +-> Queued / Failed -> Sending (retry) -> Sent | Queued / Failed
//! ```
//!
//! `Failed` is a transient display flag: a failed message is still held by the
//! offline queue and will be retried. The only durable outcomes are `Sent` and
//! "still queued".

use serde::{Deserialize, Serialize};

/// Status shown next to a message bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeliveryState {
    Sending { retry_count: u32 },
    Queued { retry_count: u32 },
    Sent,
    Failed { retry_count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    PublishSucceeded,
    PublishFailed,
    /// The channel was not attached, so the message went straight to the queue.
    WentOffline,
    RetryStarted,
}

impl DeliveryState {
    /// State of a message that has just left the composer.
    pub fn composing() -> Self {
        Self::Sending { retry_count: 0 }
    }

    pub fn apply(self, event: DeliveryEvent) -> Self {
        use DeliveryEvent::*;

        match (self, event) {
            (Self::Sent, _) => Self::Sent,
            (_, PublishSucceeded) => Self::Sent,
            (state, PublishFailed) => Self::Failed {
                retry_count: state.retry_count() + 1,
            },
            (state, WentOffline) => Self::Queued {
                retry_count: state.retry_count(),
            },
            (state, RetryStarted) => Self::Sending {
                retry_count: state.retry_count(),
            },
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Sending { retry_count }
            | Self::Queued { retry_count }
            | Self::Failed { retry_count } => *retry_count,
            Self::Sent => 0,
        }
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            Self::Sending { .. } => MessageStatus::Sending,
            Self::Queued { .. } => MessageStatus::Queued,
            Self::Sent => MessageStatus::Sent,
            Self::Failed { .. } => MessageStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::composing()
    }
}
