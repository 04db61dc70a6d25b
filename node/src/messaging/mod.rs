//! Message pipeline: validation, encryption, offline queueing, paginated
//! history and typing indicators, tied together per conversation by
//! [`MessagingOrchestrator`].

mod backoff;
mod conversations;
mod history;
mod pipeline;
mod queue;
mod typing;

pub use backoff::RetryPolicy;
pub use conversations::ConversationRegistry;
pub use history::{
    HistoryChange, HistoryLock, HistoryRepository, PaginatedMessageStore, StoredHistory,
    DEFAULT_PAGE_SIZE,
};
pub use pipeline::{
    ChatUpdate, DisplayMessage, DrainOutcome, MessagingContext, MessagingOrchestrator,
    PipelineConfig,
};
pub use queue::OfflineQueue;
pub use typing::{local_typing_user_id, TypingIndicatorTracker, SWEEP_INTERVAL, TYPING_EXPIRY};

use crate::realtime::ChannelError;
use deskchat_crypto_core::CryptoError;

/// Errors surfaced by the few orchestrator operations that can fail
/// outright. Sending and receiving never return these.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("encryption error: {0}")]
    Encryption(#[from] CryptoError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
