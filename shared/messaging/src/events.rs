//! Payloads carried over a conversation's realtime channel.

use crate::{now_ms, timestamp, Message, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChannelEvent {
    Message {
        message: Message,
    },
    Typing {
        user_id: String,
        #[serde(default)]
        username: Option<String>,
        is_typing: bool,
        #[serde(default = "now_ms", with = "timestamp")]
        timestamp: i64,
    },
    Presence {
        user_id: String,
        present: bool,
    },
}

impl ChannelEvent {
    pub fn typing(user_id: impl Into<String>, username: Option<String>, is_typing: bool) -> Self {
        Self::Typing {
            user_id: user_id.into(),
            username,
            is_typing,
            timestamp: now_ms(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
