//! Hypebot IPC
//!
//! Message types shared between the decision core, the schedulers, and
//! the transport adapter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const OUTBOUND_CAPACITY: usize = 256;

/// One inbound group message as seen by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub chat_id: i64,
    pub text: String,
    pub is_mention: bool,
    pub timestamp: DateTime<Utc>,
}

/// One message the core wants sent to a chat. Fire-and-forget: a failed
/// send is logged by the transport and never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<i64>,
}

impl OutboundMessage {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}
