use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Sender name used by the assistant agent when it writes replies.
pub const ASSISTANT: &str = "assistant";

/// Sender name used when a client posts without naming itself.
pub const GUEST: &str = "guest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// Body accepted by the chat POST routes.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub message: String,
    #[serde(default)]
    pub sender: Option<String>,
}

impl NewMessage {
    pub fn sender(&self) -> &str {
        match self.sender.as_deref() {
            Some(sender) if !sender.is_empty() => sender,
            _ => GUEST,
        }
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
