//! Incremental polling over the message log.
//!
//! A client loads the full log once, remembers the `serverTime` that came
//! with it, and from then on asks only for messages stamped after that
//! checkpoint. Every answer carries a fresh `serverTime` so the checkpoint
//! advances even when nothing new arrived.

use serde::{Deserialize, Serialize};

use crate::chat::{now_millis, ChatMessage};
use crate::store::{MessageStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

/// Hands out message stamps and checkpoints for one store.
///
/// Lives inside the store's write lock. A stamp is never lower than the
/// previous stamp and always strictly greater than every checkpoint handed
/// out so far, so a message can't land at or below a boundary a client
/// has already moved past.
#[derive(Debug, Default)]
pub struct SyncClock {
    last_stamp: i64,
    last_checkpoint: i64,
}

impl SyncClock {
    /// Raise the stamp floor to a timestamp already present in the log.
    pub fn observe(&mut self, timestamp: i64) {
        self.last_stamp = self.last_stamp.max(timestamp);
    }

    pub fn stamp(&mut self) -> i64 {
        self.stamp_at(now_millis())
    }

    pub fn checkpoint(&mut self) -> i64 {
        self.checkpoint_at(now_millis())
    }

    fn stamp_at(&mut self, now: i64) -> i64 {
        let stamp = now
            .max(self.last_stamp)
            .max(self.last_checkpoint.saturating_add(1));
        self.last_stamp = stamp;
        stamp
    }

    fn checkpoint_at(&mut self, now: i64) -> i64 {
        let checkpoint = now.max(self.last_stamp).max(self.last_checkpoint);
        self.last_checkpoint = checkpoint;
        checkpoint
    }
}

/// Messages with `since < timestamp` from anyone but `exclude_sender`, in log order.
pub fn select_since<'a>(
    messages: impl IntoIterator<Item = &'a ChatMessage>,
    since: i64,
    exclude_sender: &str,
) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|m| m.timestamp > since && m.sender != exclude_sender)
        .cloned()
        .collect()
}

/// Like [`select_since`] but bounded above by `server_time` (inclusive).
pub fn select_window<'a>(
    messages: impl IntoIterator<Item = &'a ChatMessage>,
    last_seen: i64,
    server_time: i64,
    exclude_sender: &str,
) -> SyncBatch {
    let messages = messages
        .into_iter()
        .filter(|m| m.timestamp > last_seen && m.timestamp <= server_time)
        .filter(|m| m.sender != exclude_sender)
        .cloned()
        .collect();

    SyncBatch {
        messages,
        server_time,
    }
}

pub async fn poll(
    store: &dyn MessageStore,
    last_seen: i64,
    exclude_sender: &str,
) -> Result<SyncBatch, StoreError> {
    store.sync_since(last_seen, exclude_sender).await
}

/// Client-held checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    last_seen: i64,
}

impl SyncCursor {
    /// Start from the `serverTime` of the initial load, not from the newest
    /// message's own timestamp.
    pub fn new(server_time: i64) -> Self {
        Self {
            last_seen: server_time,
        }
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Take the batch's messages and move the checkpoint to its `serverTime`.
    /// The checkpoint never moves backwards.
    pub fn advance(&mut self, batch: SyncBatch) -> Vec<ChatMessage> {
        self.last_seen = self.last_seen.max(batch.server_time);
        batch.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMessageStore;

    #[test]
    fn stamps_never_fall_behind_a_checkpoint() {
        let mut clock = SyncClock::default();
        let first = clock.stamp_at(1_000);
        assert_eq!(first, 1_000);

        let checkpoint = clock.checkpoint_at(1_000);
        assert_eq!(checkpoint, 1_000);

        // Same millisecond as the checkpoint: the stamp is pushed past it.
        assert_eq!(clock.stamp_at(1_000), 1_001);
        // Wall clock going backwards doesn't break ordering.
        assert_eq!(clock.stamp_at(900), 1_001);
        assert_eq!(clock.checkpoint_at(900), 1_001);
    }

    #[test]
    fn observed_timestamps_raise_the_floor() {
        let mut clock = SyncClock::default();
        clock.observe(5_000);
        assert_eq!(clock.stamp_at(4_000), 5_000);
        assert_eq!(clock.checkpoint_at(4_500), 5_000);
    }

    #[test]
    fn window_is_half_open_and_excludes_sender() {
        let log = vec![
            ChatMessage::new("guest", "a", 10),
            ChatMessage::new("assistant", "b", 20),
            ChatMessage::new("guest", "c", 30),
            ChatMessage::new("guest", "d", 40),
        ];

        let batch = select_window(&log, 10, 30, "assistant");
        assert_eq!(batch.server_time, 30);
        let texts: Vec<_> = batch.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["c"]);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cursor = SyncCursor::new(100);
        let messages = cursor.advance(SyncBatch {
            messages: vec![ChatMessage::new("guest", "hi", 90)],
            server_time: 50,
        });
        assert_eq!(messages.len(), 1);
        assert_eq!(cursor.last_seen(), 100);

        cursor.advance(SyncBatch {
            messages: vec![],
            server_time: 150,
        });
        assert_eq!(cursor.last_seen(), 150);
    }

    #[tokio::test]
    async fn poll_excludes_assistant_messages() {
        let store = MemoryMessageStore::new();
        store.append("guest", "hi").await.unwrap();
        store.append("assistant", "hello").await.unwrap();

        let batch = poll(&store, 0, "assistant").await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].message, "hi");
        assert_eq!(batch.messages[0].sender, "guest");
    }

    #[tokio::test]
    async fn repeated_poll_from_server_time_is_empty() {
        let store = MemoryMessageStore::new();
        store.append("guest", "one").await.unwrap();
        store.append("guest", "two").await.unwrap();

        let first = poll(&store, 0, "assistant").await.unwrap();
        assert_eq!(first.messages.len(), 2);

        let second = poll(&store, first.server_time, "assistant").await.unwrap();
        assert!(second.messages.is_empty());
        assert!(second.server_time >= first.server_time);
    }

    #[tokio::test]
    async fn message_in_checkpoint_millisecond_is_delivered_once() {
        let store = MemoryMessageStore::new();
        let mut cursor = SyncCursor::new(poll(&store, 0, "assistant").await.unwrap().server_time);

        // Appended immediately after the checkpoint, possibly in the same ms.
        store.append("guest", "late").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = poll(&store, cursor.last_seen(), "assistant").await.unwrap();
            seen.extend(cursor.advance(batch));
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "late");
    }
}
