use crate::{
    chat::ChatMessage,
    sync::{select_since, select_window, SyncBatch, SyncClock},
};
use async_trait::async_trait;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message log at {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode message log: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    /// Stable code reported to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Corrupt { .. } => "store_corrupt",
            StoreError::Io { .. } | StoreError::Encode(_) => "store_io",
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable, ordered record of chat exchanges.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stamp and append a message, returning the stored record.
    async fn append(&self, sender: &str, message: &str) -> Result<ChatMessage, StoreError>;

    /// The whole log in append order.
    async fn read_all(&self) -> Result<Vec<ChatMessage>, StoreError>;

    /// Messages stamped after `since` whose sender isn't `exclude_sender`.
    async fn read_since(
        &self,
        since: i64,
        exclude_sender: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.read_all().await?;
        Ok(select_since(&messages, since, exclude_sender))
    }

    /// The whole log together with a checkpoint to start polling from.
    async fn snapshot(&self) -> Result<SyncBatch, StoreError>;

    /// Take a checkpoint and return everything in `(last_seen, checkpoint]`
    /// not sent by `exclude_sender`.
    async fn sync_since(
        &self,
        last_seen: i64,
        exclude_sender: &str,
    ) -> Result<SyncBatch, StoreError>;
}

/// Message log kept as a single JSON array on disk.
///
/// The file is re-read on every read so that replies written straight to
/// it by the assistant process show up. Writes from this process go
/// through one mutex and replace the file atomically.
#[derive(Debug)]
pub struct FileMessageStore {
    path: PathBuf,
    write_lock: Mutex<SyncClock>,
}

impl FileMessageStore {
    /// Open the store, creating its directory if needed. The file itself is
    /// written on first append; until then the log is empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let mut clock = SyncClock::default();
        match load_log(&path).await {
            Ok(messages) => {
                if let Some(newest) = messages.iter().map(|m| m.timestamp).max() {
                    clock.observe(newest);
                }
                debug!("Opened message log {} ({} messages)", path.display(), messages.len());
            }
            // Leave it to the read path to report; the server can still start.
            Err(e @ StoreError::Corrupt { .. }) => warn!("{}", e),
            Err(e) => return Err(e),
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(clock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, messages: &[ChatMessage]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(messages).map_err(StoreError::Encode)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        Ok(())
    }
}

async fn load_log(path: &Path) -> Result<Vec<ChatMessage>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Checkpoint at or after everything in `messages`, including entries
/// written by other processes with clocks ahead of ours.
fn checkpoint_after(clock: &mut SyncClock, messages: &[ChatMessage]) -> i64 {
    if let Some(newest) = messages.iter().map(|m| m.timestamp).max() {
        clock.observe(newest);
    }
    clock.checkpoint()
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn append(&self, sender: &str, message: &str) -> Result<ChatMessage, StoreError> {
        let mut clock = self.write_lock.lock().await;

        let mut messages = load_log(&self.path).await?;
        if let Some(last) = messages.last() {
            clock.observe(last.timestamp);
        }

        let msg = ChatMessage::new(sender, message, clock.stamp());
        messages.push(msg.clone());
        self.persist(&messages).await?;

        debug!("Appended message from {} at {}", msg.sender, msg.timestamp);
        Ok(msg)
    }

    async fn read_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        load_log(&self.path).await
    }

    async fn snapshot(&self) -> Result<SyncBatch, StoreError> {
        let mut clock = self.write_lock.lock().await;
        let messages = load_log(&self.path).await?;
        let server_time = checkpoint_after(&mut clock, &messages);
        Ok(SyncBatch {
            messages,
            server_time,
        })
    }

    async fn sync_since(
        &self,
        last_seen: i64,
        exclude_sender: &str,
    ) -> Result<SyncBatch, StoreError> {
        let mut clock = self.write_lock.lock().await;
        let messages = load_log(&self.path).await?;
        let server_time = checkpoint_after(&mut clock, &messages);
        Ok(select_window(&messages, last_seen, server_time, exclude_sender))
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    messages: Vec<ChatMessage>,
    clock: SyncClock,
}

/// Non-persistent store for ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    log: Mutex<MemoryLog>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, sender: &str, message: &str) -> Result<ChatMessage, StoreError> {
        let mut log = self.log.lock().await;
        let msg = ChatMessage::new(sender, message, log.clock.stamp());
        log.messages.push(msg.clone());
        Ok(msg)
    }

    async fn read_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.log.lock().await.messages.clone())
    }

    async fn snapshot(&self) -> Result<SyncBatch, StoreError> {
        let mut log = self.log.lock().await;
        let server_time = log.clock.checkpoint();
        Ok(SyncBatch {
            messages: log.messages.clone(),
            server_time,
        })
    }

    async fn sync_since(
        &self,
        last_seen: i64,
        exclude_sender: &str,
    ) -> Result<SyncBatch, StoreError> {
        let mut log = self.log.lock().await;
        let server_time = log.clock.checkpoint();
        Ok(select_window(&log.messages, last_seen, server_time, exclude_sender))
    }
}
