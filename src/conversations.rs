//! JSON file conversation store.
//!
//! All conversations live in one JSON object keyed by conversation id:
//!
//! ```json
//! { "6f1c…": { "title": "Untitled", "messages": [{ "role": "user", "content": "…" }] } }
//! ```
//!
//! Every operation is load → modify → save under a store-wide async mutex.
//! Saves write a temporary file, fsync it, and rename it over the old one, so
//! a crash never leaves a half-written store behind. A file that cannot be
//! read or parsed lists as empty, but is never overwritten: create, delete,
//! and append fail with [`StoreError::Corrupt`] or [`StoreError::Io`] until
//! it is repaired.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ChatMessage, Conversation};

pub type ConversationMap = BTreeMap<String, Conversation>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("message {0} is not a user message followed by an assistant reply")]
    NotEditable(usize),

    #[error("conversation store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversation file {} is unreadable: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode conversations: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ConversationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All conversations. A missing or unreadable file reads as empty.
    pub async fn list(&self) -> ConversationMap {
        let _guard = self.lock.lock().await;
        self.load().await.unwrap_or_else(|e| {
            warn!(error = %e, "listing conversations as empty");
            ConversationMap::new()
        })
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.list().await.remove(id)
    }

    /// Creates an empty "Untitled" conversation and returns its id.
    pub async fn create(&self) -> Result<String, StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        let id = Uuid::new_v4().to_string();
        map.insert(id.clone(), Conversation::default());
        self.save(&map).await?;
        debug!(id = %id, "conversation created");
        Ok(id)
    }

    /// Removes a conversation. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(id).is_none() {
            return Ok(false);
        }
        self.save(&map).await?;
        Ok(true)
    }

    /// Appends a user turn and the assistant's reply to a conversation.
    pub async fn append_turn(&self, id: &str, user: &str, assistant: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        let conversation = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conversation.messages.push(ChatMessage::user(user));
        conversation.messages.push(ChatMessage::assistant(assistant));
        self.save(&map).await
    }

    /// Reads the whole store. Only a missing file reads as empty.
    /// Replaces user message `index` and its reply, dropping every later
    /// message. Returns the updated conversation.
    pub async fn rewrite_turn(
        &self,
        id: &str,
        index: usize,
        user: &str,
        assistant: &str,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        let conversation = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !conversation.is_editable(index) {
            return Err(StoreError::NotEditable(index));
        }
        conversation.messages.truncate(index);
        conversation.messages.push(ChatMessage::user(user));
        conversation.messages.push(ChatMessage::assistant(assistant));
        let updated = conversation.clone();
        self.save(&map).await?;
        Ok(updated)
    }

    async fn load(&self) -> Result<ConversationMap, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConversationMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, map: &ConversationMap) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(map)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = json.len(), "conversations saved");
        Ok(())
    }
}

/// Per-conversation turn locks.
///
/// A chat turn holds its conversation's lock from the moment it starts until
/// its reply is stored. Waiters are served first come, first served, so the
/// turns of one conversation are answered and stored in arrival order.
/// Different conversations never wait on each other. An id's entry lives
/// only while some turn holds or waits for it.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Arc<StdMutex<LockMap>>,
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &str) -> TurnGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        TurnGuard {
            id: id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of ids with a held or awaited lock.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held for the duration of one turn. Dropping it releases the lock and
/// removes the id's entry when nobody else is waiting on it.
pub struct TurnGuard {
    id: String,
    locks: Arc<StdMutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        // The guard owns a reference to the mutex; release it before counting.
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}
