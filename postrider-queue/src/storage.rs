//! The durable storage contract the queue engine drives.

use core::fmt::{self, Display, Formatter};
use std::time::SystemTime;

use async_trait::async_trait;
use postrider_common::Envelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of a stored queue record. UUID-shaped, but callers
/// must not rely on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    /// Mint a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for QueueId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Delivery bookkeeping attached to a stored envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetadata {
    /// Completed delivery attempts; starts at zero.
    pub attempts: u32,
    /// Absolute time of the next scheduled attempt.
    pub next_attempt: SystemTime,
}

impl QueueMetadata {
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            attempts: 0,
            next_attempt: SystemTime::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("queue record not found: {0}")]
    NotFound(QueueId),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt queue record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable persistence for queued envelopes.
///
/// Implementations must make `write` durable before returning, keep
/// metadata updates from corrupting the envelope, and treat `remove` of
/// an unknown id as success.
#[async_trait]
pub trait QueueStorage: Send + Sync + std::fmt::Debug {
    /// Persist an envelope and its metadata atomically, returning the
    /// new record's id.
    async fn write(
        &self,
        envelope: &Envelope,
        metadata: &QueueMetadata,
    ) -> Result<QueueId, StorageError>;

    /// Mark the recipients at `indexes` (positions in the currently
    /// stored recipient list) as delivered, so later `get` calls return
    /// a narrowed envelope.
    async fn set_recipients_delivered(
        &self,
        id: &QueueId,
        indexes: &[usize],
    ) -> Result<(), StorageError>;

    /// Every stored record, for rescheduling at startup.
    async fn load_all(&self) -> Result<Vec<(QueueId, QueueMetadata)>, StorageError>;

    async fn get(&self, id: &QueueId) -> Result<(Envelope, QueueMetadata), StorageError>;

    /// Replace a record's metadata without touching the envelope.
    async fn write_metadata(
        &self,
        id: &QueueId,
        metadata: &QueueMetadata,
    ) -> Result<(), StorageError>;

    /// Remove a record. Idempotent.
    async fn remove(&self, id: &QueueId) -> Result<(), StorageError>;
}

/// Remove the recipients at `indexes` from a recipient list, highest
/// index first so the positions stay valid.
pub(crate) fn remove_recipient_indexes<T>(recipients: &mut Vec<T>, indexes: &[usize]) {
    let mut sorted: Vec<usize> = indexes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for index in sorted.into_iter().rev() {
        if index < recipients.len() {
            recipients.remove(index);
        }
    }
}
