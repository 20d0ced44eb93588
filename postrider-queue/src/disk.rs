//! On-disk queue storage: two files per record (`<id>.env` holds the
//! flattened message, `<id>.meta` the JSON metadata), written into a
//! scratch directory and renamed into place. Scratch and final
//! directories live under one root so the renames are atomic.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postrider_common::{ClientInfo, Envelope, Mailbox};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::storage::{
    QueueId, QueueMetadata, QueueStorage, StorageError, remove_recipient_indexes,
};

/// Everything about a record except its message bytes. The envelope
/// addresses live here because the `.env` blob carries only headers and
/// body.
#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    sender: Option<Mailbox>,
    recipients: Vec<Mailbox>,
    client: ClientInfo,
    receiver: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    attempts: u32,
    next_attempt: SystemTime,
}

/// Durable [`QueueStorage`] on the local filesystem.
#[derive(Debug)]
pub struct DiskStorage {
    current: PathBuf,
    scratch: PathBuf,
}

impl DiskStorage {
    /// Open (creating if needed) a disk queue rooted at `base`.
    pub async fn open(base: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base = base.as_ref();
        let current = base.join("cur");
        let scratch = base.join("tmp");
        fs::create_dir_all(&current).await?;
        fs::create_dir_all(&scratch).await?;
        Ok(Self { current, scratch })
    }

    fn env_path(&self, id: &QueueId) -> PathBuf {
        self.current.join(format!("{id}.env"))
    }

    fn meta_path(&self, id: &QueueId) -> PathBuf {
        self.current.join(format!("{id}.meta"))
    }

    /// Write `contents` into scratch and rename onto `target`.
    async fn write_atomic(&self, name: &str, target: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let staging = self.scratch.join(name);
        fs::write(&staging, contents).await?;
        fs::rename(&staging, target).await?;
        Ok(())
    }

    async fn read_meta(&self, id: &QueueId) -> Result<DiskMeta, StorageError> {
        let raw = match fs::read(self.meta_path(id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw).map_err(|err| StorageError::Corrupt {
            id: id.to_string(),
            reason: err.to_string(),
        })
    }

    async fn write_meta(&self, id: &QueueId, meta: &DiskMeta) -> Result<(), StorageError> {
        let rendered = serde_json::to_vec_pretty(meta)?;
        self.write_atomic(&format!("{id}.meta"), &self.meta_path(id), &rendered)
            .await
    }
}

#[async_trait]
impl QueueStorage for DiskStorage {
    async fn write(
        &self,
        envelope: &Envelope,
        metadata: &QueueMetadata,
    ) -> Result<QueueId, StorageError> {
        let id = QueueId::generate();
        let meta = DiskMeta {
            sender: envelope.sender.clone(),
            recipients: envelope.recipients.clone(),
            client: envelope.client.clone(),
            receiver: envelope.receiver.clone(),
            timestamp: envelope.timestamp,
            attempts: metadata.attempts,
            next_attempt: metadata.next_attempt,
        };

        // Envelope first; a record exists once its .meta lands.
        self.write_atomic(&format!("{id}.env"), &self.env_path(&id), &envelope.flatten())
            .await?;
        self.write_meta(&id, &meta).await?;
        debug!(%id, "queued envelope to disk");
        Ok(id)
    }

    async fn set_recipients_delivered(
        &self,
        id: &QueueId,
        indexes: &[usize],
    ) -> Result<(), StorageError> {
        let mut meta = self.read_meta(id).await?;
        remove_recipient_indexes(&mut meta.recipients, indexes);
        self.write_meta(id, &meta).await
    }

    async fn load_all(&self) -> Result<Vec<(QueueId, QueueMetadata)>, StorageError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".meta") else {
                continue;
            };
            let id = QueueId::from(stem.to_owned());
            match self.read_meta(&id).await {
                Ok(meta) => out.push((
                    id,
                    QueueMetadata {
                        attempts: meta.attempts,
                        next_attempt: meta.next_attempt,
                    },
                )),
                Err(err) => {
                    // One bad record must not keep the queue down.
                    warn!(%id, error = %err, "skipping unreadable queue record");
                }
            }
        }
        Ok(out)
    }

    async fn get(&self, id: &QueueId) -> Result<(Envelope, QueueMetadata), StorageError> {
        let meta = self.read_meta(id).await?;
        let message = match fs::read(self.env_path(id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::Corrupt {
                    id: id.to_string(),
                    reason: "metadata present but envelope blob missing".into(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mut envelope = Envelope::new(meta.sender);
        envelope.parse_message(&message);
        envelope.recipients = meta.recipients;
        envelope.client = meta.client;
        envelope.receiver = meta.receiver;
        envelope.timestamp = meta.timestamp;
        Ok((
            envelope,
            QueueMetadata {
                attempts: meta.attempts,
                next_attempt: meta.next_attempt,
            },
        ))
    }

    async fn write_metadata(
        &self,
        id: &QueueId,
        metadata: &QueueMetadata,
    ) -> Result<(), StorageError> {
        let mut meta = self.read_meta(id).await?;
        meta.attempts = metadata.attempts;
        meta.next_attempt = metadata.next_attempt;
        self.write_meta(id, &meta).await
    }

    async fn remove(&self, id: &QueueId) -> Result<(), StorageError> {
        for path in [self.meta_path(id), self.env_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
