//! In-memory queue storage, for tests and relay-only deployments that
//! accept losing the queue on restart.

use async_trait::async_trait;
use dashmap::DashMap;
use postrider_common::Envelope;

use crate::storage::{
    QueueId, QueueMetadata, QueueStorage, StorageError, remove_recipient_indexes,
};

#[derive(Debug, Clone)]
struct Record {
    envelope: Envelope,
    metadata: QueueMetadata,
}

/// Non-durable [`QueueStorage`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: DashMap<QueueId, Record>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &QueueId) -> bool {
        self.records.contains_key(id)
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
    async fn write(
        &self,
        envelope: &Envelope,
        metadata: &QueueMetadata,
    ) -> Result<QueueId, StorageError> {
        let id = QueueId::generate();
        self.records.insert(
            id.clone(),
            Record {
                envelope: envelope.clone(),
                metadata: metadata.clone(),
            },
        );
        Ok(id)
    }

    async fn set_recipients_delivered(
        &self,
        id: &QueueId,
        indexes: &[usize],
    ) -> Result<(), StorageError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;
        remove_recipient_indexes(&mut record.envelope.recipients, indexes);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(QueueId, QueueMetadata)>, StorageError> {
        Ok(self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metadata.clone()))
            .collect())
    }

    async fn get(&self, id: &QueueId) -> Result<(Envelope, QueueMetadata), StorageError> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;
        Ok((record.envelope.clone(), record.metadata.clone()))
    }

    async fn write_metadata(
        &self,
        id: &QueueId,
        metadata: &QueueMetadata,
    ) -> Result<(), StorageError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;
        record.metadata = metadata.clone();
        Ok(())
    }

    async fn remove(&self, id: &QueueId) -> Result<(), StorageError> {
        self.records.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::{Envelope, Mailbox};

    use super::MemoryStorage;
    use crate::storage::{QueueMetadata, QueueStorage, StorageError};

    fn envelope() -> Envelope {
        let mut env = Envelope::new(Some(Mailbox::parse("a@x.example").unwrap()));
        env.recipients = vec![
            Mailbox::parse("one@y.example").unwrap(),
            Mailbox::parse("two@y.example").unwrap(),
        ];
        env
    }

    #[tokio::test]
    async fn write_get_round_trip() {
        let store = MemoryStorage::new();
        let id = store
            .write(&envelope(), &QueueMetadata::fresh())
            .await
            .unwrap();
        let (env, meta) = store.get(&id).await.unwrap();
        assert_eq!(env.recipients.len(), 2);
        assert_eq!(meta.attempts, 0);
    }

    #[tokio::test]
    async fn delivered_recipients_disappear_from_get() {
        let store = MemoryStorage::new();
        let id = store
            .write(&envelope(), &QueueMetadata::fresh())
            .await
            .unwrap();
        store.set_recipients_delivered(&id, &[0]).await.unwrap();
        let (env, _) = store.get(&id).await.unwrap();
        assert_eq!(env.recipients.len(), 1);
        assert_eq!(env.recipients[0].as_str(), "two@y.example");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryStorage::new();
        let id = store
            .write(&envelope(), &QueueMetadata::fresh())
            .await
            .unwrap();
        store.remove(&id).await.unwrap();
        store.remove(&id).await.unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
