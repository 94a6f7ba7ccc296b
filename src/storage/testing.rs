use async_trait::async_trait;

use super::{
    MemoryOperationStore, OperationId, OperationPatch, OperationStore, Payload, PendingOperation,
    StorageError,
};
use crate::common::TimestampMs;

/// Store that accepts and lists entries but fails every `update` and `remove`.
#[derive(Default)]
pub(crate) struct BrokenWrites {
    inner: MemoryOperationStore,
}

impl BrokenWrites {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn disk_full() -> StorageError {
        StorageError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }
}

#[async_trait]
impl OperationStore for BrokenWrites {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Payload,
        created_at: TimestampMs,
    ) -> Result<OperationId, StorageError> {
        self.inner.enqueue(kind, payload, created_at).await
    }

    async fn list_pending(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.inner.list_pending().await
    }

    async fn get(&self, id: OperationId) -> Result<Option<PendingOperation>, StorageError> {
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.inner.count().await
    }

    async fn update(&self, _id: OperationId, _patch: OperationPatch) -> Result<(), StorageError> {
        Err(Self::disk_full())
    }

    async fn remove(&self, _id: OperationId) -> Result<(), StorageError> {
        Err(Self::disk_full())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}
