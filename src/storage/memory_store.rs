use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{sort_snapshot, OperationId, OperationPatch, OperationStore, Payload, PendingOperation, StorageError};
use crate::common::TimestampMs;

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<OperationId, PendingOperation>,
    next_id: u64,
}

/// In-process operation store with the same semantics as the sled store,
/// minus durability. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryOperationStore {
    state: Mutex<MemoryState>,
    max_pending: Option<usize>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Payload,
        created_at: TimestampMs,
    ) -> Result<OperationId, StorageError> {
        let mut state = self.state.lock().await;

        if let Some(limit) = self.max_pending {
            if state.entries.len() >= limit {
                return Err(StorageError::QuotaExceeded { limit });
            }
        }

        state.next_id = state.next_id.wrapping_add(1);
        let id = OperationId::new(state.next_id);
        state
            .entries
            .insert(id, PendingOperation::new(id, kind, payload, created_at));
        Ok(id)
    }

    async fn list_pending(&self) -> Result<Vec<PendingOperation>, StorageError> {
        let mut ops: Vec<PendingOperation> = self.state.lock().await.entries.values().cloned().collect();
        sort_snapshot(&mut ops);
        Ok(ops)
    }

    async fn get(&self, id: OperationId) -> Result<Option<PendingOperation>, StorageError> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn update(&self, id: OperationId, patch: OperationPatch) -> Result<(), StorageError> {
        if let Some(op) = self.state.lock().await.entries.get_mut(&id) {
            op.apply(&patch);
        }
        Ok(())
    }

    async fn remove(&self, id: OperationId) -> Result<(), StorageError> {
        self.state.lock().await.entries.remove(&id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.state.lock().await.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_update_remove() {
        let store = MemoryOperationStore::new();
        let a = store.enqueue("add_report", Payload::from("a"), 5).await.unwrap();
        let b = store.enqueue("add_report", Payload::from("b"), 5).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        store
            .update(a, OperationPatch { attempts: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(store.get(a).await.unwrap().unwrap().attempts, 1);

        store.remove(a).await.unwrap();
        store.remove(a).await.unwrap();
        store
            .update(a, OperationPatch { attempts: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert!(store.get(a).await.unwrap().is_none());

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }

    #[tokio::test]
    async fn clear_keeps_id_sequence() {
        let store = MemoryOperationStore::new();
        store.enqueue("add_report", Payload::from("a"), 1).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        let id = store.enqueue("add_report", Payload::from("b"), 2).await.unwrap();
        assert_eq!(id.as_u64(), 2);
    }

    #[tokio::test]
    async fn enqueue_rejects_when_full() {
        let store = MemoryOperationStore::new().with_max_pending(Some(1));
        store.enqueue("add_report", Payload::from("a"), 1).await.unwrap();
        let res = store.enqueue("add_report", Payload::from("b"), 1).await;
        assert!(matches!(res, Err(StorageError::QuotaExceeded { limit: 1 })));
    }
}
