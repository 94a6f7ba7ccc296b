pub mod command;
pub mod handler;
pub mod kind;
pub mod processor;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::common::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::storage::{OperationId, OperationStore, Payload, PendingOperation, SledOperationStore, StorageError};

pub use command::CommandHandler;
pub use handler::{HandlerTable, Handlers, OperationHandler};
pub use kind::{OperationKind, TourOperation};
pub use processor::{
    process_queue, process_queue_with_clock, ProcessOptions, ProcessSummary, ProgressFn,
    DEFAULT_MAX_ATTEMPTS,
};

/// Typed front door to an [`OperationStore`].
///
/// UI code enqueues `(kind, payload)` pairs here whenever an action cannot
/// be completed right away; inspection and manual flushing go through the
/// same handle. Cloning is cheap and clones share the store.
pub struct OfflineQueue<K, S = SledOperationStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S> Clone for OfflineQueue<K, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            _kind: PhantomData,
        }
    }
}

impl<K: OperationKind> OfflineQueue<K, SledOperationStore> {
    /// Open the durable queue described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let store = match config {
            StorageConfig::Sled {
                data_dir,
                max_pending,
            } => SledOperationStore::open(data_dir)?.with_max_pending(*max_pending),
        };
        Ok(Self::new(store))
    }
}

impl<K: OperationKind, S: OperationStore + 'static> OfflineQueue<K, S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            _kind: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn enqueue(
        &self,
        kind: K,
        payload: impl Into<Payload>,
    ) -> Result<OperationId, StorageError> {
        let id = self
            .store
            .enqueue(kind.tag(), payload.into(), self.clock.now_ms())
            .await?;
        log::info!("Queued {} operation {} for later delivery", kind.tag(), id);
        Ok(id)
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.store.list_pending().await
    }

    pub async fn get(&self, id: OperationId) -> Result<Option<PendingOperation>, StorageError> {
        self.store.get(id).await
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        self.store.count().await
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        self.store.is_empty().await
    }

    pub async fn remove(&self, id: OperationId) -> Result<(), StorageError> {
        self.store.remove(id).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.clear().await
    }

    /// Entries that have used up their retry budget. The processor leaves
    /// them in place; they stay until removed explicitly.
    pub async fn stuck(&self, max_attempts: u32) -> Result<Vec<PendingOperation>, StorageError> {
        let mut ops = self.store.list_pending().await?;
        ops.retain(|op| op.is_exhausted(max_attempts));
        Ok(ops)
    }

    /// Attempt every pending operation once. See [`process_queue`].
    pub async fn process<H>(
        &self,
        handlers: &H,
        options: &ProcessOptions,
    ) -> Result<ProcessSummary, StorageError>
    where
        H: Handlers<K> + ?Sized,
    {
        process_queue_with_clock::<K, S, H>(self.store.as_ref(), handlers, options, self.clock.as_ref())
            .await
    }
}
