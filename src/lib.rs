// Durable offline retry queue: storage, processing and connectivity-driven replay.
pub mod common;
pub mod config;
pub mod network;
pub mod queue;
pub mod storage;

// Public exports
pub use config::{Config, StorageConfig};
pub use network::{setup_auto_retry, Connectivity, ConnectivityMonitor, ConnectivitySignal, RetryHandle};
pub use queue::{
    process_queue, HandlerTable, Handlers, OfflineQueue, OperationHandler, OperationKind,
    ProcessOptions, ProcessSummary, TourOperation,
};
pub use storage::{
    MemoryOperationStore, OperationId, OperationStore, Payload, PendingOperation,
    SledOperationStore, StorageError,
};
