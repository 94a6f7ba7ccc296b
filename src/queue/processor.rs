use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::handler::{Handlers, OperationHandler};
use super::kind::OperationKind;
use crate::common::{Clock, SystemClock};
use crate::storage::{OperationPatch, OperationStore, PendingOperation, StorageError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Progress callback: `(completed, total)`.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

#[derive(Clone)]
pub struct ProcessOptions {
    /// Entries with at least this many failed attempts are skipped.
    pub max_attempts: u32,
    on_progress: Option<Arc<ProgressFn>>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Called once per entry, after its outcome has been persisted.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    fn report(&self, completed: usize, total: usize) {
        if let Some(callback) = &self.on_progress {
            callback(completed, total);
        }
    }
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            on_progress: None,
        }
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("max_attempts", &self.max_attempts)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Outcome counts of one processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub success: usize,
    pub failed: usize,
}

impl ProcessSummary {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delivered,
    Failed,
    Exhausted,
    NoHandler,
}

/// Attempt every pending operation once, in snapshot order.
///
/// Delivered entries are removed; failed ones get `attempts + 1`,
/// `last_attempt` and `error` recorded. Entries at or above
/// `options.max_attempts`, and entries whose kind has no handler, are
/// counted as failed without being touched. Handler errors never escape;
/// storage errors abort the run and are returned.
pub async fn process_queue<K, S, H>(
    store: &S,
    handlers: &H,
    options: &ProcessOptions,
) -> Result<ProcessSummary, StorageError>
where
    K: OperationKind,
    S: OperationStore + ?Sized,
    H: Handlers<K> + ?Sized,
{
    process_queue_with_clock::<K, S, H>(store, handlers, options, &SystemClock).await
}

pub async fn process_queue_with_clock<K, S, H>(
    store: &S,
    handlers: &H,
    options: &ProcessOptions,
    clock: &dyn Clock,
) -> Result<ProcessSummary, StorageError>
where
    K: OperationKind,
    S: OperationStore + ?Sized,
    H: Handlers<K> + ?Sized,
{
    let snapshot = store.list_pending().await?;
    let total = snapshot.len();
    let mut summary = ProcessSummary::default();

    if total == 0 {
        return Ok(summary);
    }

    log::info!("Processing {} pending operations", total);

    for (index, op) in snapshot.into_iter().enumerate() {
        match process_one::<K, S, H>(store, handlers, options, clock, &op).await? {
            Disposition::Delivered => summary.success += 1,
            Disposition::Failed | Disposition::Exhausted | Disposition::NoHandler => {
                summary.failed += 1
            }
        }
        options.report(index + 1, total);
    }

    log::info!(
        "Processed {} pending operations (success={}, failed={})",
        total,
        summary.success,
        summary.failed
    );

    Ok(summary)
}

async fn process_one<K, S, H>(
    store: &S,
    handlers: &H,
    options: &ProcessOptions,
    clock: &dyn Clock,
    op: &PendingOperation,
) -> Result<Disposition, StorageError>
where
    K: OperationKind,
    S: OperationStore + ?Sized,
    H: Handlers<K> + ?Sized,
{
    let Some(handler) = K::from_tag(&op.kind).and_then(|kind| handlers.handler(kind)) else {
        log::warn!(
            "No handler for operation {} (kind '{}'); leaving it pending",
            op.id,
            op.kind
        );
        return Ok(Disposition::NoHandler);
    };

    if op.is_exhausted(options.max_attempts) {
        log::debug!(
            "Skipping operation {} (kind '{}'): {} of {} attempts used",
            op.id,
            op.kind,
            op.attempts,
            options.max_attempts
        );
        return Ok(Disposition::Exhausted);
    }

    match handler.handle(&op.payload).await {
        Ok(()) => {
            store.remove(op.id).await?;
            log::debug!("Delivered operation {} (kind '{}')", op.id, op.kind);
            Ok(Disposition::Delivered)
        }
        Err(e) => {
            let error = format!("{e:#}");
            log::warn!(
                "Operation {} (kind '{}') failed on attempt {}: {}",
                op.id,
                op.kind,
                op.attempts + 1,
                error
            );
            let patch = OperationPatch::failed_attempt(op, clock.now_ms(), error);
            store.update(op.id, patch).await?;
            Ok(Disposition::Failed)
        }
    }
}
