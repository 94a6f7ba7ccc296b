use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::connectivity::Connectivity;
use super::retry_status::{RetryStatus, SharedRetryStatus};
use crate::queue::{Handlers, OfflineQueue, OperationKind, ProcessOptions};
use crate::storage::OperationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Connectivity was already present when the registration was set up.
    Startup,
    CameOnline,
    /// Explicit request through [`RetryHandle::trigger`].
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Startup => f.write_str("online at startup"),
            TriggerReason::CameOnline => f.write_str("came online"),
            TriggerReason::Manual => f.write_str("manual retry"),
        }
    }
}

/// Held for the whole duration of a run. Dropping it (normal return, early
/// return or unwinding) frees the registration for the next trigger.
struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(running: &Arc<AtomicBool>) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                running: Arc::clone(running),
            })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

trait Trigger: Send + Sync {
    fn fire(&self, reason: TriggerReason) -> bool;

    fn is_running(&self) -> bool;

    fn ignored_triggers(&self) -> u64;
}

struct Registration<K, S, H> {
    queue: OfflineQueue<K, S>,
    handlers: Arc<H>,
    options: ProcessOptions,
    running: Arc<AtomicBool>,
    ignored: Arc<AtomicU64>,
    status: SharedRetryStatus,
}

impl<K, S, H> Clone for Registration<K, S, H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handlers: Arc::clone(&self.handlers),
            options: self.options.clone(),
            running: Arc::clone(&self.running),
            ignored: Arc::clone(&self.ignored),
            status: Arc::clone(&self.status),
        }
    }
}

impl<K, S, H> Registration<K, S, H>
where
    K: OperationKind,
    S: OperationStore + 'static,
    H: Handlers<K> + 'static,
{
    async fn run(self, _guard: RunGuard, reason: TriggerReason) {
        let pending = match self.queue.count().await {
            Ok(n) => n,
            Err(e) => {
                log::error!("Auto-retry ({reason}) could not read the pending count: {e}");
                self.status.lock().await.last_error = Some(e.to_string());
                return;
            }
        };

        {
            let mut status = self.status.lock().await;
            status.pending_ops = pending as u64;
            if pending == 0 {
                log::debug!("Auto-retry ({reason}): nothing pending");
                return;
            }
            status.runs_started += 1;
            status.last_run_ts_ms = self.queue.clock().now_ms();
        }

        log::info!("Auto-retry ({reason}): replaying {pending} pending operations");
        let result = self.queue.process(self.handlers.as_ref(), &self.options).await;

        let mut status = self.status.lock().await;
        status.runs_completed += 1;
        match result {
            Ok(summary) => {
                log::info!(
                    "Auto-retry ({reason}) finished: success={}, failed={}",
                    summary.success,
                    summary.failed
                );
                status.last_summary = Some(summary);
                status.last_error = None;
            }
            Err(e) => {
                log::error!("Auto-retry ({reason}) aborted by storage error: {e}");
                status.last_error = Some(e.to_string());
            }
        }
    }
}

impl<K, S, H> Trigger for Registration<K, S, H>
where
    K: OperationKind,
    S: OperationStore + 'static,
    H: Handlers<K> + 'static,
{
    fn fire(&self, reason: TriggerReason) -> bool {
        let Some(guard) = RunGuard::acquire(&self.running) else {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            log::debug!("Auto-retry ({reason}) ignored: a run is already in flight");
            return false;
        };

        tokio::spawn(self.clone().run(guard, reason));
        true
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ignored_triggers(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }
}

/// Returned by [`setup_auto_retry`]; the only way to stop automatic
/// triggering. Dropping the handle leaves the registration active.
pub struct RetryHandle {
    listener: JoinHandle<()>,
    trigger: Arc<dyn Trigger>,
    status: SharedRetryStatus,
    cancelled: AtomicBool,
}

impl RetryHandle {
    /// Stop reacting to connectivity changes. Idempotent; a run already in
    /// flight is left to finish.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.listener.abort();
            log::info!("Auto-retry cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True while a run started by this registration is in flight.
    pub fn is_running(&self) -> bool {
        self.trigger.is_running()
    }

    /// Request a run now, through the same re-entrancy guard as the
    /// connectivity trigger. Returns false if a run was already in flight.
    pub fn trigger(&self) -> bool {
        self.trigger.fire(TriggerReason::Manual)
    }

    pub async fn status(&self) -> RetryStatus {
        let mut status = self.status.lock().await.clone();
        status.ignored_triggers = self.trigger.ignored_triggers();
        status
    }
}

/// Replay the queue whenever `connectivity` comes online, and once right
/// away if it is online already.
///
/// At most one run is in flight per registration: triggers arriving during
/// a run are dropped, not queued. Must be called from within a Tokio
/// runtime.
pub fn setup_auto_retry<K, S, H, C>(
    queue: OfflineQueue<K, S>,
    handlers: Arc<H>,
    connectivity: &C,
    options: ProcessOptions,
) -> RetryHandle
where
    K: OperationKind,
    S: OperationStore + 'static,
    H: Handlers<K> + 'static,
    C: Connectivity + ?Sized,
{
    let status: SharedRetryStatus = Arc::new(Mutex::new(RetryStatus::default()));
    let registration = Registration {
        queue,
        handlers,
        options,
        running: Arc::new(AtomicBool::new(false)),
        ignored: Arc::new(AtomicU64::new(0)),
        status: Arc::clone(&status),
    };

    let mut rx = connectivity.subscribe();
    rx.borrow_and_update();

    if connectivity.is_online() {
        registration.fire(TriggerReason::Startup);
    }

    let listener_registration = registration.clone();
    let listener = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let online = rx.borrow_and_update().is_online();
            if online {
                listener_registration.fire(TriggerReason::CameOnline);
            }
        }
        log::debug!("Connectivity source closed; auto-retry listener stopped");
    });

    RetryHandle {
        listener,
        trigger: Arc::new(registration),
        status,
        cancelled: AtomicBool::new(false),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::network::connectivity::ConnectivitySignal;
    use crate::queue::{HandlerTable, TourOperation};
    use crate::storage::testing::BrokenWrites;
    use crate::storage::{MemoryOperationStore, Payload};

    type TestQueue = OfflineQueue<TourOperation, MemoryOperationStore>;

    fn queue() -> TestQueue {
        OfflineQueue::new(MemoryOperationStore::new())
    }

    async fn wait_until_idle(handle: &RetryHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run should finish");
    }

    fn counting_table(calls: Arc<AtomicUsize>) -> Arc<HandlerTable<TourOperation>> {
        Arc::new(HandlerTable::new().on(TourOperation::AddReport, move |_p: Payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        }))
    }

    #[tokio::test]
    async fn drains_when_connectivity_returns() {
        let queue = queue();
        queue.enqueue(TourOperation::AddReport, "a").await.unwrap();
        queue.enqueue(TourOperation::AddReport, "b").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let signal = ConnectivitySignal::offline();
        let handle = setup_auto_retry(
            queue.clone(),
            counting_table(Arc::clone(&calls)),
            &signal,
            ProcessOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signal.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.status().await.runs_completed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.count().await.unwrap(), 0);

        let status = handle.status().await;
        assert_eq!(status.runs_started, 1);
        assert_eq!(status.pending_ops, 2);
        assert_eq!(status.last_summary.unwrap().success, 2);
        handle.cancel();
    }

    #[tokio::test]
    async fn runs_at_setup_when_already_online() {
        let queue = queue();
        queue.enqueue(TourOperation::AddReport, "a").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let signal = ConnectivitySignal::online();
        let handle = setup_auto_retry(
            queue.clone(),
            counting_table(Arc::clone(&calls)),
            &signal,
            ProcessOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        wait_until_idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn empty_queue_does_not_start_a_run() {
        let signal = ConnectivitySignal::online();
        let handle = setup_auto_retry(
            queue(),
            counting_table(Arc::new(AtomicUsize::new(0))),
            &signal,
            ProcessOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        wait_until_idle(&handle).await;
        let status = handle.status().await;
        assert_eq!(status.runs_started, 0);
        assert_eq!(status.pending_ops, 0);
    }

    #[tokio::test]
    async fn overlapping_triggers_invoke_handler_once() {
        let queue = queue();
        queue.enqueue(TourOperation::AddReport, "slow").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let handlers = {
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            Arc::new(HandlerTable::new().on(TourOperation::AddReport, move |_p: Payload| {
                let calls = Arc::clone(&calls);
                let release = Arc::clone(&release);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<(), anyhow::Error>(())
                }
            }))
        };

        let signal = ConnectivitySignal::offline();
        let handle = setup_auto_retry(queue.clone(), handlers, &signal, ProcessOptions::default());

        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_running());

        signal.set_online(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.trigger());

        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release.notify_one();
        wait_until_idle(&handle).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty().await.unwrap());
        let status = handle.status().await;
        assert_eq!(status.runs_started, 1);
        assert_eq!(status.ignored_triggers, 2);
    }

    #[tokio::test]
    async fn guard_is_released_after_a_panicking_handler() {
        let queue = queue();
        queue.enqueue(TourOperation::AddReport, "boom").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = {
            let calls = Arc::clone(&calls);
            Arc::new(HandlerTable::new().on(TourOperation::AddReport, move |_p: Payload| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        panic!("handler bug");
                    }
                    Ok::<(), anyhow::Error>(())
                }
            }))
        };

        let signal = ConnectivitySignal::offline();
        let handle = setup_auto_retry(queue.clone(), handlers, &signal, ProcessOptions::default());

        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        wait_until_idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        signal.set_online(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        wait_until_idle(&handle).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty().await.unwrap());
    }

    async fn wait_for_completed_runs(handle: &RetryHandle, runs: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.status().await.runs_completed < runs {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run should complete");
        wait_until_idle(handle).await;
    }

    #[tokio::test]
    async fn guard_is_released_after_a_storage_error() {
        let queue: OfflineQueue<TourOperation, BrokenWrites> = OfflineQueue::new(BrokenWrites::new());
        queue.enqueue(TourOperation::AddReport, "a").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let signal = ConnectivitySignal::offline();
        let handle = setup_auto_retry(
            queue.clone(),
            counting_table(Arc::clone(&calls)),
            &signal,
            ProcessOptions::default(),
        );

        assert!(handle.trigger());
        wait_for_completed_runs(&handle, 1).await;

        let status = handle.status().await;
        assert!(status.last_error.as_deref().unwrap().contains("disk full"));
        assert!(status.last_summary.is_none());

        assert!(handle.trigger());
        wait_for_completed_runs(&handle, 2).await;

        let status = handle.status().await;
        assert_eq!(status.runs_started, 2);
        assert_eq!(status.ignored_triggers, 0);
        assert!(status.last_error.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.count().await.unwrap(), 1);
        handle.cancel();
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_triggering() {
        let queue = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let signal = ConnectivitySignal::offline();
        let handle = setup_auto_retry(
            queue.clone(),
            counting_table(Arc::clone(&calls)),
            &signal,
            ProcessOptions::default(),
        );

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.enqueue(TourOperation::AddReport, "a").await.unwrap();
        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.count().await.unwrap(), 1);
        assert_eq!(handle.status().await.runs_started, 0);
    }

    #[tokio::test]
    async fn registrations_do_not_share_a_guard() {
        let release = Arc::new(Notify::new());
        let slow = {
            let release = Arc::clone(&release);
            Arc::new(HandlerTable::new().on(TourOperation::AddReport, move |_p: Payload| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok::<(), anyhow::Error>(())
                }
            }))
        };

        let slow_queue = queue();
        slow_queue.enqueue(TourOperation::AddReport, "slow").await.unwrap();
        let fast_queue = queue();
        fast_queue.enqueue(TourOperation::AddReport, "fast").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let signal = ConnectivitySignal::offline();
        let slow_handle = setup_auto_retry(slow_queue, slow, &signal, ProcessOptions::default());
        let fast_handle = setup_auto_retry(
            fast_queue.clone(),
            counting_table(Arc::clone(&calls)),
            &signal,
            ProcessOptions::default(),
        );

        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        wait_until_idle(&fast_handle).await;

        assert!(slow_handle.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fast_queue.is_empty().await.unwrap());

        release.notify_one();
        wait_until_idle(&slow_handle).await;
    }
}
