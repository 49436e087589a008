use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::platform::runtime::{sleep, spawn_detached};
use crate::util::backoff::{
    jittered_delay_millis, next_base_millis, DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY_MILLIS,
    DEFAULT_JITTER_FACTOR, DEFAULT_MAX_DELAY_MILLIS,
};
use crate::util::hard_assert;

const LOG_TARGET: &str = "AsyncQueue";

/// Names every kind of delayed operation so tests can find and fast-forward them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in `run_all_delayed_operations_until`.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    GarbageCollection,
    ClientMetadataRefresh,
    RetryTransaction,
}

type Job = BoxFuture<'static, ()>;
pub type DelayedFn = Box<dyn FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send>;
type RetryableFn = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

struct QueueState {
    restricted: bool,
    failure: Option<FirestoreError>,
    delayed: Vec<DelayedOperation>,
    retryable: VecDeque<RetryableFn>,
    retry_base_millis: f64,
}

struct QueueShared {
    sender: async_channel::Sender<Job>,
    state: StdMutex<QueueState>,
    operation_in_progress: AtomicBool,
    next_delayed_id: AtomicU64,
}

/// Serial executor for every state transition of a client.
///
/// Operations start in the order they were enqueued and each runs to
/// completion before the next one begins.
#[derive(Clone)]
pub struct AsyncQueue {
    shared: Arc<QueueShared>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    /// Creates a queue whose worker runs on the ambient tokio runtime (or the
    /// shared background runtime).
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        let shared = Arc::new(QueueShared {
            sender,
            state: StdMutex::new(QueueState {
                restricted: false,
                failure: None,
                delayed: Vec::new(),
                retryable: VecDeque::new(),
                retry_base_millis: 0.0,
            }),
            operation_in_progress: AtomicBool::new(false),
            next_delayed_id: AtomicU64::new(0),
        });

        let worker_shared = Arc::downgrade(&shared);
        spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                let flag = worker_shared.upgrade();
                if let Some(shared) = &flag {
                    shared.operation_in_progress.store(true, AtomicOrdering::SeqCst);
                }
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    log::error!(target: LOG_TARGET, "queued operation panicked");
                    if let Some(shared) = &flag {
                        lock(&shared.state).failure =
                            Some(internal_error("AsyncQueue operation panicked"));
                    }
                }
                if let Some(shared) = &flag {
                    shared.operation_in_progress.store(false, AtomicOrdering::SeqCst);
                }
            }
        });

        Self { shared }
    }

    fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.shared.state).restricted
    }

    pub fn failure(&self) -> Option<FirestoreError> {
        lock(&self.shared.state).failure.clone()
    }

    /// Schedules `operation` and resolves with its result.
    ///
    /// Scheduling happens before this returns, so call order equals start order
    /// even if the returned futures are awaited out of order. Awaiting the
    /// result from inside another queued operation deadlocks.
    pub fn enqueue<T, F>(&self, operation: F) -> impl Future<Output = FirestoreResult<T>> + Send
    where
        T: Send + 'static,
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let scheduled = self.schedule(operation, false);
        async move {
            match scheduled {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(cancelled("The operation was dropped by the queue"))),
                Err(err) => Err(err),
            }
        }
    }

    /// Like [`enqueue`](Self::enqueue) but accepted after
    /// [`enter_restricted_mode`](Self::enter_restricted_mode); reserved for shutdown.
    pub fn enqueue_even_while_restricted<T, F>(
        &self,
        operation: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send
    where
        T: Send + 'static,
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let scheduled = self.schedule(operation, true);
        async move {
            match scheduled {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(cancelled("The operation was dropped by the queue"))),
                Err(err) => Err(err),
            }
        }
    }

    /// Schedules `operation` without waiting for it. Failures are logged; a
    /// failure that is neither a storage failure nor a lost lease moves the
    /// queue into its failed state.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        let job = async move {
            if let Err(err) = operation.await {
                record_failure(&weak, err);
            }
        };
        if let Err(err) = self.push(job.boxed(), false) {
            log::debug!(target: LOG_TARGET, "dropping operation: {err}");
        }
    }

    fn schedule<T, F>(
        &self,
        operation: F,
        even_while_restricted: bool,
    ) -> FirestoreResult<oneshot::Receiver<FirestoreResult<T>>>
    where
        T: Send + 'static,
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job = async move {
            let result = operation.await;
            let _ = sender.send(result);
        };
        self.push(job.boxed(), even_while_restricted)?;
        Ok(receiver)
    }

    fn push(&self, job: Job, even_while_restricted: bool) -> FirestoreResult<()> {
        {
            let state = lock(&self.shared.state);
            if let Some(failure) = &state.failure {
                return Err(internal_error(format!(
                    "AsyncQueue is already failed: {}",
                    failure.message()
                )));
            }
            if state.restricted && !even_while_restricted {
                return Err(cancelled("The client has already been terminated."));
            }
        }
        self.shared
            .sender
            .try_send(job)
            .map_err(|_| cancelled("The AsyncQueue worker has stopped"))
    }

    /// Schedules `operation` to be enqueued once `delay` elapses.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send + 'static,
    {
        let id = self.shared.next_delayed_id.fetch_add(1, AtomicOrdering::SeqCst);
        let delayed = DelayedOperation {
            inner: Arc::new(DelayedInner {
                id,
                timer_id,
                target_time: Instant::now() + delay,
                operation: StdMutex::new(Some(Box::new(operation))),
                queue: Arc::downgrade(&self.shared),
            }),
        };
        lock(&self.shared.state).delayed.push(delayed.clone());

        let timer = delayed.clone();
        spawn_detached(async move {
            sleep(delay).await;
            timer.handle_delay_elapsed();
        });
        delayed
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        lock(&self.shared.state)
            .delayed
            .iter()
            .any(|op| op.inner.timer_id == timer_id)
    }

    /// Fires pending delayed operations in due order until one with
    /// `last_timer_id` ran, then waits for the queue to drain.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        self.drain().await?;
        let mut pending = lock(&self.shared.state).delayed.clone();
        pending.sort_by_key(|op| (op.inner.target_time, op.inner.id));
        for op in pending {
            op.skip_delay();
            if last_timer_id != TimerId::All && op.inner.timer_id == last_timer_id {
                break;
            }
        }
        self.drain().await
    }

    /// Resolves once everything enqueued before the call has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(async { Ok(()) }).await
    }

    /// Stops accepting new work except through
    /// [`enqueue_even_while_restricted`](Self::enqueue_even_while_restricted).
    pub fn enter_restricted_mode(&self) {
        let delayed = {
            let mut state = lock(&self.shared.state);
            state.restricted = true;
            std::mem::take(&mut state.delayed)
        };
        for op in delayed {
            op.cancel();
        }
    }

    pub fn verify_operation_in_progress(&self) {
        hard_assert(
            self.shared.operation_in_progress.load(AtomicOrdering::SeqCst),
            "expected to be called from within an AsyncQueue operation",
        );
    }

    /// Runs `operation` now and, while it fails with a storage failure, again
    /// after a backoff shared by every retryable operation. Later retryable
    /// operations wait for earlier ones to succeed.
    pub fn enqueue_retryable<F>(&self, operation: F)
    where
        F: Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync + 'static,
    {
        let first = {
            let mut state = lock(&self.shared.state);
            state.retryable.push_back(Arc::new(operation));
            state.retryable.len() == 1
        };
        if first {
            self.enqueue_and_forget(retry_next_operation(self.clone()));
        }
    }
}

fn retry_next_operation(queue: AsyncQueue) -> BoxFuture<'static, FirestoreResult<()>> {
    async move {
        let Some(operation) = lock(&queue.shared.state).retryable.front().cloned() else {
            return Ok(());
        };
        match operation().await {
            Ok(()) => {
                let more = {
                    let mut state = lock(&queue.shared.state);
                    state.retryable.pop_front();
                    state.retry_base_millis = 0.0;
                    !state.retryable.is_empty()
                };
                if more {
                    queue.enqueue_and_forget(retry_next_operation(queue.clone()));
                }
                Ok(())
            }
            Err(err) if err.is_storage_failure() => {
                let delay = {
                    let mut state = lock(&queue.shared.state);
                    let delay = jittered_delay_millis(state.retry_base_millis, DEFAULT_JITTER_FACTOR);
                    state.retry_base_millis = next_base_millis(
                        state.retry_base_millis,
                        DEFAULT_BACKOFF_FACTOR,
                        DEFAULT_INITIAL_DELAY_MILLIS as f64,
                        DEFAULT_MAX_DELAY_MILLIS as f64,
                    );
                    delay
                };
                log::debug!(target: LOG_TARGET, "operation failed with retryable error: {err}");
                let retry_queue = queue.clone();
                queue.enqueue_after_delay(
                    TimerId::RetryTransaction,
                    Duration::from_millis(delay),
                    move || retry_next_operation(retry_queue),
                );
                Ok(())
            }
            Err(err) => {
                let more = {
                    let mut state = lock(&queue.shared.state);
                    state.retryable.pop_front();
                    state.retry_base_millis = 0.0;
                    !state.retryable.is_empty()
                };
                if more {
                    queue.enqueue_and_forget(retry_next_operation(queue.clone()));
                }
                Err(err)
            }
        }
    }
    .boxed()
}

fn record_failure(queue: &Weak<QueueShared>, err: FirestoreError) {
    if err.is_storage_failure() || err.is_primary_lease_lost() {
        log::warn!(target: LOG_TARGET, "operation failed: {err}");
        return;
    }
    log::error!(target: LOG_TARGET, "INTERNAL UNHANDLED ERROR: {err}");
    if let Some(shared) = queue.upgrade() {
        let mut state = lock(&shared.state);
        if state.failure.is_none() {
            state.failure = Some(err);
        }
    }
}

struct DelayedInner {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    operation: StdMutex<Option<DelayedFn>>,
    queue: Weak<QueueShared>,
}

/// Handle to an operation scheduled with
/// [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    inner: Arc<DelayedInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.inner.timer_id
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.inner.operation).is_some()
    }

    /// Prevents the operation from running unless it already started.
    pub fn cancel(&self) {
        if lock(&self.inner.operation).take().is_some() {
            self.remove_from_queue();
        }
    }

    /// Enqueues the operation immediately instead of waiting for the delay.
    pub fn skip_delay(&self) {
        self.handle_delay_elapsed();
    }

    fn handle_delay_elapsed(&self) {
        let Some(shared) = self.inner.queue.upgrade() else {
            return;
        };
        let queue = AsyncQueue::from_shared(shared);
        let this = self.clone();
        queue.enqueue_and_forget(async move {
            let operation = lock(&this.inner.operation).take();
            match operation {
                Some(operation) => {
                    this.remove_from_queue();
                    operation().await
                }
                None => Ok(()),
            }
        });
    }

    fn remove_from_queue(&self) {
        if let Some(shared) = self.inner.queue.upgrade() {
            lock(&shared.state)
                .delayed
                .retain(|op| op.inner.id != self.inner.id);
        }
    }
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
