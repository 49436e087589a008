use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use crate::firestore::core::BackoffSettings;
use crate::firestore::error::FirestoreResult;
use crate::firestore::util::async_queue::{lock, AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::{jittered_delay_millis, next_base_millis};

/// Growing, jittered retry delay whose timer runs on an [`AsyncQueue`].
///
/// The first attempt after construction or [`reset`](Self::reset) runs
/// without delay. Time already spent since the previous attempt counts
/// towards the next delay.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    settings: BackoffSettings,
    current_base_millis: f64,
    last_attempt: Arc<StdMutex<Instant>>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId, settings: BackoffSettings) -> Self {
        Self {
            queue,
            timer_id,
            settings,
            current_base_millis: 0.0,
            last_attempt: Arc::new(StdMutex::new(Instant::now())),
            timer: None,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Makes the next attempt wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.settings.max_delay.as_millis() as f64;
    }

    pub fn current_base_millis(&self) -> f64 {
        self.current_base_millis
    }

    pub fn backoff_and_run<F>(&mut self, operation: F)
    where
        F: FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send + 'static,
    {
        self.cancel();

        let desired = jittered_delay_millis(self.current_base_millis, self.settings.jitter);
        let elapsed = lock(&self.last_attempt).elapsed().as_millis() as u64;
        let remaining = desired.saturating_sub(elapsed);
        if remaining > 0 {
            log::debug!(
                target: "ExponentialBackoff",
                "backing off for {remaining} ms (base delay: {} ms, delay with jitter: {desired} ms, last attempt: {elapsed} ms ago)",
                self.current_base_millis
            );
        }

        let last_attempt = Arc::clone(&self.last_attempt);
        self.timer = Some(self.queue.enqueue_after_delay(
            self.timer_id,
            Duration::from_millis(remaining),
            move || {
                *lock(&last_attempt) = Instant::now();
                operation().boxed()
            },
        ));

        self.current_base_millis = next_base_millis(
            self.current_base_millis,
            self.settings.backoff_factor,
            self.settings.initial_delay.as_millis() as f64,
            self.settings.max_delay.as_millis() as f64,
        );
    }

    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
