use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;

use crate::firestore::core::settings::ONLINE_STATE_TIMEOUT;
use crate::firestore::core::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TARGET: &str = "OnlineStateTracker";

/// Watch-stream failures tolerated before the client reports Offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from the health of the watch stream
/// and tells `handler` whenever it changes.
///
/// Unknown is reported while connecting. Offline follows one failed
/// connection attempt or a connect that takes longer than the online-state
/// timeout. Online is set explicitly once the server answered.
#[derive(Clone)]
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: Arc<StdMutex<TrackerState>>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            queue,
            handler,
            state: Arc::new(StdMutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            })),
        }
    }

    pub fn state(&self) -> OnlineState {
        lock(&self.state).state
    }

    pub fn handle_watch_stream_start(&self) {
        if lock(&self.state).watch_stream_failures != 0 {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown);
        let tracker = self.clone();
        let timer = self.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            ONLINE_STATE_TIMEOUT,
            move || {
                async move {
                    lock(&tracker.state).online_state_timer = None;
                    tracker.log_client_offline_warning(&format!(
                        "Backend didn't respond within {} seconds.",
                        ONLINE_STATE_TIMEOUT.as_secs()
                    ));
                    tracker.set_and_broadcast(OnlineState::Offline);
                    Ok(())
                }
                .boxed()
            },
        );
        if let Some(previous) = lock(&self.state).online_state_timer.replace(timer) {
            previous.cancel();
        }
    }

    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let go_offline = {
            let mut state = lock(&self.state);
            if state.state == OnlineState::Online {
                None
            } else {
                state.watch_stream_failures += 1;
                Some(state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES)
            }
        };
        match go_offline {
            None => self.set_and_broadcast(OnlineState::Unknown),
            Some(true) => {
                self.clear_online_state_timer();
                self.log_client_offline_warning(&format!(
                    "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"
                ));
                self.set_and_broadcast(OnlineState::Offline);
            }
            Some(false) => {}
        }
    }

    /// Forces `new_state`, e.g. Online after the first watch message or
    /// Offline when the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        self.clear_online_state_timer();
        {
            let mut state = lock(&self.state);
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state);
    }

    fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.handler)(new_state);
        }
    }

    fn log_client_offline_warning(&self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can establish a connection."
        );
        let warn = std::mem::replace(&mut lock(&self.state).should_warn_client_is_offline, false);
        if warn {
            log::error!(target: LOG_TARGET, "{message}");
        } else {
            log::debug!(target: LOG_TARGET, "{message}");
        }
    }

    fn clear_online_state_timer(&self) {
        if let Some(timer) = lock(&self.state).online_state_timer.take() {
            timer.cancel();
        }
    }
}
