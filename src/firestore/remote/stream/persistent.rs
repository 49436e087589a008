use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::settings::{HEALTHY_TIMEOUT, IDLE_TIMEOUT};
use crate::firestore::core::BackoffSettings;
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{
    Datastore, ListenRequest, ListenResponse, StreamHandle, WriteRequest, WriteResponse,
};
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::{AsyncQueue, DelayedOperation, ExponentialBackoff, TimerId};
use crate::platform::runtime::spawn_detached;

const LOG_TARGET: &str = "PersistentStream";

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Healthy
///    ^          |         |        |
///    |          +---------+--------+--> Error -> Backoff -> Initial
///    +---- stop() / idle close -------------------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    /// Open for at least the health-check interval.
    Healthy,
    /// Closed by an error; the next start goes through backoff.
    Error,
    Backoff,
}

/// Static description of one stream flavour.
pub trait StreamKind: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    const LABEL: &'static str;
    const IDLE_TIMER: TimerId;
    const BACKOFF_TIMER: TimerId;

    fn open(
        datastore: &Datastore,
    ) -> BoxFuture<'_, FirestoreResult<StreamHandle<Self::Request, Self::Response>>>;
}

pub struct ListenKind;

impl StreamKind for ListenKind {
    type Request = ListenRequest;
    type Response = ListenResponse;

    const LABEL: &'static str = "listen";
    const IDLE_TIMER: TimerId = TimerId::ListenStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::ListenStreamConnectionBackoff;

    fn open(datastore: &Datastore) -> BoxFuture<'_, FirestoreResult<StreamHandle<ListenRequest, ListenResponse>>> {
        datastore.open_listen_stream().boxed()
    }
}

pub struct WriteKind;

impl StreamKind for WriteKind {
    type Request = WriteRequest;
    type Response = WriteResponse;

    const LABEL: &'static str = "write";
    const IDLE_TIMER: TimerId = TimerId::WriteStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::WriteStreamConnectionBackoff;

    fn open(datastore: &Datastore) -> BoxFuture<'_, FirestoreResult<StreamHandle<WriteRequest, WriteResponse>>> {
        datastore.open_write_stream().boxed()
    }
}

/// Callbacks of a [`PersistentStream`]. Every call runs on the async queue.
///
/// `on_close` fires when the stream failed or was closed for idleness, never
/// for an explicit [`PersistentStream::stop`].
#[async_trait]
pub trait StreamListener<Resp: Send + 'static>: Send + Sync {
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: Resp) -> FirestoreResult<()>;

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamState<K: StreamKind> {
    state: PersistentStreamState,
    /// Bumped on every close; callbacks of older generations are dropped.
    close_count: u64,
    stream: Option<StreamHandle<K::Request, K::Response>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    health_check: Option<DelayedOperation>,
}

struct StreamInner<K: StreamKind> {
    queue: AsyncQueue,
    datastore: Datastore,
    listener: Arc<dyn StreamListener<K::Response>>,
    state: StdMutex<StreamState<K>>,
}

/// A stream that can be started again after it closed, with backoff between
/// failed attempts and an idle timeout.
///
/// All methods must be called from the async queue.
pub struct PersistentStream<K: StreamKind> {
    inner: Arc<StreamInner<K>>,
}

impl<K: StreamKind> Clone for PersistentStream<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StreamKind> PersistentStream<K> {
    pub fn new(
        queue: AsyncQueue,
        datastore: Datastore,
        backoff: BackoffSettings,
        listener: Arc<dyn StreamListener<K::Response>>,
    ) -> Self {
        let backoff = ExponentialBackoff::new(queue.clone(), K::BACKOFF_TIMER, backoff);
        Self {
            inner: Arc::new(StreamInner {
                queue,
                datastore,
                listener,
                state: StdMutex::new(StreamState {
                    state: PersistentStreamState::Initial,
                    close_count: 0,
                    stream: None,
                    backoff,
                    idle_timer: None,
                    health_check: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> PersistentStreamState {
        lock(&self.inner.state).state
    }

    /// Starting, open or waiting in backoff.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Open | PersistentStreamState::Healthy
        )
    }

    /// Opens the stream, waiting out the backoff first if the previous
    /// attempt failed.
    pub fn start(&self) {
        let close_count = {
            let mut state = lock(&self.inner.state);
            let current = state.state;
            match current {
                PersistentStreamState::Error => {
                    drop(state);
                    self.perform_backoff();
                    return;
                }
                PersistentStreamState::Initial => {}
                other => {
                    log::debug!(target: LOG_TARGET, "({}) start ignored in state {other:?}", K::LABEL);
                    return;
                }
            }
            state.state = PersistentStreamState::Starting;
            state.close_count
        };

        let this = self.clone();
        spawn_detached(async move {
            let opened = K::open(&this.inner.datastore).await;
            let queue = this.inner.queue.clone();
            queue.enqueue_and_forget(async move {
                if this.close_count() != close_count {
                    if let Ok(stream) = opened {
                        stream.close();
                    }
                    return Ok(());
                }
                match opened {
                    Ok(stream) => this.on_stream_opened(stream, close_count).await,
                    Err(err) => this.handle_stream_close(Some(err)).await,
                }
            });
        });
    }

    /// Closes the stream without notifying the listener and without
    /// backoff on the next start.
    pub fn stop(&self) {
        if self.is_started() {
            self.close_quietly(PersistentStreamState::Initial, None);
        }
    }

    /// After a permanent error, makes the next start skip the backoff.
    pub fn inhibit_backoff(&self) {
        let mut state = lock(&self.inner.state);
        if matches!(
            state.state,
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
        ) {
            log::warn!(target: LOG_TARGET, "({}) cannot inhibit backoff of a started stream", K::LABEL);
            return;
        }
        state.state = PersistentStreamState::Initial;
        state.backoff.reset();
    }

    /// Arms the idle timer unless it already runs. Sending a request
    /// disarms it.
    pub fn mark_idle(&self) {
        let mut state = lock(&self.inner.state);
        let open = matches!(
            state.state,
            PersistentStreamState::Open | PersistentStreamState::Healthy
        );
        if !open || state.idle_timer.is_some() {
            return;
        }
        let this = self.clone();
        state.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            K::IDLE_TIMER,
            IDLE_TIMEOUT,
            move || async move { this.handle_idle_close_timer().await }.boxed(),
        ));
    }

    pub fn send(&self, request: K::Request) -> FirestoreResult<()> {
        let stream = {
            let mut state = lock(&self.inner.state);
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.stream.clone()
        };
        match stream {
            Some(stream) => stream.send(request),
            None => {
                log::debug!(target: LOG_TARGET, "({}) dropping request on closed stream", K::LABEL);
                Ok(())
            }
        }
    }

    pub(crate) fn reset_backoff(&self) {
        lock(&self.inner.state).backoff.reset();
    }

    fn close_count(&self) -> u64 {
        lock(&self.inner.state).close_count
    }

    async fn on_stream_opened(
        &self,
        stream: StreamHandle<K::Request, K::Response>,
        close_count: u64,
    ) -> FirestoreResult<()> {
        {
            let mut state = lock(&self.inner.state);
            state.stream = Some(stream.clone());
            state.state = PersistentStreamState::Open;
            let this = self.clone();
            state.health_check = Some(self.inner.queue.enqueue_after_delay(
                TimerId::HealthCheckTimeout,
                HEALTHY_TIMEOUT,
                move || {
                    async move {
                        let mut state = lock(&this.inner.state);
                        if matches!(state.state, PersistentStreamState::Open) {
                            state.state = PersistentStreamState::Healthy;
                        }
                        state.health_check = None;
                        Ok(())
                    }
                    .boxed()
                },
            ));
        }
        log::debug!(target: LOG_TARGET, "({}) stream opened", K::LABEL);

        let this = self.clone();
        spawn_detached(async move {
            loop {
                match stream.next().await {
                    Some(Ok(message)) => {
                        let listener_stream = this.clone();
                        this.dispatch_if_not_closed(close_count, async move {
                            listener_stream.reset_backoff();
                            listener_stream.inner.listener.on_message(message).await
                        });
                    }
                    Some(Err(err)) => {
                        let closing = this.clone();
                        this.dispatch_if_not_closed(close_count, async move {
                            closing.handle_stream_close(Some(err)).await
                        });
                        break;
                    }
                    None => {
                        let closing = this.clone();
                        this.dispatch_if_not_closed(close_count, async move {
                            closing.handle_stream_close(None).await
                        });
                        break;
                    }
                }
            }
        });

        self.inner.listener.on_open().await
    }

    fn dispatch_if_not_closed<F>(&self, close_count: u64, operation: F)
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let this = self.clone();
        self.inner.queue.enqueue_and_forget(async move {
            if this.close_count() != close_count {
                log::debug!(target: LOG_TARGET, "({}) dropping callback of closed stream", K::LABEL);
                return Ok(());
            }
            operation.await
        });
    }

    async fn handle_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match &error {
            Some(err) => log::debug!(target: LOG_TARGET, "({}) stream closed with error: {err}", K::LABEL),
            None => log::debug!(target: LOG_TARGET, "({}) stream closed by server", K::LABEL),
        }
        // a server-side close is never expected, so it always goes through backoff
        self.close_quietly(PersistentStreamState::Error, error.clone());
        self.inner.listener.on_close(error).await
    }

    async fn handle_idle_close_timer(&self) -> FirestoreResult<()> {
        lock(&self.inner.state).idle_timer = None;
        if !self.is_open() {
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "({}) closing idle stream", K::LABEL);
        self.close_quietly(PersistentStreamState::Initial, None);
        self.inner.listener.on_close(None).await
    }

    fn close_quietly(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        let mut state = lock(&self.inner.state);
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = state.health_check.take() {
            timer.cancel();
        }
        state.backoff.cancel();
        state.close_count += 1;

        let code = error.as_ref().map(|err| err.code);
        if final_state != PersistentStreamState::Error {
            state.backoff.reset();
        } else if code == Some(FirestoreErrorCode::ResourceExhausted) {
            log::error!(
                target: LOG_TARGET,
                "({}) using maximum backoff delay to prevent overloading the backend",
                K::LABEL
            );
            state.backoff.reset_to_max();
        } else if code == Some(FirestoreErrorCode::Unauthenticated)
            && state.state != PersistentStreamState::Healthy
        {
            self.inner.datastore.invalidate_token();
        }

        if let Some(stream) = state.stream.take() {
            stream.close();
        }
        state.state = final_state;
    }

    fn perform_backoff(&self) {
        let this = self.clone();
        let mut state = lock(&self.inner.state);
        state.state = PersistentStreamState::Backoff;
        state.backoff.backoff_and_run(move || {
            async move {
                {
                    let mut state = lock(&this.inner.state);
                    if state.state != PersistentStreamState::Backoff {
                        return Ok(());
                    }
                    state.state = PersistentStreamState::Initial;
                }
                this.start();
                Ok(())
            }
            .boxed()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated, unavailable};
    use crate::firestore::remote::datastore::{MockBackend, StaticTokenProvider};
    use crate::firestore::remote::{TargetChangeState, WatchChange, WatchTargetChange};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamListener<ListenResponse> for Recorder {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".into());
            Ok(())
        }

        async fn on_message(&self, _message: ListenResponse) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("message".into());
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let label = match error {
                Some(err) => format!("close:{}", err.code_str()),
                None => "close".into(),
            };
            self.events.lock().unwrap().push(label);
            Ok(())
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        backend: MockBackend,
        tokens: Arc<StaticTokenProvider>,
        recorder: Arc<Recorder>,
        stream: PersistentStream<ListenKind>,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let backend = MockBackend::new();
        let tokens = Arc::new(StaticTokenProvider::new(None));
        let datastore = Datastore::new(backend.connection(), tokens.clone());
        let recorder = Arc::new(Recorder::default());
        let stream = PersistentStream::<ListenKind>::new(
            queue.clone(),
            datastore,
            BackoffSettings::default(),
            recorder.clone(),
        );
        Fixture {
            queue,
            backend,
            tokens,
            recorder,
            stream,
        }
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            queue.drain().await.unwrap();
        }
    }

    async fn start(fixture: &Fixture) {
        let stream = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                stream.start();
                Ok(())
            })
            .await
            .unwrap();
        settle(&fixture.queue).await;
    }

    fn events(fixture: &Fixture) -> Vec<String> {
        fixture.recorder.events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn opens_and_delivers_messages() {
        let fixture = fixture();
        start(&fixture).await;
        assert!(fixture.stream.is_open());

        let change = WatchChange::Target(WatchTargetChange::new(TargetChangeState::NoChange, vec![]));
        fixture.backend.send_listen_response(ListenResponse::new(change));
        settle(&fixture.queue).await;
        assert_eq!(events(&fixture), vec!["open", "message"]);

        fixture.stream.stop();
        assert_eq!(fixture.stream.state(), PersistentStreamState::Initial);
        settle(&fixture.queue).await;
        assert_eq!(events(&fixture), vec!["open", "message"]);
        assert!(!fixture.backend.is_listen_stream_open());
    }

    #[tokio::test]
    async fn error_close_goes_through_backoff() {
        let fixture = fixture();
        start(&fixture).await;
        fixture.backend.fail_listen_stream(unavailable("down"));
        settle(&fixture.queue).await;
        assert_eq!(fixture.stream.state(), PersistentStreamState::Error);
        assert_eq!(events(&fixture).last().unwrap(), "close:firestore/unavailable");

        start(&fixture).await;
        assert_eq!(fixture.stream.state(), PersistentStreamState::Backoff);
        fixture
            .queue
            .run_all_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        settle(&fixture.queue).await;
        assert!(fixture.stream.is_open());
        assert_eq!(fixture.backend.listen_stream_count(), 2);
    }

    #[tokio::test]
    async fn unauthenticated_open_invalidates_token() {
        let fixture = fixture();
        fixture.backend.fail_next_open(unauthenticated("expired"));
        start(&fixture).await;
        assert_eq!(fixture.tokens.invalidation_count(), 1);
        assert_eq!(fixture.stream.state(), PersistentStreamState::Error);
    }

    #[tokio::test]
    async fn resource_exhausted_uses_max_backoff() {
        let fixture = fixture();
        start(&fixture).await;
        fixture.backend.fail_listen_stream(resource_exhausted("quota"));
        settle(&fixture.queue).await;
        let base = lock(&fixture.stream.inner.state).backoff.current_base_millis();
        assert_eq!(base, BackoffSettings::default().max_delay.as_millis() as f64);
    }

    #[tokio::test]
    async fn idle_stream_closes_without_backoff() {
        let fixture = fixture();
        start(&fixture).await;
        let stream = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                stream.mark_idle();
                Ok(())
            })
            .await
            .unwrap();
        assert!(fixture.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        fixture
            .queue
            .run_all_delayed_operations_until(TimerId::ListenStreamIdle)
            .await
            .unwrap();
        settle(&fixture.queue).await;
        assert_eq!(fixture.stream.state(), PersistentStreamState::Initial);
        assert_eq!(events(&fixture).last().unwrap(), "close");
    }
}
