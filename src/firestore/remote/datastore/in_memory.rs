use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::util::async_queue::lock;
use crate::platform::token::{TokenError, TokenProvider};

use super::{
    stream_pair, Connection, ListenRequest, ListenResponse, ListenStreamHandle, StreamPeer,
    WriteRequest, WriteResponse, WriteStreamHandle,
};

#[derive(Default)]
struct BackendState {
    listen: Option<StreamPeer<ListenRequest, ListenResponse>>,
    write: Option<StreamPeer<WriteRequest, WriteResponse>>,
    listen_opens: usize,
    write_opens: usize,
    tokens_seen: Vec<Option<String>>,
    fail_next_open: Option<FirestoreError>,
}

/// Scriptable server side of an [`InMemoryConnection`].
///
/// Only the most recently opened listen and write streams are reachable;
/// opening a new stream drops the previous peer.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<StdMutex<BackendState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Arc<InMemoryConnection> {
        Arc::new(InMemoryConnection {
            backend: self.clone(),
        })
    }

    /// Makes the next stream open fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        lock(&self.state).fail_next_open = Some(error);
    }

    pub fn next_listen_request(&self) -> Option<ListenRequest> {
        lock(&self.state).listen.as_ref().and_then(StreamPeer::try_recv)
    }

    /// Drains every listen request sent so far.
    pub fn listen_requests(&self) -> Vec<ListenRequest> {
        std::iter::from_fn(|| self.next_listen_request()).collect()
    }

    pub fn next_write_request(&self) -> Option<WriteRequest> {
        lock(&self.state).write.as_ref().and_then(StreamPeer::try_recv)
    }

    pub fn write_requests(&self) -> Vec<WriteRequest> {
        std::iter::from_fn(|| self.next_write_request()).collect()
    }

    pub fn send_listen_response(&self, response: ListenResponse) -> bool {
        lock(&self.state)
            .listen
            .as_ref()
            .map(|peer| peer.send(response))
            .unwrap_or(false)
    }

    pub fn send_write_response(&self, response: WriteResponse) -> bool {
        lock(&self.state)
            .write
            .as_ref()
            .map(|peer| peer.send(response))
            .unwrap_or(false)
    }

    pub fn fail_listen_stream(&self, error: FirestoreError) {
        if let Some(peer) = lock(&self.state).listen.take() {
            peer.fail(error);
        }
    }

    pub fn fail_write_stream(&self, error: FirestoreError) {
        if let Some(peer) = lock(&self.state).write.take() {
            peer.fail(error);
        }
    }

    pub fn is_listen_stream_open(&self) -> bool {
        lock(&self.state)
            .listen
            .as_ref()
            .map(|peer| !peer.is_closed())
            .unwrap_or(false)
    }

    pub fn is_write_stream_open(&self) -> bool {
        lock(&self.state)
            .write
            .as_ref()
            .map(|peer| !peer.is_closed())
            .unwrap_or(false)
    }

    pub fn listen_stream_count(&self) -> usize {
        lock(&self.state).listen_opens
    }

    pub fn write_stream_count(&self) -> usize {
        lock(&self.state).write_opens
    }

    /// Tokens presented by every stream open, in order.
    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        lock(&self.state).tokens_seen.clone()
    }
}

/// [`Connection`] whose streams terminate in a [`MockBackend`].
pub struct InMemoryConnection {
    backend: MockBackend,
}

impl InMemoryConnection {
    pub fn backend(&self) -> &MockBackend {
        &self.backend
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<ListenStreamHandle> {
        let mut state = lock(&self.backend.state);
        state.tokens_seen.push(token);
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }
        let (handle, peer) = stream_pair();
        if let Some(previous) = state.listen.replace(peer) {
            previous.close();
        }
        state.listen_opens += 1;
        Ok(handle)
    }

    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<WriteStreamHandle> {
        let mut state = lock(&self.backend.state);
        state.tokens_seen.push(token);
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }
        let (handle, peer) = stream_pair();
        if let Some(previous) = state.write.replace(peer) {
            previous.close();
        }
        state.write_opens += 1;
        Ok(handle)
    }
}

/// Token provider handing out a fixed token and counting invalidations.
#[derive(Default)]
pub struct StaticTokenProvider {
    token: StdMutex<Option<String>>,
    invalidations: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: StdMutex::new(token),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *lock(&self.token) = token;
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Option<String>, TokenError> {
        Ok(lock(&self.token).clone())
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
