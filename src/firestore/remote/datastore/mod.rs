use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::{cancelled, unauthenticated, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion, TargetId};
use crate::firestore::remote::WatchChange;
use crate::platform::token::TokenProvider;

pub mod in_memory;

pub use in_memory::{InMemoryConnection, MockBackend, StaticTokenProvider};

/// Request sent on the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget(TargetData),
    RemoveTarget(TargetId),
}

/// One decoded listen-stream message. `snapshot_version` is only meaningful
/// for global `NoChange` target changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenResponse {
    pub change: WatchChange,
    pub snapshot_version: SnapshotVersion,
}

impl ListenResponse {
    pub fn new(change: WatchChange) -> Self {
        Self {
            change,
            snapshot_version: SnapshotVersion::min(),
        }
    }

    pub fn at_version(change: WatchChange, snapshot_version: SnapshotVersion) -> Self {
        Self {
            change,
            snapshot_version,
        }
    }
}

/// Request sent on the write stream; the handshake carries no writes.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub stream_token: Vec<u8>,
    pub writes: Vec<Mutation>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

pub type ListenStreamHandle = StreamHandle<ListenRequest, ListenResponse>;
pub type WriteStreamHandle = StreamHandle<WriteRequest, WriteResponse>;

/// Client half of a duplex stream. Messages arrive in order; the stream is
/// finished once `next` yields an error or `None`.
pub struct StreamHandle<Req, Resp> {
    outbound: async_channel::Sender<Req>,
    inbound: async_channel::Receiver<FirestoreResult<Resp>>,
}

impl<Req, Resp> StreamHandle<Req, Resp> {
    pub fn send(&self, request: Req) -> FirestoreResult<()> {
        self.outbound
            .try_send(request)
            .map_err(|_| cancelled("stream is closed"))
    }

    pub async fn next(&self) -> Option<FirestoreResult<Resp>> {
        self.inbound.recv().await.ok()
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl<Req, Resp> Clone for StreamHandle<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            outbound: self.outbound.clone(),
            inbound: self.inbound.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for StreamHandle<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Server half of a [`StreamHandle`].
pub struct StreamPeer<Req, Resp> {
    inbound: async_channel::Receiver<Req>,
    outbound: async_channel::Sender<FirestoreResult<Resp>>,
}

impl<Req, Resp> StreamPeer<Req, Resp> {
    pub fn try_recv(&self) -> Option<Req> {
        self.inbound.try_recv().ok()
    }

    pub async fn recv(&self) -> Option<Req> {
        self.inbound.recv().await.ok()
    }

    pub fn send(&self, response: Resp) -> bool {
        self.outbound.try_send(Ok(response)).is_ok()
    }

    /// Terminates the stream with `error`.
    pub fn fail(&self, error: crate::firestore::error::FirestoreError) {
        let _ = self.outbound.try_send(Err(error));
        self.outbound.close();
        self.inbound.close();
    }

    pub fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }

    /// Whether the client closed its half.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

pub fn stream_pair<Req, Resp>() -> (StreamHandle<Req, Resp>, StreamPeer<Req, Resp>) {
    let (request_tx, request_rx) = async_channel::unbounded();
    let (response_tx, response_rx) = async_channel::unbounded();
    (
        StreamHandle {
            outbound: request_tx,
            inbound: response_rx,
        },
        StreamPeer {
            inbound: request_rx,
            outbound: response_tx,
        },
    )
}

/// Transport collaborator opening authenticated duplex streams.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<ListenStreamHandle>;

    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<WriteStreamHandle>;
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Pairs a [`Connection`] with the credentials used to open its streams.
#[derive(Clone)]
pub struct Datastore {
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
}

impl Datastore {
    pub fn new(connection: Arc<dyn Connection>, token_provider: TokenProviderArc) -> Self {
        Self {
            connection,
            token_provider,
        }
    }

    async fn token(&self) -> FirestoreResult<Option<String>> {
        self.token_provider
            .get_token()
            .await
            .map_err(|err| unauthenticated(format!("failed to get token: {err}")))
    }

    pub async fn open_listen_stream(&self) -> FirestoreResult<ListenStreamHandle> {
        let token = self.token().await?;
        self.connection.open_listen_stream(token).await
    }

    pub async fn open_write_stream(&self) -> FirestoreResult<WriteStreamHandle> {
        let token = self.token().await?;
        self.connection.open_write_stream(token).await
    }

    pub fn invalidate_token(&self) {
        self.token_provider.invalidate_token();
    }
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Datastore")
    }
}
