use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::firestore::core::BackoffSettings;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::{Datastore, WriteRequest, WriteResponse};
use crate::firestore::remote::stream::{PersistentStream, StreamListener, WriteKind};
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::AsyncQueue;

/// Callbacks of a [`WriteStream`], invoked on the async queue.
#[async_trait]
pub trait WriteStreamListener: Send + Sync {
    async fn on_write_open(&self) -> FirestoreResult<()>;

    /// The server answered the handshake; mutations may be sent now.
    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteResponseHandler {
    state: Arc<StdMutex<WriteStreamState>>,
    listener: Arc<dyn WriteStreamListener>,
}

#[async_trait]
impl StreamListener<WriteResponse> for WriteResponseHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_write_open().await
    }

    async fn on_message(&self, response: WriteResponse) -> FirestoreResult<()> {
        let first = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token;
            !std::mem::replace(&mut state.handshake_complete, true)
        };
        if first {
            self.listener.on_handshake_complete().await
        } else {
            self.listener
                .on_mutation_result(response.commit_version, response.write_results)
                .await
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_write_close(error).await
    }
}

/// The write stream. Every session begins with a handshake that echoes the
/// stream token of the previous session; each response carries the token
/// the next request must present.
pub struct WriteStream {
    stream: PersistentStream<WriteKind>,
    state: Arc<StdMutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Datastore,
        backoff: BackoffSettings,
        listener: Arc<dyn WriteStreamListener>,
    ) -> Self {
        let state = Arc::new(StdMutex::new(WriteStreamState::default()));
        let handler = Arc::new(WriteResponseHandler {
            state: Arc::clone(&state),
            listener,
        });
        Self {
            stream: PersistentStream::new(queue, datastore, backoff, handler),
            state,
        }
    }

    pub fn start(&self) {
        *lock(&self.state) = WriteStreamState::default();
        self.stream.start();
    }

    /// Stops the stream, first telling the server it may release the
    /// session when the handshake had completed.
    pub fn stop(&self) {
        if self.handshake_complete() && self.stream.is_open() {
            let _ = self.write_mutations(Vec::new());
        }
        self.stream.stop();
    }

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    pub fn write_handshake(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        log::debug!(
            target: "WriteStream",
            "handshake with stream token '{}'",
            BASE64_STANDARD.encode(&stream_token)
        );
        self.stream.send(WriteRequest {
            stream_token,
            writes: Vec::new(),
        })
    }

    pub fn write_mutations(&self, writes: Vec<Mutation>) -> FirestoreResult<()> {
        let stream_token = self.last_stream_token();
        self.stream.send(WriteRequest {
            stream_token,
            writes,
        })
    }
}

impl Deref for WriteStream {
    type Target = PersistentStream<WriteKind>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, Timestamp};
    use crate::firestore::remote::datastore::{MockBackend, StaticTokenProvider};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl WriteStreamListener for Recorder {
        async fn on_write_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".into());
            Ok(())
        }

        async fn on_handshake_complete(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("handshake".into());
            Ok(())
        }

        async fn on_mutation_result(
            &self,
            _commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
        ) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(format!("results:{}", results.len()));
            Ok(())
        }

        async fn on_write_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            queue.drain().await.unwrap();
        }
    }

    fn response(token: &[u8], results: usize) -> WriteResponse {
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        WriteResponse {
            stream_token: token.to_vec(),
            commit_version: version,
            write_results: vec![MutationResult::new(version, Vec::new()); results],
        }
    }

    #[tokio::test]
    async fn handshake_then_mutations_carry_latest_token() {
        let queue = AsyncQueue::new();
        let backend = MockBackend::new();
        let datastore = Datastore::new(backend.connection(), Arc::new(StaticTokenProvider::new(None)));
        let recorder = Arc::new(Recorder::default());
        let stream = Arc::new(WriteStream::new(
            queue.clone(),
            datastore,
            BackoffSettings::default(),
            recorder.clone(),
        ));

        let starter = Arc::clone(&stream);
        queue
            .enqueue(async move {
                starter.start();
                Ok(())
            })
            .await
            .unwrap();
        settle(&queue).await;

        stream.write_handshake(b"previous".to_vec()).unwrap();
        assert_eq!(backend.next_write_request().unwrap().stream_token, b"previous".to_vec());
        backend.send_write_response(response(b"t1", 0));
        settle(&queue).await;
        assert!(stream.handshake_complete());

        let key = DocumentKey::from_string("rooms/a").unwrap();
        stream.write_mutations(vec![Mutation::delete(key)]).unwrap();
        let request = backend.next_write_request().unwrap();
        assert_eq!(request.stream_token, b"t1".to_vec());
        assert_eq!(request.writes.len(), 1);

        backend.send_write_response(response(b"t2", 1));
        settle(&queue).await;
        assert_eq!(stream.last_stream_token(), b"t2".to_vec());
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["open", "handshake", "results:1"]
        );

        stream.stop();
        let teardown = backend.next_write_request().unwrap();
        assert!(teardown.writes.is_empty());
        assert_eq!(teardown.stream_token, b"t2".to_vec());
    }
}
