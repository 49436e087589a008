use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;

use crate::firestore::core::{OnlineState, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, ListenSequenceNumber, TargetId};
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::AsyncQueue;
use crate::platform::runtime::spawn_detached;

const LOG_TARGET: &str = "SharedClientState";

/// Progress of a mutation batch as seen by the primary client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

/// Whether the primary client has caught up with a query target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Callback fed with sequence numbers written by other clients.
pub type SequenceNumberListener = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// Receiver of state changes made by other clients. Implemented by the sync
/// engine; every call arrives on the receiving client's async queue.
#[async_trait]
pub trait SharedClientStateSyncer: Send + Sync {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    async fn apply_shared_online_state(&self, online_state: OnlineState) -> FirestoreResult<()>;
}

/// State shared between the clients that use the same persistence.
///
/// The primary client writes mutation and target states; secondary clients
/// react to them. Every client publishes its active targets.
pub trait SharedClientState: Send + Sync {
    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);

    fn set_sequence_number_listener(&self, listener: SequenceNumberListener);

    fn add_pending_mutation(&self, batch_id: BatchId);

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    );

    /// Registers a target of a local listener and returns the state another
    /// client already reported for it.
    fn add_local_query_target(&self, target_id: TargetId, add_to_active_target_ids: bool) -> QueryTargetState;

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<FirestoreError>);

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any client listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn clear_query_state(&self, target_id: TargetId);

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, online_state: OnlineState);

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber);
}

/// [`SharedClientState`] of a client that shares its persistence with nobody.
#[derive(Default)]
pub struct MemorySharedClientState {
    local_targets: StdMutex<BTreeMap<TargetId, QueryTargetState>>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedClientState for MemorySharedClientState {
    fn start(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn set_syncer(&self, _syncer: Weak<dyn SharedClientStateSyncer>) {}

    fn set_sequence_number_listener(&self, _listener: SequenceNumberListener) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(&self, _batch_id: BatchId, _state: MutationBatchState, _error: Option<FirestoreError>) {}

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_target_ids: bool) -> QueryTargetState {
        let mut targets = lock(&self.local_targets);
        let state = targets.get(&target_id).copied().unwrap_or(QueryTargetState::NotCurrent);
        if add_to_active_target_ids {
            targets.insert(target_id, state);
        }
        state
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, _error: Option<FirestoreError>) {
        if let Some(existing) = lock(&self.local_targets).get_mut(&target_id) {
            *existing = state;
        }
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        lock(&self.local_targets).remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        lock(&self.local_targets).contains_key(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.is_local_query_target(target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        lock(&self.local_targets).remove(&target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        lock(&self.local_targets).keys().copied().collect()
    }

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, _online_state: OnlineState) {}

    fn write_sequence_number(&self, _sequence_number: ListenSequenceNumber) {}
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientMetadataEvent {
    pub client_id: String,
    /// `None` once the client shut down.
    pub active_target_ids: Option<BTreeSet<TargetId>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationStateEvent {
    pub origin: String,
    pub user: User,
    pub batch_id: BatchId,
    pub state: MutationBatchState,
    pub error: Option<FirestoreError>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetStateEvent {
    pub origin: String,
    pub target_id: TargetId,
    pub state: QueryTargetState,
    pub error: Option<FirestoreError>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OnlineStateEvent {
    pub origin: String,
    pub online_state: OnlineState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SequenceNumberEvent {
    pub origin: String,
    pub sequence_number: ListenSequenceNumber,
}

/// One message on the bus, tagged by channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientStateEvent {
    ClientMetadata(ClientMetadataEvent),
    MutationState(MutationStateEvent),
    TargetState(TargetStateEvent),
    OnlineState(OnlineStateEvent),
    SequenceNumber(SequenceNumberEvent),
}

impl ClientStateEvent {
    pub fn origin(&self) -> &str {
        match self {
            ClientStateEvent::ClientMetadata(event) => &event.client_id,
            ClientStateEvent::MutationState(event) => &event.origin,
            ClientStateEvent::TargetState(event) => &event.origin,
            ClientStateEvent::OnlineState(event) => &event.origin,
            ClientStateEvent::SequenceNumber(event) => &event.origin,
        }
    }
}

#[derive(Default)]
struct BusState {
    clients: BTreeMap<String, BTreeSet<TargetId>>,
    mutations: BTreeMap<(String, BatchId), MutationStateEvent>,
    targets: BTreeMap<TargetId, TargetStateEvent>,
    online_state: Option<OnlineStateEvent>,
    sequence_number: Option<ListenSequenceNumber>,
    subscribers: Vec<(String, async_channel::Sender<ClientStateEvent>)>,
}

/// In-process broadcast medium connecting the clients of one persistence.
///
/// Keeps the latest value of each channel so clients that join later can
/// read it.
#[derive(Default)]
pub struct SharedStateBus {
    state: StdMutex<BusState>,
}

impl SharedStateBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribe(&self, client_id: &str) -> async_channel::Receiver<ClientStateEvent> {
        let (sender, receiver) = async_channel::unbounded();
        lock(&self.state).subscribers.push((client_id.to_string(), sender));
        receiver
    }

    fn unsubscribe(&self, client_id: &str) {
        lock(&self.state).subscribers.retain(|(id, _)| id != client_id);
    }

    fn publish(&self, event: ClientStateEvent) {
        let subscribers = {
            let mut state = lock(&self.state);
            match &event {
                ClientStateEvent::ClientMetadata(metadata) => match &metadata.active_target_ids {
                    Some(targets) => {
                        state.clients.insert(metadata.client_id.clone(), targets.clone());
                    }
                    None => {
                        state.clients.remove(&metadata.client_id);
                    }
                },
                ClientStateEvent::MutationState(mutation) => {
                    let key = (mutation.user.to_key().to_string(), mutation.batch_id);
                    if mutation.state == MutationBatchState::Pending {
                        state.mutations.insert(key, mutation.clone());
                    } else {
                        // receivers never read a settled batch back
                        state.mutations.remove(&key);
                    }
                }
                ClientStateEvent::TargetState(target) => {
                    state.targets.insert(target.target_id, target.clone());
                }
                ClientStateEvent::OnlineState(online) => {
                    state.online_state = Some(online.clone());
                }
                ClientStateEvent::SequenceNumber(sequence) => {
                    let current = state.sequence_number.unwrap_or(sequence.sequence_number);
                    state.sequence_number = Some(current.max(sequence.sequence_number));
                }
            }
            state.subscribers.clone()
        };
        for (_, sender) in subscribers {
            let _ = sender.try_send(event.clone());
        }
    }

    /// Active targets per known client.
    pub fn clients(&self) -> BTreeMap<String, BTreeSet<TargetId>> {
        lock(&self.state).clients.clone()
    }

    pub fn target_state(&self, target_id: TargetId) -> Option<QueryTargetState> {
        lock(&self.state).targets.get(&target_id).map(|event| event.state)
    }

    fn remove_target_state(&self, target_id: TargetId) {
        lock(&self.state).targets.remove(&target_id);
    }

    fn remove_mutation_state(&self, user: &User, batch_id: BatchId) {
        lock(&self.state)
            .mutations
            .remove(&(user.to_key().to_string(), batch_id));
    }

    pub fn pending_mutations(&self, user: &User) -> Vec<BatchId> {
        lock(&self.state)
            .mutations
            .keys()
            .filter(|(uid, _)| uid == user.to_key())
            .map(|(_, batch_id)| *batch_id)
            .collect()
    }

    pub fn online_state(&self) -> Option<OnlineState> {
        lock(&self.state).online_state.as_ref().map(|event| event.online_state)
    }

    pub fn sequence_number(&self) -> Option<ListenSequenceNumber> {
        lock(&self.state).sequence_number
    }
}

struct MultiClientState {
    started: bool,
    user: User,
    local_targets: BTreeSet<TargetId>,
    /// Active targets of the other clients.
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    sequence_number_listener: Option<SequenceNumberListener>,
}

/// [`SharedClientState`] for clients that synchronize through a
/// [`SharedStateBus`]. Events from other clients are handed to the syncer on
/// this client's async queue; events this client published are dropped.
pub struct MultiClientSharedClientState {
    client_id: String,
    bus: Arc<SharedStateBus>,
    queue: AsyncQueue,
    state: Arc<StdMutex<MultiClientState>>,
}

impl MultiClientSharedClientState {
    pub fn new(bus: Arc<SharedStateBus>, queue: AsyncQueue, client_id: impl Into<String>, user: User) -> Self {
        Self {
            client_id: client_id.into(),
            bus,
            queue,
            state: Arc::new(StdMutex::new(MultiClientState {
                started: false,
                user,
                local_targets: BTreeSet::new(),
                remote_clients: BTreeMap::new(),
                syncer: None,
                sequence_number_listener: None,
            })),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publish_client_state(&self) {
        let targets = lock(&self.state).local_targets.clone();
        self.bus.publish(ClientStateEvent::ClientMetadata(ClientMetadataEvent {
            client_id: self.client_id.clone(),
            active_target_ids: Some(targets),
        }));
    }

    fn dispatch(queue: AsyncQueue, state: Arc<StdMutex<MultiClientState>>, event: ClientStateEvent) {
        let syncer = lock(&state).syncer.as_ref().and_then(Weak::upgrade);
        match event {
            ClientStateEvent::ClientMetadata(metadata) => {
                let (added, removed) = {
                    let mut guard = lock(&state);
                    let before = union_of(guard.remote_clients.values());
                    match metadata.active_target_ids {
                        Some(targets) => {
                            guard.remote_clients.insert(metadata.client_id, targets);
                        }
                        None => {
                            guard.remote_clients.remove(&metadata.client_id);
                        }
                    }
                    let after = union_of(guard.remote_clients.values());
                    let added: Vec<TargetId> = after.difference(&before).copied().collect();
                    let removed: Vec<TargetId> = before.difference(&after).copied().collect();
                    (added, removed)
                };
                if added.is_empty() && removed.is_empty() {
                    return;
                }
                if let Some(syncer) = syncer {
                    queue.enqueue_and_forget(async move { syncer.apply_active_targets_change(added, removed).await });
                }
            }
            ClientStateEvent::MutationState(mutation) => {
                if lock(&state).user != mutation.user {
                    log::debug!(
                        target: LOG_TARGET,
                        "Ignoring mutation for non-active user {}",
                        mutation.user
                    );
                    return;
                }
                if let Some(syncer) = syncer {
                    queue.enqueue_and_forget(async move {
                        syncer
                            .apply_batch_state(mutation.batch_id, mutation.state, mutation.error)
                            .await
                    });
                }
            }
            ClientStateEvent::TargetState(target) => {
                if let Some(syncer) = syncer {
                    queue.enqueue_and_forget(async move {
                        syncer
                            .apply_target_state(target.target_id, target.state, target.error)
                            .await
                    });
                }
            }
            ClientStateEvent::OnlineState(online) => {
                if !lock(&state).remote_clients.contains_key(&online.origin) {
                    log::debug!(target: LOG_TARGET, "Ignoring online state from inactive client {}", online.origin);
                    return;
                }
                if let Some(syncer) = syncer {
                    queue.enqueue_and_forget(async move { syncer.apply_shared_online_state(online.online_state).await });
                }
            }
            ClientStateEvent::SequenceNumber(sequence) => {
                let listener = lock(&state).sequence_number_listener.clone();
                if let Some(listener) = listener {
                    listener(sequence.sequence_number);
                }
            }
        }
    }
}

fn union_of<'a, I>(sets: I) -> BTreeSet<TargetId>
where
    I: IntoIterator<Item = &'a BTreeSet<TargetId>>,
{
    sets.into_iter().flatten().copied().collect()
}

impl SharedClientState for MultiClientSharedClientState {
    fn start(&self) -> FirestoreResult<()> {
        {
            let mut state = lock(&self.state);
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.remote_clients = self
                .bus
                .clients()
                .into_iter()
                .filter(|(client_id, _)| client_id != &self.client_id)
                .collect();
        }

        let receiver = self.bus.subscribe(&self.client_id);
        let client_id = self.client_id.clone();
        let queue = self.queue.clone();
        let state = Arc::clone(&self.state);
        spawn_detached(async move {
            while let Ok(event) = receiver.recv().await {
                if event.origin() == client_id {
                    continue;
                }
                Self::dispatch(queue.clone(), Arc::clone(&state), event);
            }
        });

        self.publish_client_state();

        // late joiners pick up what the primary already reported
        if let (Some(online_state), Some(origin)) = (
            self.bus.online_state(),
            lock(&self.bus.state).online_state.as_ref().map(|event| event.origin.clone()),
        ) {
            if origin != self.client_id {
                Self::dispatch(
                    self.queue.clone(),
                    Arc::clone(&self.state),
                    ClientStateEvent::OnlineState(OnlineStateEvent { origin, online_state }),
                );
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let was_started = std::mem::replace(&mut lock(&self.state).started, false);
        if !was_started {
            return;
        }
        self.bus.unsubscribe(&self.client_id);
        self.bus.publish(ClientStateEvent::ClientMetadata(ClientMetadataEvent {
            client_id: self.client_id.clone(),
            active_target_ids: None,
        }));
    }

    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        lock(&self.state).syncer = Some(syncer);
    }

    fn set_sequence_number_listener(&self, listener: SequenceNumberListener) {
        lock(&self.state).sequence_number_listener = Some(listener);
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.update_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<FirestoreError>) {
        let user = lock(&self.state).user.clone();
        self.bus.publish(ClientStateEvent::MutationState(MutationStateEvent {
            origin: self.client_id.clone(),
            user,
            batch_id,
            state,
            error,
        }));
    }

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_target_ids: bool) -> QueryTargetState {
        let mut query_state = QueryTargetState::NotCurrent;
        if self.is_active_query_target(target_id) {
            if let Some(existing) = self.bus.target_state(target_id) {
                query_state = existing;
            }
        }
        if add_to_active_target_ids {
            lock(&self.state).local_targets.insert(target_id);
            self.publish_client_state();
        }
        query_state
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<FirestoreError>) {
        self.bus.publish(ClientStateEvent::TargetState(TargetStateEvent {
            origin: self.client_id.clone(),
            target_id,
            state,
            error,
        }));
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        lock(&self.state).local_targets.remove(&target_id);
        self.publish_client_state();
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        lock(&self.state).local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        let state = lock(&self.state);
        state.local_targets.contains(&target_id)
            || state
                .remote_clients
                .values()
                .any(|targets| targets.contains(&target_id))
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.bus.remove_target_state(target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        let state = lock(&self.state);
        let mut targets = state.local_targets.clone();
        targets.extend(union_of(state.remote_clients.values()));
        targets
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let previous = std::mem::replace(&mut lock(&self.state).user, user.clone());
        for batch_id in removed_batch_ids {
            self.bus.remove_mutation_state(&previous, *batch_id);
        }
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        self.bus.publish(ClientStateEvent::OnlineState(OnlineStateEvent {
            origin: self.client_id.clone(),
            online_state,
        }));
    }

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        self.bus.publish(ClientStateEvent::SequenceNumber(SequenceNumberEvent {
            origin: self.client_id.clone(),
            sequence_number,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSyncer {
        batches: StdMutex<Vec<(BatchId, MutationBatchState)>>,
        targets: StdMutex<Vec<(TargetId, QueryTargetState)>>,
        active_changes: StdMutex<Vec<(Vec<TargetId>, Vec<TargetId>)>>,
        online: StdMutex<Vec<OnlineState>>,
    }

    #[async_trait]
    impl SharedClientStateSyncer for RecordingSyncer {
        async fn apply_batch_state(
            &self,
            batch_id: BatchId,
            state: MutationBatchState,
            _error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.batches.lock().unwrap().push((batch_id, state));
            Ok(())
        }

        async fn apply_target_state(
            &self,
            target_id: TargetId,
            state: QueryTargetState,
            _error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.targets.lock().unwrap().push((target_id, state));
            Ok(())
        }

        async fn apply_active_targets_change(
            &self,
            added: Vec<TargetId>,
            removed: Vec<TargetId>,
        ) -> FirestoreResult<()> {
            self.active_changes.lock().unwrap().push((added, removed));
            Ok(())
        }

        async fn apply_shared_online_state(&self, online_state: OnlineState) -> FirestoreResult<()> {
            self.online.lock().unwrap().push(online_state);
            Ok(())
        }
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.drain().await.unwrap();
        }
    }

    fn client(
        bus: &Arc<SharedStateBus>,
        queue: &AsyncQueue,
        id: &str,
    ) -> (MultiClientSharedClientState, Arc<RecordingSyncer>) {
        let state = MultiClientSharedClientState::new(Arc::clone(bus), queue.clone(), id, User::unauthenticated());
        let syncer = Arc::new(RecordingSyncer::default());
        let weak: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&(Arc::clone(&syncer) as Arc<dyn SharedClientStateSyncer>));
        state.set_syncer(weak);
        state.start().unwrap();
        (state, syncer)
    }

    #[tokio::test]
    async fn events_reach_other_clients_only() {
        let bus = SharedStateBus::new();
        let queue = AsyncQueue::new();
        let (primary, primary_syncer) = client(&bus, &queue, "primary");
        let (secondary, secondary_syncer) = client(&bus, &queue, "secondary");

        primary.add_pending_mutation(1);
        primary.update_mutation_state(1, MutationBatchState::Acknowledged, None);
        primary.update_query_state(2, QueryTargetState::Current, None);
        settle(&queue).await;

        assert_eq!(
            *secondary_syncer.batches.lock().unwrap(),
            vec![(1, MutationBatchState::Pending), (1, MutationBatchState::Acknowledged)]
        );
        assert_eq!(*secondary_syncer.targets.lock().unwrap(), vec![(2, QueryTargetState::Current)]);
        assert!(primary_syncer.batches.lock().unwrap().is_empty());
        assert!(bus.pending_mutations(&User::unauthenticated()).is_empty());

        secondary.add_local_query_target(2, true);
        settle(&queue).await;
        assert_eq!(*primary_syncer.active_changes.lock().unwrap(), vec![(vec![2], vec![])]);
        assert!(primary.is_active_query_target(2));
        assert!(!primary.is_local_query_target(2));

        secondary.shutdown();
        settle(&queue).await;
        assert_eq!(primary_syncer.active_changes.lock().unwrap().last(), Some(&(vec![], vec![2])));
        assert_eq!(primary.add_local_query_target(2, true), QueryTargetState::NotCurrent);
    }

    #[tokio::test]
    async fn late_joiner_reads_stored_state() {
        let bus = SharedStateBus::new();
        let queue = AsyncQueue::new();
        let (primary, _) = client(&bus, &queue, "primary");
        primary.add_local_query_target(4, true);
        primary.update_query_state(4, QueryTargetState::Current, None);
        primary.set_online_state(OnlineState::Online);

        let (secondary, secondary_syncer) = client(&bus, &queue, "secondary");
        settle(&queue).await;
        assert_eq!(secondary.add_local_query_target(4, true), QueryTargetState::Current);
        assert_eq!(*secondary_syncer.online.lock().unwrap(), vec![OnlineState::Online]);
    }

    #[tokio::test]
    async fn sequence_numbers_and_foreign_users() {
        let bus = SharedStateBus::new();
        let queue = AsyncQueue::new();
        let (primary, _) = client(&bus, &queue, "primary");
        let (secondary, secondary_syncer) = client(&bus, &queue, "secondary");
        let observed = Arc::new(AtomicI64::new(0));
        let sink = Arc::clone(&observed);
        secondary.set_sequence_number_listener(Arc::new(move |seq| sink.store(seq, Ordering::SeqCst)));

        primary.write_sequence_number(42);
        primary.handle_user_change(&User::new("alice"), &[], &[7]);
        settle(&queue).await;

        assert_eq!(observed.load(Ordering::SeqCst), 42);
        assert_eq!(bus.sequence_number(), Some(42));
        assert!(secondary_syncer.batches.lock().unwrap().is_empty());
        assert_eq!(bus.pending_mutations(&User::new("alice")), vec![7]);
    }

    #[test]
    fn memory_state_tracks_local_targets() {
        let state = MemorySharedClientState::new();
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::NotCurrent);
        state.update_query_state(2, QueryTargetState::Current, None);
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::Current);
        assert_eq!(state.get_all_active_query_targets(), BTreeSet::from([2]));
        state.remove_local_query_target(2);
        assert!(!state.is_active_query_target(2));
    }
}
