use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{OnlineState, Query};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::util::async_queue::lock;
use crate::util::Observer;

const LOG_TARGET: &str = "EventManager";

pub type SnapshotObserver = Arc<dyn Observer<ViewSnapshot, FirestoreError>>;
pub type SnapshotsInSyncObserver = Arc<dyn Observer<(), FirestoreError>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes or
    /// sync state).
    pub include_metadata_changes: bool,
    /// Hold back a cached first snapshot while the client may be online.
    pub wait_for_sync_when_online: bool,
}

struct QueryListenerState {
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// One user listener on a query. Filters the view's snapshots down to the
/// ones the listener asked for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    state: StdMutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            observer,
            state: StdMutex::new(QueryListenerState {
                raised_initial_event: false,
                snap: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Feeds a view snapshot; returns whether the observer was called.
    pub fn on_view_snapshot(&self, snapshot: &ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = {
            let mut state = lock(&self.state);
            let raised = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(state.snap.as_ref(), &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snap = Some(snapshot);
            raised
        };

        match raised {
            Some(event) => {
                self.observer.next(&event);
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: &FirestoreError) {
        self.observer.error(error);
    }

    /// Returns whether the change released a held-back first snapshot.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            match &state.snap {
                Some(snap)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snap, online_state) =>
                {
                    let event = initial_event(snap);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                self.observer.next(&event);
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth showing when it will not
        // be replaced by server results shortly.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, previous: Option<&ViewSnapshot>, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = previous
            .map(|previous| previous.has_pending_writes() != snapshot.has_pending_writes())
            .unwrap_or(false);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.documents.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    )
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync: Vec<SnapshotsInSyncObserver>,
}

/// Fans view snapshots out to the user listeners of each query.
///
/// The sync engine is asked to listen once per distinct query; further
/// listeners on the same query share its view.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: StdMutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: Arc::clone(&sync_engine),
            state: StdMutex::new(EventManagerState::default()),
        });
        let listener: std::sync::Weak<EventManager> = Arc::downgrade(&manager);
        sync_engine.set_listener(listener);
        manager
    }

    /// Registers `listener`. Failures to start the query are reported to
    /// the listener rather than returned.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let first_listen = {
            let mut state = lock(&self.state);
            if state.queries.contains_key(&canonical_id) {
                false
            } else {
                state.queries.insert(canonical_id.clone(), QueryListenersInfo::default());
                true
            }
        };

        if first_listen {
            match self.sync_engine.listen(listener.query().clone(), true).await {
                Ok(snapshot) => {
                    if let Some(info) = lock(&self.state).queries.get_mut(&canonical_id) {
                        info.view_snap = Some(snapshot);
                    }
                }
                Err(err) => {
                    log::warn!(target: LOG_TARGET, "Initialization of query '{canonical_id}' failed: {err}");
                    lock(&self.state).queries.remove(&canonical_id);
                    listener.on_error(&err);
                    return Ok(());
                }
            }
        }

        let (online_state, view_snap) = {
            let mut state = lock(&self.state);
            let online_state = state.online_state;
            let info = state.queries.entry(canonical_id).or_default();
            info.listeners.push(Arc::clone(&listener));
            (online_state, info.view_snap.clone())
        };
        listener.apply_online_state_change(online_state);
        if let Some(view_snap) = view_snap {
            if listener.on_view_snapshot(&view_snap) {
                self.raise_snapshots_in_sync_event();
            }
        }
        Ok(())
    }

    /// Removes `listener`; the last listener of a query stops the query.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();
        let last_listen = {
            let mut state = lock(&self.state);
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            let last = before != info.listeners.len() && info.listeners.is_empty();
            if last {
                state.queries.remove(&canonical_id);
            }
            last
        };
        if last_listen {
            self.sync_engine.unlisten(&query, true).await?;
        }
        Ok(())
    }

    /// Calls `observer` now and whenever every listener saw the effects of
    /// the same events.
    pub fn add_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) {
        lock(&self.state).snapshots_in_sync.push(Arc::clone(&observer));
        observer.next(&());
    }

    pub fn remove_snapshots_in_sync_listener(&self, observer: &SnapshotsInSyncObserver) {
        lock(&self.state)
            .snapshots_in_sync
            .retain(|existing| !same_observer(existing, observer));
    }

    fn raise_snapshots_in_sync_event(&self) {
        let observers = lock(&self.state).snapshots_in_sync.clone();
        for observer in observers {
            observer.next(&());
        }
    }
}

fn same_observer(left: &SnapshotsInSyncObserver, right: &SnapshotsInSyncObserver) -> bool {
    std::ptr::eq(Arc::as_ptr(left) as *const (), Arc::as_ptr(right) as *const ())
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries: Vec<(Vec<Arc<QueryListener>>, ViewSnapshot)> = {
            let mut state = lock(&self.state);
            snapshots
                .into_iter()
                .filter_map(|snapshot| {
                    let info = state.queries.get_mut(&snapshot.query.canonical_id())?;
                    info.view_snap = Some(snapshot.clone());
                    Some((info.listeners.clone(), snapshot))
                })
                .collect()
        };

        let mut raised = false;
        for (listeners, snapshot) in deliveries {
            for listener in listeners {
                raised |= listener.on_view_snapshot(&snapshot);
            }
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let info = lock(&self.state).queries.remove(&query.canonical_id());
        if let Some(info) = info {
            for listener in info.listeners {
                listener.on_error(&error);
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        let mut raised = false;
        for listener in listeners {
            raised |= listener.apply_online_state_change(online_state);
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::firestore::core::view_snapshot::{ChangeType, DocumentViewChange};
    use crate::firestore::core::DocumentSet;
    use crate::firestore::model::{DocumentKey, MutableDocument, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};
    use crate::util::PartialObserver;

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_segments(["rooms"]))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    fn snapshot(paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut documents = DocumentSet::new(rooms().comparator());
        for path in paths {
            documents.insert(doc(path));
        }
        ViewSnapshot::from_initial_documents(rooms(), documents, BTreeSet::new(), from_cache, false)
    }

    fn recording(options: ListenOptions) -> (Arc<QueryListener>, Arc<StdMutex<Vec<ViewSnapshot>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer = PartialObserver::<ViewSnapshot, FirestoreError>::new().with_next(move |snap: &ViewSnapshot| {
            sink.lock().unwrap().push(snap.clone());
        });
        (QueryListener::new(rooms(), options, Arc::new(observer)), events)
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let (listener, events) = recording(ListenOptions::default());
        assert!(!listener.on_view_snapshot(&snapshot(&[], true)));
        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let raised = events.lock().unwrap().clone();
        assert_eq!(raised.len(), 1);
        assert!(raised[0].from_cache);
    }

    #[test]
    fn cached_results_are_raised_unless_waiting_for_sync() {
        let (listener, events) = recording(ListenOptions::default());
        assert!(listener.on_view_snapshot(&snapshot(&["rooms/a"], true)));
        assert_eq!(events.lock().unwrap().len(), 1);

        let (waiting, waiting_events) = recording(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        assert!(!waiting.on_view_snapshot(&snapshot(&["rooms/a"], true)));
        assert!(waiting.on_view_snapshot(&snapshot(&["rooms/a"], false)));
        assert!(!waiting_events.lock().unwrap()[0].from_cache);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let mut metadata_change = snapshot(&["rooms/a"], false);
        metadata_change.sync_state_changed = true;
        metadata_change.document_changes = vec![DocumentViewChange::new(ChangeType::Metadata, doc("rooms/a"))];

        let (plain, plain_events) = recording(ListenOptions::default());
        plain.on_view_snapshot(&snapshot(&["rooms/a"], false));
        assert!(!plain.on_view_snapshot(&metadata_change));
        assert_eq!(plain_events.lock().unwrap().len(), 1);

        let (verbose, verbose_events) = recording(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        verbose.on_view_snapshot(&snapshot(&["rooms/a"], false));
        assert!(verbose.on_view_snapshot(&metadata_change));
        assert_eq!(verbose_events.lock().unwrap().len(), 2);
    }

    #[test]
    fn errors_reach_the_observer() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let observer = PartialObserver::<ViewSnapshot, FirestoreError>::new().with_error(move |_: &FirestoreError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let listener = QueryListener::new(rooms(), ListenOptions::default(), Arc::new(observer));
        listener.on_error(&crate::firestore::error::permission_denied("denied"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
