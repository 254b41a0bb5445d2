use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::Query;
use crate::error::{FirestoreError, FirestoreResult};
use crate::remote::OnlineState;

pub type QueryObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots when only `from_cache` or pending-write state changed.
    pub include_metadata_changes: bool,
}

/// Decides which view snapshots one observer gets to see.
struct QueryListener {
    id: u64,
    options: ListenOptions,
    observer: QueryObserver,
    /// Cleared by the registration; the observer is never called afterwards.
    active: Arc<AtomicBool>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

type Notification = (QueryObserver, Arc<AtomicBool>, FirestoreResult<ViewSnapshot>);

impl QueryListener {
    fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot, out: &mut Vec<Notification>) {
        if !self.options.include_metadata_changes {
            snapshot
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
        }

        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot, out);
            }
        } else if self.should_raise_event(&snapshot) {
            out.push(self.notification(Ok(snapshot.clone())));
        }
        self.snapshot = Some(snapshot);
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState, out: &mut Vec<Notification>) {
        self.online_state = online_state;
        if self.raised_initial_event {
            return;
        }
        if let Some(snapshot) = self.snapshot.clone() {
            if self.should_raise_initial_event(&snapshot, online_state) {
                self.raise_initial_event(&snapshot, out);
            }
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        // Cached results are worth showing; an empty cache is only shown once
        // the client knows it cannot reach the backend.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes != snapshot.has_pending_writes);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot, out: &mut Vec<Notification>) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        );
        self.raised_initial_event = true;
        out.push(self.notification(Ok(initial)));
    }

    fn notification(&self, result: FirestoreResult<ViewSnapshot>) -> Notification {
        (Arc::clone(&self.observer), Arc::clone(&self.active), result)
    }
}

#[derive(Default)]
struct QueryListeners {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

struct EventManagerState {
    queries: HashMap<String, QueryListeners>,
    online_state: OnlineState,
    next_listener_id: u64,
}

/// Fans view snapshots out to observers. Several observers of the same query
/// share one listen in the sync engine.
pub struct EventManager {
    state: StdMutex<EventManagerState>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
                next_listener_id: 1,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an observer. Returns the listener id used to remove it.
    pub async fn listen(
        &self,
        sync_engine: &SyncEngine,
        query: Query,
        options: ListenOptions,
        observer: QueryObserver,
        active: Arc<AtomicBool>,
    ) -> FirestoreResult<u64> {
        let canonical_id = query.canonical_id();
        let first = !self.state().queries.contains_key(&canonical_id);
        let initial_snapshot = if first {
            Some(sync_engine.listen(query).await?)
        } else {
            None
        };

        let mut notifications = Vec::new();
        let id = {
            let mut state = self.state();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            let online_state = state.online_state;
            let mut listener = QueryListener {
                id,
                options,
                observer,
                active,
                raised_initial_event: false,
                snapshot: None,
                online_state,
            };
            let entry = state.queries.entry(canonical_id).or_default();
            if let Some(snapshot) = initial_snapshot {
                entry.view_snapshot = Some(snapshot);
            }
            listener.apply_online_state_change(online_state, &mut notifications);
            if let Some(snapshot) = entry.view_snapshot.clone() {
                listener.on_view_snapshot(snapshot, &mut notifications);
            }
            entry.listeners.push(listener);
            id
        };
        dispatch(notifications);
        Ok(id)
    }

    /// Removes one observer; the last observer of a query stops the listen.
    pub async fn unlisten(&self, sync_engine: &SyncEngine, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let last = {
            let mut state = self.state();
            let Some(entry) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            entry.listeners.retain(|listener| listener.id != listener_id);
            if entry.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                true
            } else {
                false
            }
        };
        if last {
            sync_engine.unlisten(query).await?;
        }
        Ok(())
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state();
            for snapshot in snapshots {
                let Some(entry) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &mut entry.listeners {
                    listener.on_view_snapshot(snapshot.clone(), &mut notifications);
                }
                entry.view_snapshot = Some(snapshot);
            }
        }
        dispatch(notifications);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.state().queries.remove(&query.canonical_id());
        let Some(entry) = removed else {
            return;
        };
        let notifications = entry
            .listeners
            .iter()
            .map(|listener| listener.notification(Err(error.clone())))
            .collect();
        dispatch(notifications);
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut notifications = Vec::new();
        {
            let mut state = self.state();
            state.online_state = online_state;
            for entry in state.queries.values_mut() {
                for listener in &mut entry.listeners {
                    listener.apply_online_state_change(online_state, &mut notifications);
                }
            }
        }
        dispatch(notifications);
    }
}

/// Calls observers outside the lock so they may register or detach listeners.
fn dispatch(notifications: Vec<Notification>) {
    for (observer, active, result) in notifications {
        if active.load(Ordering::SeqCst) {
            observer(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::view_snapshot::DocumentSet;
    use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
    use crate::value::MapValue;
    use std::collections::BTreeSet;

    fn snapshot(query: &Query, paths: &[&str], from_cache: bool, sync_state_changed: bool) -> ViewSnapshot {
        let mut docs = DocumentSet::new(query);
        for path in paths {
            docs.insert(MutableDocument::new_found_document(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::min(),
                MapValue::empty(),
            ));
        }
        let mut snapshot = ViewSnapshot::from_initial_documents(query.clone(), docs, BTreeSet::new(), from_cache);
        snapshot.sync_state_changed = sync_state_changed;
        snapshot
    }

    fn recording_listener(options: ListenOptions) -> (QueryListener, Arc<StdMutex<Vec<ViewSnapshot>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: QueryObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            sink.lock().unwrap().push(result.unwrap());
        });
        let listener = QueryListener {
            id: 1,
            options,
            observer,
            active: Arc::new(AtomicBool::new(true)),
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        };
        (listener, seen)
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let query = Query::collection("rooms").unwrap();
        let (mut listener, seen) = recording_listener(ListenOptions::default());
        let mut out = Vec::new();

        listener.on_view_snapshot(snapshot(&query, &[], true, true), &mut out);
        dispatch(std::mem::take(&mut out));
        assert!(seen.lock().unwrap().is_empty());

        listener.apply_online_state_change(OnlineState::Offline, &mut out);
        dispatch(out);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].from_cache);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let query = Query::collection("rooms").unwrap();
        let (mut plain, plain_seen) = recording_listener(ListenOptions::default());
        let (mut detailed, detailed_seen) = recording_listener(ListenOptions {
            include_metadata_changes: true,
        });

        let mut out = Vec::new();
        for listener in [&mut plain, &mut detailed] {
            listener.on_view_snapshot(snapshot(&query, &["rooms/a"], true, true), &mut out);
            let mut synced = snapshot(&query, &["rooms/a"], false, true);
            synced.doc_changes.clear();
            listener.on_view_snapshot(synced, &mut out);
        }
        dispatch(out);

        assert_eq!(plain_seen.lock().unwrap().len(), 1);
        let detailed_seen = detailed_seen.lock().unwrap();
        assert_eq!(detailed_seen.len(), 2);
        assert!(!detailed_seen[1].from_cache);
    }

    #[test]
    fn detached_observers_are_skipped() {
        let query = Query::collection("rooms").unwrap();
        let (mut listener, seen) = recording_listener(ListenOptions::default());
        listener.active.store(false, Ordering::SeqCst);
        let mut out = Vec::new();
        listener.on_view_snapshot(snapshot(&query, &["rooms/a"], false, true), &mut out);
        dispatch(out);
        assert!(seen.lock().unwrap().is_empty());
    }
}
