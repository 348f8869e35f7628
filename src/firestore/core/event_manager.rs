//! Fan-out of view snapshots to user listeners.
//!
//! Several listeners may watch the same query; the sync engine keeps one
//! view per query and the event manager decides, per listener, which
//! snapshots to raise based on its [`ListenOptions`] and the online state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::Query;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

const LOG_TARGET: &str = "firestore::event_manager";

pub type ListenerId = u64;

/// Receives the snapshots, or the error that ended the listen.
pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change metadata, e.g. `from_cache`.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the server confirmed it, unless
    /// the client is known to be offline.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

/// One user listener on a query.
pub struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(
        id: ListenerId,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether a snapshot was raised.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                true
            } else {
                false
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            true
        } else {
            false
        };
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// A listener that held back its first snapshot may release it once the
    /// client turns out to be offline.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        match self.snapshot.clone() {
            Some(snapshot)
                if !self.raised_initial_event
                    && self.should_raise_initial_event(&snapshot, online_state) =>
            {
                self.raise_initial_event(&snapshot);
                true
            }
            _ => false,
        }
    }

    fn should_raise_initial_event(
        &self,
        snapshot: &ViewSnapshot,
        online_state: OnlineState,
    ) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is not worth raising while the server may
        // still answer.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

#[derive(Default)]
struct QueryListeners {
    query: Option<Query>,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Listeners grouped by query.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListeners>,
    query_by_listener: HashMap<ListenerId, String>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_listener_id(&mut self) -> ListenerId {
        self.next_listener_id += 1;
        self.next_listener_id
    }

    /// Whether some listener already watches `query`.
    pub fn is_listening(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn listener_count(&self) -> usize {
        self.query_by_listener.len()
    }

    /// Registers `listener`. `initial_snapshot` is the snapshot the sync
    /// engine produced for the first listener of a query.
    pub fn add_listener(
        &mut self,
        mut listener: QueryListener,
        initial_snapshot: Option<ViewSnapshot>,
    ) {
        let canonical_id = listener.query.canonical_id();
        self.query_by_listener
            .insert(listener.id, canonical_id.clone());
        let entry = self.queries.entry(canonical_id).or_default();
        if entry.query.is_none() {
            entry.query = Some(listener.query.clone());
        }
        if initial_snapshot.is_some() {
            entry.view_snapshot = initial_snapshot;
        }

        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = entry.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        entry.listeners.push(listener);
    }

    /// Removes a listener. Returns the query if it was the last listener on
    /// it, so the caller can stop listening to the query.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Query> {
        let canonical_id = self.query_by_listener.remove(&id)?;
        let entry = self.queries.get_mut(&canonical_id)?;
        entry.listeners.retain(|listener| listener.id != id);
        if entry.listeners.is_empty() {
            self.queries
                .remove(&canonical_id)
                .and_then(|entry| entry.query)
        } else {
            None
        }
    }

    pub fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut entry.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// Fails every listener of `query` and forgets them.
    pub fn on_listen_error(&mut self, query: &Query, error: FirestoreError) {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        log::warn!(
            target: LOG_TARGET,
            "listen for {} failed: {error}",
            query.canonical_id()
        );
        for listener in entry.listeners {
            self.query_by_listener.remove(&listener.id);
            listener.on_error(error.clone());
        }
    }

    pub fn handle_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}
