use std::collections::BTreeMap;

use async_channel::Sender;

use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::{OnlineState, Query};
use crate::error::{SyncError, SyncResult};

/// Where a listener takes its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Cache first, then the remote authority.
    #[default]
    Default,
    /// Cache only; the query is never registered with the authority.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Deliver snapshots whose only change is metadata (pending writes,
    /// from-cache state).
    pub include_metadata_changes: bool,
    /// Hold back the first cache snapshot while the client may be online.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn with_source(mut self, source: ListenSource) -> Self {
        self.source = source;
        self
    }

    pub fn wait_for_sync(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

pub(crate) type SnapshotSender = Sender<SyncResult<ViewSnapshot>>;

/// One subscriber of a query.
#[derive(Debug)]
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    sender: SnapshotSender,
    raised_initial_event: bool,
    online_state: OnlineState,
    snap: Option<ViewSnapshot>,
}

impl QueryListener {
    pub(crate) fn new(id: u64, query: Query, options: ListenOptions, sender: SnapshotSender) -> Self {
        Self {
            id,
            query,
            options,
            sender,
            raised_initial_event: false,
            online_state: OnlineState::Unknown,
            snap: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> bool {
        let mut snapshot = snapshot.clone();
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.deliver(Ok(snapshot.clone()));
            raised = true;
        }
        self.snap = Some(snapshot);
        raised
    }

    fn on_error(&self, error: SyncError) {
        self.deliver(Err(error));
        self.sender.close();
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snap.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snap
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
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.deliver(Ok(initial));
    }

    fn deliver(&self, event: SyncResult<ViewSnapshot>) {
        if self.sender.try_send(event).is_err() {
            log::debug!("listener {} dropped; discarding snapshot", self.id);
        }
    }
}

/// What the caller must do in the sync engine before adding a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerSetupAction {
    InitializeLocalListenAndRequireWatchConnection,
    InitializeLocalListenOnly,
    RequireWatchConnectionOnly,
    NoActionRequired,
}

/// What the caller must do in the sync engine after removing a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRemovalAction {
    TerminateLocalListenAndRequireWatchDisconnection,
    TerminateLocalListenOnly,
    RequireWatchDisconnectionOnly,
    NoActionRequired,
}

struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(QueryListener::listens_to_remote_store)
    }
}

/// Fans view snapshots out to every listener of a query. Listeners of the
/// same query share one view in the sync engine.
#[derive(Default)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup_action(&self, listener: &QueryListener) -> ListenerSetupAction {
        match self.queries.get(&listener.query.canonical_id()) {
            None if listener.listens_to_remote_store() => {
                ListenerSetupAction::InitializeLocalListenAndRequireWatchConnection
            }
            None => ListenerSetupAction::InitializeLocalListenOnly,
            Some(info) if !info.has_remote_listeners() && listener.listens_to_remote_store() => {
                ListenerSetupAction::RequireWatchConnectionOnly
            }
            Some(_) => ListenerSetupAction::NoActionRequired,
        }
    }

    /// Registers `listener`, seeding the query's shared snapshot when the
    /// sync engine just produced one.
    pub fn add_listener(&mut self, mut listener: QueryListener, initial: Option<ViewSnapshot>) {
        let info = self
            .queries
            .entry(listener.query.canonical_id())
            .or_insert_with(|| QueryListenersInfo {
                view_snap: None,
                listeners: Vec::new(),
            });
        if initial.is_some() {
            info.view_snap = initial;
        }
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &info.view_snap {
            listener.on_view_snapshot(snapshot);
        }
        info.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, query: &Query, listener_id: u64) -> ListenerRemovalAction {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return ListenerRemovalAction::NoActionRequired;
        };
        let Some(index) = info.listeners.iter().position(|l| l.id == listener_id) else {
            return ListenerRemovalAction::NoActionRequired;
        };
        let removed = info.listeners.remove(index);
        removed.sender.close();

        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            if removed.listens_to_remote_store() {
                ListenerRemovalAction::TerminateLocalListenAndRequireWatchDisconnection
            } else {
                ListenerRemovalAction::TerminateLocalListenOnly
            }
        } else if !info.has_remote_listeners() && removed.listens_to_remote_store() {
            ListenerRemovalAction::RequireWatchDisconnectionOnly
        } else {
            ListenerRemovalAction::NoActionRequired
        }
    }

    pub fn on_watch_change(&mut self, snapshots: &[ViewSnapshot]) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snapshot);
            }
            info.view_snap = Some(snapshot.clone());
        }
    }

    /// Delivers a terminal error to every listener of `query` and forgets it.
    pub fn on_watch_error(&mut self, query: &Query, error: SyncError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }

    /// Fails every listener, used on shutdown.
    pub fn fail_all(&mut self, error: SyncError) {
        for (_, info) in std::mem::take(&mut self.queries) {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
        }
    }
}
