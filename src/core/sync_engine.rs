use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;

use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::{
    EventManager, LimboDocumentChange, OnlineState, Query, QueryListener, Target, TargetIdGenerator,
    View,
};
use crate::core::event_manager::{ListenerRemovalAction, ListenerSetupAction};
use crate::error::{cancelled, internal_error, SyncError, SyncResult};
use crate::local::{LocalStore, LocalViewChanges, ReferenceSet, TargetData};
use crate::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN,
};
use crate::remote::{
    box_remote_store_future, RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer,
    StreamingDatastore, TargetChange, TokenProviderArc,
};
use crate::settings::SyncSettings;
use crate::util::{lock, AsyncQueue};

pub type WriteCallback = oneshot::Receiver<SyncResult<SnapshotVersion>>;
pub type PendingWritesCallback = oneshot::Receiver<SyncResult<()>>;

/// Remote calls collected while the engine state is locked and issued
/// after the lock is released. The remote store calls back into the engine
/// from inside these, so they must never run under the engine lock.
enum RemoteEffect {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered the document. Until then the
    /// target's remote keys are empty.
    received_document: bool,
}

struct SyncEngineState {
    event_manager: EventManager,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    mutation_callbacks: BTreeMap<BatchId, oneshot::Sender<SyncResult<SnapshotVersion>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<SyncResult<()>>>>,
    online_state: OnlineState,
}

/// Ties the local store, the remote store and the views together.
///
/// Every method must be called from the serial queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        settings: &SyncSettings,
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SyncEngineInner>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            SyncEngineInner {
                remote_store: RemoteStore::new(
                    settings,
                    queue,
                    Arc::clone(&local_store),
                    datastore,
                    token_provider,
                    syncer,
                ),
                local_store,
                state: Mutex::new(SyncEngineState {
                    event_manager: EventManager::new(),
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::default(),
                    limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                    max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions.max(1),
                    mutation_callbacks: BTreeMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                    online_state: OnlineState::Unknown,
                }),
            }
        });
        Self { inner }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.inner.remote_store
    }

    pub fn online_state(&self) -> OnlineState {
        lock(&self.inner.state).online_state
    }

    /// Registers `listener`. The first listener of a query creates its view
    /// and, unless it reads from the cache only, the remote target.
    pub async fn listen(&self, listener: QueryListener) -> SyncResult<()> {
        let mut effects = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            let query = listener.query().clone();
            let initial = match state.event_manager.setup_action(&listener) {
                ListenerSetupAction::InitializeLocalListenAndRequireWatchConnection => Some(
                    state.initialize_query(&query, true, &self.inner.local_store, &mut effects)?,
                ),
                ListenerSetupAction::InitializeLocalListenOnly => Some(
                    state.initialize_query(&query, false, &self.inner.local_store, &mut effects)?,
                ),
                ListenerSetupAction::RequireWatchConnectionOnly => {
                    let target_data = self.inner.local_store.allocate_target(query.to_target())?;
                    effects.push(RemoteEffect::Listen(target_data));
                    None
                }
                ListenerSetupAction::NoActionRequired => None,
            };
            state.event_manager.add_listener(listener, initial);
        }
        self.inner.run_effects(effects).await
    }

    /// Removes one listener. The view and the local target go away with the
    /// last listener of the query; the remote target goes away with the last
    /// listener that reads from the authority.
    pub async fn unlisten(&self, query: &Query, listener_id: u64) -> SyncResult<()> {
        let mut effects = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            match state.event_manager.remove_listener(query, listener_id) {
                ListenerRemovalAction::TerminateLocalListenAndRequireWatchDisconnection => {
                    state.remove_query(query, true, &self.inner.local_store, &mut effects)?;
                }
                ListenerRemovalAction::TerminateLocalListenOnly => {
                    state.remove_query(query, false, &self.inner.local_store, &mut effects)?;
                }
                ListenerRemovalAction::RequireWatchDisconnectionOnly => {
                    if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                        effects.push(RemoteEffect::Unlisten(query_view.target_id));
                    }
                }
                ListenerRemovalAction::NoActionRequired => {}
            }
        }
        self.inner.run_effects(effects).await
    }

    /// Applies `mutations` locally as one batch and hands it to the write
    /// pipeline. The returned receiver resolves with the commit version once
    /// the authority acknowledges the batch, or with its rejection.
    ///
    /// Only storing the batch can fail. Once it is stored the callback is
    /// returned even if views or the write pipeline could not be updated,
    /// so retrying a failed call never stores the batch twice.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<WriteCallback> {
        let (sender, receiver) = oneshot::channel();
        let result = self.inner.local_store.write_locally(mutations)?;
        let batch_id = result.batch_id;
        let mut effects = Vec::new();
        let emitted = {
            let mut state = lock(&self.inner.state);
            state.mutation_callbacks.insert(batch_id, sender);
            state.emit_new_snapshots(&result.changes, None, &self.inner.local_store, &mut effects)
        };
        let raised = match emitted {
            Ok(()) => self.inner.run_effects(effects).await,
            Err(err) => Err(err),
        };
        if let Err(err) = raised {
            log::warn!("batch {batch_id} stored but views were not updated: {err}");
        }
        if let Err(err) = self.inner.remote_store.fill_write_pipeline().await {
            log::warn!("batch {batch_id} stored but not sent yet: {err}");
        }
        Ok(receiver)
    }

    /// Resolves once every batch written so far has been acknowledged or
    /// rejected.
    pub fn register_pending_writes_callback(&self) -> SyncResult<PendingWritesCallback> {
        let (sender, receiver) = oneshot::channel();
        let highest = self.inner.local_store.highest_unacknowledged_batch_id()?;
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            lock(&self.inner.state)
                .pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner.remote_store.enable_network().await
    }

    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner.remote_store.disable_network().await
    }

    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        self.inner.remote_store.handle_credential_change().await
    }

    /// Stops the remote store and ends every listener and pending callback.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.inner.remote_store.shutdown().await?;
        let mut state = lock(&self.inner.state);
        state
            .event_manager
            .fail_all(cancelled("The client has been shut down"));
        for (_, sender) in std::mem::take(&mut state.mutation_callbacks) {
            let _ = sender.send(Err(cancelled("The client has been shut down")));
        }
        for (_, senders) in std::mem::take(&mut state.pending_writes_callbacks) {
            for sender in senders {
                let _ = sender.send(Err(cancelled("The client has been shut down")));
            }
        }
        Ok(())
    }

    pub fn active_limbo_document_keys(&self) -> BTreeSet<DocumentKey> {
        lock(&self.inner.state)
            .active_limbo_targets_by_key
            .keys()
            .cloned()
            .collect()
    }

    pub fn enqueued_limbo_document_keys(&self) -> Vec<DocumentKey> {
        lock(&self.inner.state)
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn syncer(&self) -> &dyn RemoteSyncer {
        &*self.inner
    }
}

impl SyncEngineInner {
    async fn run_effects(&self, effects: Vec<RemoteEffect>) -> SyncResult<()> {
        for effect in effects {
            match effect {
                RemoteEffect::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteEffect::Unlisten(target_id) => self.remote_store.unlisten(target_id)?,
            }
        }
        Ok(())
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> SyncResult<()> {
        let mut effects = Vec::new();
        {
            let mut state = lock(&self.state);
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let touched = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if touched > 1 {
                    return Err(internal_error(format!(
                        "Limbo target {target_id} changed {touched} documents"
                    )));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(format!(
                            "Limbo target {target_id} modified a document it never added"
                        )));
                    }
                } else if !change.removed_documents.is_empty() {
                    resolution.received_document = false;
                }
            }

            let changes = self.local_store.apply_remote_event(&event)?;
            state.emit_new_snapshots(&changes, Some(&event), &self.local_store, &mut effects)?;
        }
        self.run_effects(effects).await
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        let mut effects = Vec::new();
        let limbo_key = {
            let mut state = lock(&self.state);
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    log::debug!(
                        "limbo resolution for {} rejected: {error}",
                        resolution.key
                    );
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    self.local_store.release_target(target_id, false)?;
                    state.pump_enqueued_limbo_resolutions(&self.local_store, &mut effects)?;
                    Some(resolution.key)
                }
                None => {
                    self.local_store.release_target(target_id, true)?;
                    state.remove_and_clean_up_target(target_id, &self.local_store, &mut effects)?;
                    let queries: Vec<Query> = state
                        .query_views
                        .values()
                        .filter(|query_view| query_view.target_id == target_id)
                        .map(|query_view| query_view.query.clone())
                        .collect();
                    for query in queries {
                        state.query_views.remove(&query.canonical_id());
                        state.event_manager.on_watch_error(&query, error.clone());
                    }
                    None
                }
            }
        };
        self.run_effects(effects).await?;

        if let Some(key) = limbo_key {
            // The authority will not tell us about this document, so treat it
            // as deleted. Its version is unknown, which lets any later
            // update win.
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            self.apply_remote_event_internal(event).await?;
        }
        Ok(())
    }

    fn finish_write(
        &self,
        batch_id: BatchId,
        outcome: SyncResult<SnapshotVersion>,
        changes: BTreeMap<DocumentKey, MutableDocument>,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        let mut state = lock(&self.state);
        match state.mutation_callbacks.remove(&batch_id) {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => log::debug!("no write callback registered for batch {batch_id}"),
        }
        let resolved: Vec<BatchId> = state
            .pending_writes_callbacks
            .range(..=batch_id)
            .map(|(id, _)| *id)
            .collect();
        for id in resolved {
            if let Some(senders) = state.pending_writes_callbacks.remove(&id) {
                for sender in senders {
                    let _ = sender.send(Ok(()));
                }
            }
        }
        state.emit_new_snapshots(&changes, None, &self.local_store, effects)
    }
}

impl RemoteSyncer for SyncEngineInner {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: SyncError,
    ) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(async move {
            let batch_id = result.batch().batch_id();
            let mut effects = Vec::new();
            let changes = self.local_store.acknowledge_batch(&result)?;
            self.finish_write(batch_id, Ok(result.commit_version()), changes, &mut effects)?;
            self.run_effects(effects).await
        })
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: SyncError,
    ) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(async move {
            log::warn!("write batch {batch_id} rejected: {error}");
            let mut effects = Vec::new();
            let changes = self.local_store.reject_batch(batch_id)?;
            self.finish_write(batch_id, Err(error), changes, &mut effects)?;
            self.run_effects(effects).await
        })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = lock(&self.state);
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        state
            .queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|canonical_id| state.query_views.get(canonical_id))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect()
    }

    fn handle_credential_change(&self) -> RemoteStoreFuture<'_, SyncResult<()>> {
        box_remote_store_future(async {
            log::debug!("credentials changed; pending writes stay queued");
            Ok(())
        })
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(async move {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            state.event_manager.on_watch_change(&snapshots);
            state.event_manager.on_online_state_change(online_state);
        })
    }
}

impl SyncEngineState {
    fn initialize_query(
        &mut self,
        query: &Query,
        listen_to_remote: bool,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<ViewSnapshot> {
        let target_data = local_store.allocate_target(query.to_target())?;
        let snapshot = self.initialize_view(query, &target_data, local_store, effects)?;
        if listen_to_remote {
            effects.push(RemoteEffect::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view(
        &mut self,
        query: &Query,
        target_data: &TargetData,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<ViewSnapshot> {
        let target_id = target_data.target_id;
        let result = local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized =
            TargetChange::create_synthesized_target_change(false, target_data.resume_token.clone());
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, view_change.limbo_changes, local_store, effects)?;
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce an initial snapshot"))?;

        let canonical_id = query.canonical_id();
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(canonical_id.clone());
        self.query_views.insert(
            canonical_id,
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    fn remove_query(
        &mut self,
        query: &Query,
        unlisten_remote: bool,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views.remove(&canonical_id) else {
            log::debug!("unlisten of unknown query {canonical_id}");
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|id| id != &canonical_id);
            if !queries.is_empty() {
                return Ok(());
            }
        }
        local_store.release_target(target_id, true)?;
        if unlisten_remote {
            effects.push(RemoteEffect::Unlisten(target_id));
        }
        self.remove_and_clean_up_target(target_id, local_store, effects)
    }

    fn remove_and_clean_up_target(
        &mut self,
        target_id: TargetId,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        self.queries_by_target.remove(&target_id);
        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, local_store, effects)?;
            }
        }
        Ok(())
    }

    /// Recomputes every view against `changes` and hands the resulting
    /// snapshots to the listeners.
    fn emit_new_snapshots(
        &mut self,
        changes: &BTreeMap<DocumentKey, MutableDocument>,
        remote_event: Option<&RemoteEvent>,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views.values_mut() {
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let result = local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event
                .is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
            limbo_updates.push((target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes, local_store, effects)?;
        }
        self.event_manager.on_watch_change(&snapshots);
        local_store.notify_local_view_changes(&view_changes)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, local_store, effects)?;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, local_store, effects)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn track_limbo_change(
        &mut self,
        key: DocumentKey,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        if !self.active_limbo_targets_by_key.contains_key(&key)
            && !self.enqueued_limbo_resolutions.contains(&key)
        {
            log::debug!("document {key} entered limbo");
            self.enqueued_limbo_resolutions.push_back(key);
        }
        self.pump_enqueued_limbo_resolutions(local_store, effects)
    }

    /// Starts listens for queued limbo documents, oldest first, while fewer
    /// than the configured maximum are active.
    fn pump_enqueued_limbo_resolutions(
        &mut self,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_ids.next();
            let target_data = local_store.allocate_limbo_target(Target::for_document(&key), target_id)?;
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key, target_id);
            effects.push(RemoteEffect::Listen(target_data));
        }
        Ok(())
    }

    fn remove_limbo_target(
        &mut self,
        key: &DocumentKey,
        local_store: &LocalStore,
        effects: &mut Vec<RemoteEffect>,
    ) -> SyncResult<()> {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return Ok(());
        };
        self.active_limbo_resolutions_by_target.remove(&target_id);
        effects.push(RemoteEffect::Unlisten(target_id));
        local_store.release_target(target_id, false)?;
        self.pump_enqueued_limbo_resolutions(local_store, effects)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}
