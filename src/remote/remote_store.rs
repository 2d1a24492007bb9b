use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::core::OnlineState;
use crate::error::{internal_error, SyncError, SyncResult};
use crate::local::{LocalStore, TargetData};
use crate::model::{
    BatchId, DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult,
    SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::platform::runtime;
use crate::remote::datastore::{StreamingDatastore, TokenProviderArc};
use crate::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_syncer::{box_remote_store_future, RemoteSyncer};
use crate::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::remote::serializer::JsonSerializer;
use crate::remote::streams::{ListenStream, ListenStreamDelegate, WriteStream, WriteStreamDelegate};
use crate::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::settings::SyncSettings;
use crate::util::{lock, AsyncQueue};

/// Reasons the remote store keeps its streams down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    PersistenceFailure,
    Shutdown,
}

/// Work handed to the synchronization engine. When local storage fails it
/// transiently, the work is replayed until it goes through.
#[derive(Clone, Debug)]
enum SyncerWork {
    RemoteEvent(RemoteEvent),
    RejectListen(TargetId, SyncError),
    AcknowledgeBatch(MutationBatchResult),
    RejectBatch(BatchId, SyncError),
}

struct RemoteStoreState {
    /// Every target the engine listens to, keyed by id. Survives stream
    /// restarts and is re-sent whenever the listen stream opens.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Only present while the listen stream is started.
    aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Answers the aggregator's questions from the listen targets and the
/// synchronization engine.
struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<Arc<dyn RemoteSyncer>>,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        match &self.syncer {
            Some(syncer) => syncer.get_remote_keys_for_target(target_id),
            None => BTreeSet::new(),
        }
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

/// Owns the listen and write streams and translates between them and the
/// synchronization engine.
///
/// Listen targets are kept across reconnects, and pending writes are
/// pipelined onto the write stream up to a configured number of batches.
/// Every method must run on the serial queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    this: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    syncer: Weak<dyn RemoteSyncer>,
    serializer: Arc<JsonSerializer>,
    max_pending_writes: usize,
    listen_stream: ListenStream<RemoteStoreInner>,
    write_stream: WriteStream<RemoteStoreInner>,
    online_state_tracker: OnlineStateTracker,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        settings: &SyncSettings,
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        syncer: Weak<dyn RemoteSyncer>,
    ) -> Self {
        let serializer = Arc::new(JsonSerializer::new(settings.database_id.clone()));
        let state_syncer = syncer.clone();
        let handler: OnlineStateHandler = Arc::new(move |online_state| {
            let syncer = state_syncer.clone();
            box_remote_store_future(async move {
                if let Some(syncer) = syncer.upgrade() {
                    syncer.apply_online_state_change(online_state).await;
                }
            })
        });
        let online_state_tracker = OnlineStateTracker::new(
            queue.clone(),
            settings.streams.online_state_timeout,
            handler,
        );

        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| RemoteStoreInner {
            this: weak.clone(),
            queue: queue.clone(),
            local_store,
            syncer,
            serializer: Arc::clone(&serializer),
            max_pending_writes: settings.streams.max_pending_writes.max(1),
            listen_stream: ListenStream::new(
                queue.clone(),
                Arc::clone(&datastore),
                Arc::clone(&token_provider),
                Arc::clone(&serializer),
                weak.clone(),
                settings.backoff.clone(),
                settings.streams.idle_timeout,
            ),
            write_stream: WriteStream::new(
                queue,
                datastore,
                token_provider,
                Arc::clone(&serializer),
                weak.clone(),
                settings.backoff.clone(),
                settings.streams.idle_timeout,
            ),
            online_state_tracker,
            state: Mutex::new(RemoteStoreState {
                listen_targets: BTreeMap::new(),
                aggregator: None,
                write_pipeline: VecDeque::new(),
                offline_causes: BTreeSet::new(),
            }),
        });
        Self { inner }
    }

    /// Brings the streams up for the first time.
    pub async fn start(&self) -> SyncResult<()> {
        self.inner.enable_network_internal().await
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        lock(&self.inner.state)
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and reports the client offline. Listen targets
    /// are kept and pending writes stay queued locally.
    pub async fn disable_network(&self) -> SyncResult<()> {
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal();
        self.inner.online_state_tracker.set(OnlineState::Offline).await;
        Ok(())
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        log::debug!("remote store shutting down");
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal();
        self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        Ok(())
    }

    /// Restarts the streams so they reconnect with the new credentials.
    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        if !self.can_use_network() {
            return self.syncer()?.handle_credential_change().await;
        }
        log::debug!("remote store restarting streams for new credentials");
        lock(&self.inner.state)
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal();
        self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        self.syncer()?.handle_credential_change().await?;
        lock(&self.inner.state)
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await
    }

    /// Starts listening to a target. A target that is already listened to
    /// is ignored.
    pub async fn listen(&self, target_data: TargetData) -> SyncResult<()> {
        let target_id = target_data.target_id;
        {
            let mut state = lock(&self.inner.state);
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
        }

        if self.inner.should_start_listen_stream() {
            self.inner.start_listen_stream().await;
        } else if self.inner.listen_stream.is_open() {
            self.inner.send_watch_request(target_data)?;
        }
        Ok(())
    }

    pub fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        let remaining = {
            let mut state = lock(&self.inner.state);
            if state.listen_targets.remove(&target_id).is_none() {
                log::debug!("unlisten of unknown target {target_id}");
                return Ok(());
            }
            state.listen_targets.len()
        };

        if self.inner.listen_stream.is_open() {
            self.inner.send_unwatch_request(target_id)?;
        }
        if remaining == 0 && !self.inner.listen_stream.is_open() && self.can_use_network() {
            self.inner.clean_up_listen_stream_state();
        }
        Ok(())
    }

    /// Moves pending batches from the local mutation queue onto the write
    /// stream.
    pub async fn fill_write_pipeline(&self) -> SyncResult<()> {
        self.inner.fill_write_pipeline().await
    }

    pub fn can_use_network(&self) -> bool {
        self.inner.can_use_network()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        lock(&self.inner.state).listen_targets.keys().copied().collect()
    }

    pub fn pending_write_count(&self) -> usize {
        lock(&self.inner.state).write_pipeline.len()
    }

    fn syncer(&self) -> SyncResult<Arc<dyn RemoteSyncer>> {
        self.inner.syncer()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> SyncResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .upgrade()
            .ok_or_else(|| internal_error("synchronization engine is gone"))
    }

    fn can_use_network(&self) -> bool {
        lock(&self.state).offline_causes.is_empty()
    }

    async fn enable_network_internal(&self) -> SyncResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_listen_stream() {
            self.start_listen_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    fn disable_network_internal(&self) {
        self.write_stream.stop();
        self.listen_stream.stop();
        let dropped = {
            let mut state = lock(&self.state);
            let dropped = state.write_pipeline.len();
            state.write_pipeline.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("dropping {dropped} pipelined batches while offline");
        }
        self.clean_up_listen_stream_state();
    }

    fn should_start_listen_stream(&self) -> bool {
        let state = lock(&self.state);
        state.offline_causes.is_empty()
            && !self.listen_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    async fn start_listen_stream(&self) {
        lock(&self.state).aggregator = Some(WatchChangeAggregator::new());
        self.listen_stream.start();
        self.online_state_tracker.handle_stream_start().await;
    }

    fn clean_up_listen_stream_state(&self) {
        lock(&self.state).aggregator = None;
    }

    fn send_watch_request(&self, target_data: TargetData) -> SyncResult<()> {
        let target_id = target_data.target_id;
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let request = if resuming {
            let expected = match self.syncer.upgrade() {
                Some(syncer) => syncer.get_remote_keys_for_target(target_id).len() as i32,
                None => 0,
            };
            target_data.with_expected_count(expected)
        } else {
            target_data
        };
        if let Some(aggregator) = lock(&self.state).aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.listen_stream.watch(&request)
    }

    fn send_unwatch_request(&self, target_id: TargetId) -> SyncResult<()> {
        if let Some(aggregator) = lock(&self.state).aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.listen_stream.unwatch(target_id)
    }

    /// Runs `action` against the aggregator with metadata drawn from the
    /// current listen targets. Does nothing while no aggregator exists.
    fn with_aggregator<R>(
        &self,
        action: impl FnOnce(&mut WatchChangeAggregator, &ListenMetadata<'_>) -> R,
    ) -> Option<R> {
        let syncer = self.syncer.upgrade();
        let mut guard = lock(&self.state);
        let RemoteStoreState {
            listen_targets,
            aggregator,
            ..
        } = &mut *guard;
        let aggregator = aggregator.as_mut()?;
        let metadata = ListenMetadata {
            listen_targets,
            syncer,
            database_id: self.serializer.database_id(),
        };
        Some(action(aggregator, &metadata))
    }

    async fn handle_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()> {
        self.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    return self.handle_target_error(&target_change.target_ids, cause).await;
                }
            }
        }

        self.with_aggregator(|aggregator, metadata| match change {
            WatchChange::Document(change) => aggregator.handle_document_change(change, metadata),
            WatchChange::TargetChange(change) => aggregator.handle_target_change(&change, metadata),
            WatchChange::ExistenceFilter(change) => {
                aggregator.handle_existence_filter(&change, metadata)
            }
        });

        if !snapshot_version.is_min() {
            let last_remote_version = self.local_store.last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Turns everything aggregated so far into a remote event, re-listens to
    /// targets whose existence filter did not match and hands the event to
    /// the synchronization engine. Resume tokens advance only once the event
    /// is applied locally.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> SyncResult<()> {
        let Some(event) =
            self.with_aggregator(|aggregator, metadata| aggregator.create_remote_event(snapshot_version, metadata))
        else {
            return Ok(());
        };

        let mut resends = Vec::new();
        {
            let mut state = lock(&self.state);
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.get_mut(target_id) else {
                    continue;
                };
                // The resume token can no longer be trusted; the fresh
                // listen must return the full result set.
                *target_data = target_data.with_resume_token(Vec::new(), SnapshotVersion::min());
                let mut request = TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                );
                request.last_limbo_free_snapshot_version = target_data.last_limbo_free_snapshot_version;
                resends.push(request);
            }
        }
        for request in resends {
            log::debug!("re-listening to target {} after a filter mismatch", request.target_id);
            self.send_unwatch_request(request.target_id)?;
            self.send_watch_request(request)?;
        }

        self.apply_or_recover(SyncerWork::RemoteEvent(event)).await
    }

    fn record_resume_tokens(&self, event: &RemoteEvent) {
        let mut state = lock(&self.state);
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() || event.target_mismatches.contains_key(target_id) {
                continue;
            }
            if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                *target_data =
                    target_data.with_resume_token(change.resume_token.clone(), event.snapshot_version);
            }
        }
    }

    async fn apply_syncer_work(&self, work: SyncerWork) -> SyncResult<()> {
        let syncer = self.syncer()?;
        match work {
            SyncerWork::RemoteEvent(event) => {
                syncer.apply_remote_event(event.clone()).await?;
                self.record_resume_tokens(&event);
                Ok(())
            }
            SyncerWork::RejectListen(target_id, error) => syncer.reject_listen(target_id, error).await,
            SyncerWork::AcknowledgeBatch(result) => syncer.apply_successful_write(result).await,
            SyncerWork::RejectBatch(batch_id, error) => {
                syncer.reject_failed_write(batch_id, error).await
            }
        }
    }

    /// Applies `work`, or, when local storage fails transiently, takes the
    /// network down and replays the work on the serial queue with backoff.
    /// The streams come back once the replay finished.
    async fn apply_or_recover(&self, work: SyncerWork) -> SyncResult<()> {
        let error = match self.apply_syncer_work(work.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient_persistence_error() => err,
            Err(err) => return Err(err),
        };
        log::warn!("local storage failed, going offline until it recovers: {error}");
        lock(&self.state)
            .offline_causes
            .insert(OfflineCause::PersistenceFailure);
        self.disable_network_internal();
        self.online_state_tracker.set(OnlineState::Unknown).await;

        let this = self.this.clone();
        let replay = self.queue.enqueue_retryable(move || {
            let this = this.clone();
            let work = work.clone();
            async move {
                match this.upgrade() {
                    Some(inner) => inner.apply_syncer_work(work).await,
                    None => Ok(()),
                }
            }
        });
        let this = self.this.clone();
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            if let Err(err) = replay.await {
                log::warn!("dropping remote changes after repeated storage failures: {err}");
            }
            let resumed = queue
                .enqueue(move || async move {
                    match this.upgrade() {
                        Some(inner) => inner.resume_after_recovery().await,
                        None => Ok(()),
                    }
                })
                .await;
            if let Err(err) = resumed {
                log::warn!("failed to restart the network after storage recovered: {err}");
            }
        });
        Ok(())
    }

    async fn resume_after_recovery(&self) -> SyncResult<()> {
        lock(&self.state)
            .offline_causes
            .remove(&OfflineCause::PersistenceFailure);
        log::debug!("local storage recovered; restarting the network");
        self.enable_network_internal().await
    }

    async fn handle_target_error(&self, target_ids: &[TargetId], cause: &SyncError) -> SyncResult<()> {
        for target_id in target_ids {
            let removed = {
                let mut state = lock(&self.state);
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if removed {
                log::warn!("listen to target {target_id} rejected: {cause}");
                self.apply_or_recover(SyncerWork::RejectListen(*target_id, cause.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_watch_close(&self, error: Option<SyncError>) {
        self.clean_up_listen_stream_state();
        if self.should_start_listen_stream() {
            if let Some(err) = &error {
                self.online_state_tracker.handle_stream_failure(err).await;
            }
            self.start_listen_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = lock(&self.state);
        state.offline_causes.is_empty() && state.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self) -> bool {
        let state = lock(&self.state);
        state.offline_causes.is_empty()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn fill_write_pipeline(&self) -> SyncResult<()> {
        let mut last_batch_id = lock(&self.state)
            .write_pipeline
            .back()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = self.local_store.next_mutation_batch(last_batch_id)? else {
                break;
            };
            last_batch_id = batch.batch_id();
            self.add_to_write_pipeline(batch)?;
        }
        if self.should_start_write_stream() {
            self.start_write_stream().await;
        }
        Ok(())
    }

    async fn start_write_stream(&self) {
        self.write_stream.start();
        self.online_state_tracker.handle_stream_start().await;
    }

    fn add_to_write_pipeline(&self, batch: MutationBatch) -> SyncResult<()> {
        let mutations = batch.mutations().to_vec();
        lock(&self.state).write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations)?;
        }
        Ok(())
    }

    fn handle_write_open(&self) -> SyncResult<()> {
        self.write_stream.set_last_stream_token(self.local_store.last_stream_token()?);
        self.write_stream.write_handshake()
    }

    async fn handle_handshake_complete(&self) -> SyncResult<()> {
        self.online_state_tracker.set(OnlineState::Online).await;
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())?;
        let pending: Vec<_> = lock(&self.state)
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations().to_vec())
            .collect();
        for mutations in pending {
            self.write_stream.write_mutations(&mutations)?;
        }
        Ok(())
    }

    async fn handle_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()> {
        self.online_state_tracker.set(OnlineState::Online).await;
        let batch = lock(&self.state)
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("write acknowledgement without a pending batch"))?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        self.apply_or_recover(SyncerWork::AcknowledgeBatch(result)).await?;
        self.fill_write_pipeline().await
    }

    async fn handle_write_close(&self, error: Option<SyncError>) {
        if let Some(err) = &error {
            let pipeline_empty = lock(&self.state).write_pipeline.is_empty();
            if !pipeline_empty {
                if !is_permanent_error(err.code) {
                    self.online_state_tracker.handle_stream_failure(err).await;
                }
                let outcome = if self.write_stream.handshake_complete() {
                    self.handle_write_error(err).await
                } else {
                    self.handle_handshake_error(err)
                };
                if let Err(handling_err) = outcome {
                    log::warn!("failed to handle write stream error: {handling_err}");
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream().await;
        }
    }

    fn handle_handshake_error(&self, error: &SyncError) -> SyncResult<()> {
        if is_permanent_error(error.code) {
            log::debug!("write handshake failed permanently, dropping stream token: {error}");
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    /// A permanent failure rejects the oldest batch; anything else is
    /// retried when the stream restarts.
    async fn handle_write_error(&self, error: &SyncError) -> SyncResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = lock(&self.state).write_pipeline.pop_front() else {
            return Ok(());
        };
        log::warn!("batch {} rejected by the remote authority: {error}", batch.batch_id());
        self.write_stream.inhibit_backoff();
        self.apply_or_recover(SyncerWork::RejectBatch(batch.batch_id(), error.clone()))
            .await?;
        self.fill_write_pipeline().await
    }
}

#[async_trait]
impl ListenStreamDelegate for RemoteStoreInner {
    async fn on_watch_open(&self) -> SyncResult<()> {
        let targets: Vec<TargetData> = lock(&self.state).listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data)?;
        }
        Ok(())
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()> {
        self.handle_watch_change(change, snapshot_version).await
    }

    async fn on_watch_close(&self, error: Option<SyncError>) {
        self.handle_watch_close(error).await;
    }
}

#[async_trait]
impl WriteStreamDelegate for RemoteStoreInner {
    async fn on_write_open(&self) -> SyncResult<()> {
        self.handle_write_open()
    }

    async fn on_handshake_complete(&self) -> SyncResult<()> {
        self.handle_handshake_complete().await
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()> {
        self.handle_mutation_result(commit_version, results).await
    }

    async fn on_write_close(&self, error: Option<SyncError>) {
        self.handle_write_close(error).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::Query;
    use crate::local::{Persistence, TargetPurpose};
    use crate::model::{BatchId, Mutation};
    use crate::platform::runtime;
    use crate::remote::datastore::{NoopTokenProvider, StreamingDatastoreImpl};
    use crate::error::{aborted, unavailable};
    use crate::remote::remote_syncer::RemoteStoreFuture;
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamKind};
    use crate::remote::watch_change::{encode_watch_change, WatchTargetChange};
    use serde_json::{json, Value as JsonValue};

    #[derive(Default)]
    struct TestSyncer {
        events: Mutex<Vec<RemoteEvent>>,
        acknowledged: Mutex<Vec<BatchId>>,
        rejected_writes: Mutex<Vec<BatchId>>,
        rejected_listens: Mutex<Vec<TargetId>>,
        online_states: Mutex<Vec<OnlineState>>,
        event_failures: Mutex<Vec<SyncError>>,
    }

    impl RemoteSyncer for TestSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, SyncResult<()>> {
            if let Some(err) = self.event_failures.lock().unwrap().pop() {
                return box_remote_store_future(async move { Err(err) });
            }
            self.events.lock().unwrap().push(event);
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_listen(
            &self,
            target_id: TargetId,
            _error: SyncError,
        ) -> RemoteStoreFuture<'_, SyncResult<()>> {
            self.rejected_listens.lock().unwrap().push(target_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, SyncResult<()>> {
            self.acknowledged.lock().unwrap().push(result.batch().batch_id());
            box_remote_store_future(async { Ok(()) })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            _error: SyncError,
        ) -> RemoteStoreFuture<'_, SyncResult<()>> {
            self.rejected_writes.lock().unwrap().push(batch_id);
            box_remote_store_future(async { Ok(()) })
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }

        fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
            self.online_states.lock().unwrap().push(online_state);
            box_remote_store_future(async {})
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        store: RemoteStore,
        syncer: Arc<TestSyncer>,
        local_store: Arc<LocalStore>,
        server: MultiplexedConnection,
    }

    fn fixture() -> Fixture {
        let (left, right) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::client(left));
        let server = MultiplexedConnection::server(right);
        let queue = AsyncQueue::new();
        let settings = SyncSettings::new(DatabaseId::for_project("demo"));
        let local_store = Arc::new(LocalStore::new(Arc::new(Persistence::memory()), &settings));
        let syncer = Arc::new(TestSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        let store = RemoteStore::new(
            &settings,
            queue.clone(),
            Arc::clone(&local_store),
            Arc::new(StreamingDatastoreImpl::new(client)),
            Arc::new(NoopTokenProvider),
            weak,
        );
        Fixture {
            queue,
            store,
            syncer,
            local_store,
            server,
        }
    }

    async fn run<F, Fut>(queue: &AsyncQueue, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SyncResult<()>> + Send + 'static,
    {
        queue.enqueue(op).await.expect("queue operation");
    }

    async fn next_json(peer: &MultiplexedStream) -> JsonValue {
        let payload = peer.next().await.expect("frame").expect("payload");
        serde_json::from_slice(&payload).expect("json")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn send_current_snapshot(peer: &MultiplexedStream, target_id: TargetId, micros: i64) {
        let serializer = JsonSerializer::new(DatabaseId::for_project("demo"));
        let changes = [
            (
                WatchChange::TargetChange(WatchTargetChange::new(
                    WatchTargetChangeState::Added,
                    vec![target_id],
                )),
                None,
            ),
            (
                WatchChange::TargetChange(WatchTargetChange::new(
                    WatchTargetChangeState::Current,
                    vec![target_id],
                )
                .with_resume_token(b"r1".to_vec())),
                None,
            ),
            (
                WatchChange::TargetChange(WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![])),
                Some(SnapshotVersion::from_micros(micros)),
            ),
        ];
        for (change, read_time) in changes {
            let message = encode_watch_change(&serializer, &change, read_time);
            peer.send(serde_json::to_vec(&message).expect("encode"))
                .await
                .expect("send");
        }
    }

    async fn complete_write_handshake(fixture: &Fixture) -> MultiplexedStream {
        let key = DocumentKey::from_string("rooms/a").expect("key");
        fixture
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .expect("write");
        let store = fixture.store.clone();
        run(&fixture.queue, move || async move { store.start().await }).await;
        let (request, peer) = fixture.server.accept_stream().await.expect("accept");
        assert_eq!(request.kind, StreamKind::Write);
        next_json(&peer).await;
        peer.send(br#"{"streamToken":"dDE="}"#.to_vec()).await.expect("handshake");
        next_json(&peer).await;
        peer
    }

    fn target_data(target_id: TargetId) -> TargetData {
        let target = Query::collection("rooms").expect("query").to_target();
        TargetData::new(target, target_id, TargetPurpose::Listen, 1)
    }

    #[tokio::test]
    async fn listen_opens_stream_and_raises_snapshot() {
        let fixture = fixture();
        let store = fixture.store.clone();
        run(&fixture.queue, move || async move {
            store.start().await?;
            store.listen(target_data(2)).await
        })
        .await;

        let (request, peer) = fixture.server.accept_stream().await.expect("accept");
        assert_eq!(request.kind, StreamKind::Listen);
        let add = next_json(&peer).await;
        assert_eq!(add["addTarget"]["targetId"], json!(2));

        let serializer = JsonSerializer::new(DatabaseId::for_project("demo"));
        let changes = [
            (
                WatchChange::TargetChange(WatchTargetChange::new(WatchTargetChangeState::Added, vec![2])),
                None,
            ),
            (
                WatchChange::TargetChange(
                    WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                        .with_resume_token(b"r1".to_vec()),
                ),
                None,
            ),
            (
                WatchChange::TargetChange(WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![])),
                Some(SnapshotVersion::from_micros(1_000_000)),
            ),
        ];
        for (change, read_time) in changes {
            let message = encode_watch_change(&serializer, &change, read_time);
            peer.send(serde_json::to_vec(&message).expect("encode"))
                .await
                .expect("send");
        }

        let syncer = Arc::clone(&fixture.syncer);
        eventually(|| !syncer.events.lock().unwrap().is_empty()).await;
        let events = fixture.syncer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let change = events[0].target_changes.get(&2).expect("target change");
        assert!(change.current);
        assert_eq!(change.resume_token, b"r1".to_vec());
        assert_eq!(fixture.store.online_state(), OnlineState::Online);
    }

    #[tokio::test]
    async fn removed_target_with_cause_rejects_listen() {
        let fixture = fixture();
        let store = fixture.store.clone();
        run(&fixture.queue, move || async move {
            store.start().await?;
            store.listen(target_data(4)).await
        })
        .await;
        let (_, peer) = fixture.server.accept_stream().await.expect("accept");
        next_json(&peer).await;

        let serializer = JsonSerializer::new(DatabaseId::for_project("demo"));
        let change = WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::Removed, vec![4])
                .with_cause(crate::error::permission_denied("denied")),
        );
        let message = encode_watch_change(&serializer, &change, None);
        peer.send(serde_json::to_vec(&message).expect("encode"))
            .await
            .expect("send");

        let syncer = Arc::clone(&fixture.syncer);
        eventually(|| !syncer.rejected_listens.lock().unwrap().is_empty()).await;
        assert_eq!(fixture.syncer.rejected_listens.lock().unwrap().clone(), vec![4]);
        assert!(fixture.store.listen_target_ids().is_empty());
    }

    #[tokio::test]
    async fn pending_writes_flow_through_handshake_and_ack() {
        let fixture = fixture();
        let key = DocumentKey::from_string("rooms/a").expect("key");
        let batch_id = fixture
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .expect("write")
            .batch_id;

        let store = fixture.store.clone();
        run(&fixture.queue, move || async move { store.start().await }).await;
        let (request, peer) = fixture.server.accept_stream().await.expect("accept");
        assert_eq!(request.kind, StreamKind::Write);

        let handshake = next_json(&peer).await;
        assert!(handshake.get("database").is_some());
        peer.send(br#"{"streamToken":"dDE="}"#.to_vec()).await.expect("handshake");

        let write = next_json(&peer).await;
        assert_eq!(write["writes"].as_array().map(Vec::len), Some(1));
        peer.send(
            serde_json::to_vec(&json!({
                "streamToken": "dDI=",
                "commitTime": "1970-01-01T00:00:03Z",
                "writeResults": [{}],
            }))
            .expect("encode"),
        )
        .await
        .expect("ack");

        let syncer = Arc::clone(&fixture.syncer);
        eventually(|| !syncer.acknowledged.lock().unwrap().is_empty()).await;
        assert_eq!(fixture.syncer.acknowledged.lock().unwrap().clone(), vec![batch_id]);
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_batch() {
        let fixture = fixture();
        let key = DocumentKey::from_string("rooms/a").expect("key");
        let batch_id = fixture
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .expect("write")
            .batch_id;

        let store = fixture.store.clone();
        run(&fixture.queue, move || async move { store.start().await }).await;
        let (_, peer) = fixture.server.accept_stream().await.expect("accept");
        next_json(&peer).await;
        peer.send(br#"{"streamToken":"dDE="}"#.to_vec()).await.expect("handshake");
        next_json(&peer).await;
        peer.fail(crate::error::failed_precondition("stale"))
            .await
            .expect("fail");

        let syncer = Arc::clone(&fixture.syncer);
        eventually(|| !syncer.rejected_writes.lock().unwrap().is_empty()).await;
        assert_eq!(fixture.syncer.rejected_writes.lock().unwrap().clone(), vec![batch_id]);
    }

    #[tokio::test]
    async fn disable_network_reports_offline() {
        let fixture = fixture();
        let store = fixture.store.clone();
        run(&fixture.queue, move || async move {
            store.start().await?;
            store.disable_network().await
        })
        .await;
        assert_eq!(fixture.store.online_state(), OnlineState::Offline);
        assert!(!fixture.store.can_use_network());
        assert_eq!(
            fixture.syncer.online_states.lock().unwrap().last().copied(),
            Some(OnlineState::Offline)
        );
    }

    #[tokio::test]
    async fn write_handshake_brings_the_client_online() {
        let fixture = fixture();
        let _peer = complete_write_handshake(&fixture).await;

        let store = fixture.store.clone();
        eventually(|| store.online_state() == OnlineState::Online).await;
        assert_eq!(fixture.store.online_state(), OnlineState::Online);
        assert!(!fixture
            .queue
            .contains_delayed_operation(crate::util::TimerId::OnlineStateTimeout));
        assert_eq!(
            fixture.syncer.online_states.lock().unwrap().clone(),
            vec![OnlineState::Online]
        );
    }

    #[tokio::test]
    async fn write_stream_failure_takes_an_online_client_offline() {
        let fixture = fixture();
        let peer = complete_write_handshake(&fixture).await;
        let store = fixture.store.clone();
        eventually(|| store.online_state() == OnlineState::Online).await;

        peer.fail(unavailable("connection reset")).await.expect("fail");

        let store = fixture.store.clone();
        eventually(|| store.online_state() == OnlineState::Offline).await;
        assert_eq!(fixture.store.online_state(), OnlineState::Offline);
        assert!(fixture.syncer.rejected_writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_replays_the_event_and_reconnects() {
        let fixture = fixture();
        fixture
            .syncer
            .event_failures
            .lock()
            .unwrap()
            .push(aborted("quota exceeded"));
        let store = fixture.store.clone();
        run(&fixture.queue, move || async move {
            store.start().await?;
            store.listen(target_data(2)).await
        })
        .await;
        let (_, peer) = fixture.server.accept_stream().await.expect("accept");
        next_json(&peer).await;
        send_current_snapshot(&peer, 2, 1_000_000).await;

        let (request, resumed) = fixture.server.accept_stream().await.expect("reconnect");
        assert_eq!(request.kind, StreamKind::Listen);
        let add = next_json(&resumed).await;
        assert_eq!(add["addTarget"]["targetId"], json!(2));
        assert!(add["addTarget"].get("resumeToken").is_some());

        let events = fixture.syncer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].target_changes.get(&2).map(|change| change.resume_token.clone()),
            Some(b"r1".to_vec())
        );
        assert!(fixture.store.can_use_network());
    }
}
