use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::core::{Query, Target};
use crate::error::{not_found, SyncResult};
use crate::local::local_documents_view;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::local::query_engine::QueryEngine;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, DocumentKey, FieldIndex, FieldMask, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, Timestamp,
};
use crate::remote::{RemoteEvent, TargetChange};
use crate::settings::SyncSettings;
use crate::util::lock;

/// Resume tokens are persisted at least this often even when nothing else
/// about the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MutableDocument>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Keys the server last reported as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents a view started or stopped showing, used to pin them against
/// garbage collection.
#[derive(Clone, Debug, Default)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, BTreeSet<TargetId>>,
    local_view_references: ReferenceSet,
}

impl LocalStoreState {
    fn active_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())?
            .iter()
            .filter_map(|id| self.target_data_by_target.get(id))
            .find(|data| &data.target == target)
    }

    fn activate(&mut self, data: TargetData) {
        self.target_ids_by_canonical_id
            .entry(data.target.canonical_id())
            .or_default()
            .insert(data.target_id);
        self.target_data_by_target.insert(data.target_id, data);
    }

    fn deactivate(&mut self, target_id: TargetId) -> Option<TargetData> {
        let data = self.target_data_by_target.remove(&target_id)?;
        let canonical_id = data.target.canonical_id();
        if let Some(ids) = self.target_ids_by_canonical_id.get_mut(&canonical_id) {
            ids.remove(&target_id);
            if ids.is_empty() {
                self.target_ids_by_canonical_id.remove(&canonical_id);
            }
        }
        Some(data)
    }
}

/// Local half of the sync engine: owns the persisted cache and turns writes,
/// remote events and queries into consistent local views.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    garbage_collector: LruGarbageCollector,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, settings: &SyncSettings) -> Self {
        Self {
            persistence,
            garbage_collector: LruGarbageCollector::new(settings.lru.clone()),
            state: Mutex::new(LocalStoreState {
                query_engine: QueryEngine::new(settings.index_auto_creation.clone()),
                target_data_by_target: BTreeMap::new(),
                target_ids_by_canonical_id: BTreeMap::new(),
                local_view_references: ReferenceSet::default(),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// Queues `mutations` as one batch and returns the resulting local view
    /// of every affected document.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult> {
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let local_write_time = Timestamp::now();
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote_documents = txn.remote_documents().get_all(keys.iter());
                let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .values()
                    .filter(|doc| !doc.is_valid_document())
                    .map(|doc| doc.key().clone())
                    .collect();
                let mut overlayed =
                    local_documents_view::get_overlayed_documents(txn, remote_documents);

                // Transforms replay against the values they were first applied to.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(entry) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&entry.document) {
                        let mask: FieldMask = base_value.field_mask();
                        base_mutations.push(Mutation::patch(mutation.key().clone(), base_value, mask));
                    }
                }

                let batch = txn.mutation_queue_mut()?.add_mutation_batch(
                    local_write_time,
                    base_mutations,
                    mutations,
                );
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                txn.overlays_mut()?.save_overlays(
                    batch.batch_id(),
                    overlays.into_iter().map(|(k, m)| (k, Some(m))).collect(),
                );
                for key in &keys {
                    txn.indexes_mut()?
                        .add_to_collection_parent_index(&key.collection_path());
                }
                log::debug!("wrote batch {} touching {} documents", batch.batch_id(), keys.len());
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id(),
                    changes: overlayed
                        .into_iter()
                        .map(|(key, entry)| (key, entry.document))
                        .collect(),
                })
            })
    }

    /// Applies an acknowledged batch to the remote cache and drops it from
    /// the queue. Returns the new local view of its documents.
    pub fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWrite, |txn| {
                let batch = batch_result.batch();
                let affected = batch.keys();
                apply_write_to_remote_document_cache(txn, batch_result)?;
                txn.mutation_queue_mut()?.set_last_stream_token(batch_result.stream_token().to_vec());
                remove_batch(txn, batch)?;
                Ok(local_documents_view::get_documents(txn, affected.iter()))
            })
    }

    /// Drops a batch the server refused. Returns the local view of its
    /// documents without it.
    pub fn reject_batch(&self, batch_id: BatchId) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWrite, |txn| {
                let batch = txn
                    .mutation_queue()
                    .lookup(batch_id)
                    .cloned()
                    .ok_or_else(|| not_found(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                remove_batch(txn, &batch)?;
                Ok(local_documents_view::get_documents(txn, affected.iter()))
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> SyncResult<BatchId> {
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                Ok(txn.mutation_queue().highest_unacknowledged_batch_id())
            })
    }

    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> SyncResult<Option<MutationBatch>> {
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                Ok(txn.mutation_queue().next_batch_after(after_batch_id).cloned())
            })
    }

    pub fn pending_batch_count(&self) -> SyncResult<usize> {
        self.persistence
            .run_transaction("Count pending batches", TransactionMode::ReadOnly, |txn| {
                Ok(txn.mutation_queue().len())
            })
    }

    pub fn last_stream_token(&self) -> SyncResult<Vec<u8>> {
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                Ok(txn.mutation_queue().last_stream_token().to_vec())
            })
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) -> SyncResult<()> {
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWrite, |txn| {
                txn.mutation_queue_mut()?.set_last_stream_token(token);
                Ok(())
            })
    }

    /// Applies a consistent snapshot from the listen stream. Returns the
    /// local view of every document it changed.
    pub fn apply_remote_event(
        &self,
        remote_event: &RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = lock(&self.state);
        let remote_version = remote_event.snapshot_version;
        let (changes, updated_targets) = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWrite,
            |txn| {
                let sequence_number = txn.current_sequence_number();
                let mut updated_targets = Vec::new();
                for (target_id, change) in &remote_event.target_changes {
                    let Some(old) = state.target_data_by_target.get(target_id) else {
                        continue;
                    };
                    let targets = txn.targets_mut()?;
                    targets.remove_matching_keys(change.removed_documents.iter(), *target_id, sequence_number);
                    targets.add_matching_keys(change.added_documents.iter(), *target_id, sequence_number);

                    let mut updated = old.with_sequence_number(sequence_number);
                    if remote_event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(old, &updated, change) {
                        txn.targets_mut()?.update_target_data(updated.clone());
                    }
                    updated_targets.push(updated);
                }

                for key in &remote_event.resolved_limbo_documents {
                    if remote_event.document_updates.contains_key(key) {
                        txn.targets_mut()?.record_document_sequence_number(key, sequence_number);
                    }
                }
                let (changed, existence_changed) =
                    populate_document_changes(txn, &remote_event.document_updates, remote_version)?;

                if !remote_version.is_min() {
                    let last = txn.targets().last_remote_snapshot_version();
                    if remote_version < last {
                        log::warn!("watch sent an older snapshot version {remote_version} than {last}");
                    } else {
                        txn.targets_mut()?.set_last_remote_snapshot_version(remote_version);
                    }
                }
                let changes =
                    local_documents_view::get_local_view_of_documents(txn, changed, &existence_changed)?;
                Ok((changes, updated_targets))
            },
        )?;
        for data in updated_targets {
            state.target_data_by_target.insert(data.target_id, data);
        }
        Ok(changes)
    }

    /// Records which documents views show and advances the limbo-free
    /// version of targets whose views are synced.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> SyncResult<()> {
        let mut state = lock(&self.state);
        self.persistence.run_transaction(
            "Notify local view changes",
            TransactionMode::ReadWrite,
            |txn| {
                let sequence_number = txn.current_sequence_number();
                for change in view_changes {
                    for key in &change.removed_keys {
                        txn.targets_mut()?.record_document_sequence_number(key, sequence_number);
                    }
                }
                Ok(())
            },
        )?;

        for change in view_changes {
            state
                .local_view_references
                .add_references(change.added_keys.iter().cloned(), change.target_id);
            state
                .local_view_references
                .remove_references(change.removed_keys.iter(), change.target_id);
            if !change.from_cache {
                if let Some(data) = state.target_data_by_target.get(&change.target_id) {
                    let updated = data.with_last_limbo_free_snapshot_version(data.snapshot_version);
                    state.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// Returns the cached target data for `target`, allocating a new target
    /// id on first use.
    pub fn allocate_target(&self, target: Target) -> SyncResult<TargetData> {
        let mut state = lock(&self.state);
        if let Some(active) = state.active_target_data(&target) {
            return Ok(active.clone());
        }
        let data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = txn.targets().get_target_data(&target) {
                    return Ok(cached.clone());
                }
                let sequence_number = txn.current_sequence_number();
                let targets = txn.targets_mut()?;
                let target_id = targets.allocate_target_id();
                let data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                targets.add_target_data(data.clone());
                Ok(data)
            })?;
        state.activate(data.clone());
        Ok(data)
    }

    /// Like [`Self::allocate_target`] for a limbo-resolution target, whose
    /// id comes from the sync engine.
    pub fn allocate_limbo_target(&self, target: Target, target_id: TargetId) -> SyncResult<TargetData> {
        let mut state = lock(&self.state);
        let data = self
            .persistence
            .run_transaction("Allocate limbo target", TransactionMode::ReadWrite, |txn| {
                let data = TargetData::new(
                    target,
                    target_id,
                    TargetPurpose::LimboResolution,
                    txn.current_sequence_number(),
                );
                txn.targets_mut()?.add_target_data(data.clone());
                Ok(data)
            })?;
        state.activate(data.clone());
        Ok(data)
    }

    pub fn get_target_data(&self, target: &Target) -> SyncResult<Option<TargetData>> {
        let state = lock(&self.state);
        if let Some(active) = state.active_target_data(target) {
            return Ok(Some(active.clone()));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                Ok(txn.targets().get_target_data(target).cloned())
            })
    }

    pub fn active_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        lock(&self.state).target_data_by_target.get(&target_id).cloned()
    }

    /// Stops tracking `target_id` as active. With `keep_persisted_target_data`
    /// the cached data stays for the garbage collector to age out; limbo
    /// targets pass `false` and are dropped outright.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> SyncResult<()> {
        let mut state = lock(&self.state);
        let Some(data) = state.target_data_by_target.get(&target_id).cloned() else {
            log::debug!("ignoring release of inactive target {target_id}");
            return Ok(());
        };
        let released = state.local_view_references.remove_references_for_id(target_id);
        self.persistence
            .run_transaction("Release target", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.current_sequence_number();
                for key in &released {
                    txn.targets_mut()?.record_document_sequence_number(key, sequence_number);
                }
                if keep_persisted_target_data {
                    txn.targets_mut()?
                        .update_target_data(data.with_sequence_number(sequence_number));
                } else {
                    txn.targets_mut()?.remove_target_data(target_id, sequence_number);
                }
                Ok(())
            })?;
        state.deactivate(target_id);
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// last synced result set seeds the answer.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> SyncResult<QueryResult> {
        let mut state = lock(&self.state);
        let target = query.to_target();
        let active = state.active_target_data(&target).cloned();
        let state = &mut *state;
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target_data = match &active {
                    Some(data) => Some(data.clone()),
                    None => txn.targets().get_target_data(&target).cloned(),
                };
                let remote_keys = target_data
                    .as_ref()
                    .map(|data| txn.targets().get_matching_keys_for_target_id(data.target_id))
                    .unwrap_or_default();
                let last_limbo_free = match (&target_data, use_previous_results) {
                    (Some(data), true) => data.last_limbo_free_snapshot_version,
                    _ => SnapshotVersion::min(),
                };
                let previous_keys = if use_previous_results {
                    remote_keys.clone()
                } else {
                    BTreeSet::new()
                };
                let documents = state.query_engine.get_documents_matching_query(
                    txn,
                    query,
                    last_limbo_free,
                    &previous_keys,
                )?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    /// Local view of one document, with pending writes applied.
    pub fn read_document(&self, key: &DocumentKey) -> SyncResult<MutableDocument> {
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                Ok(local_documents_view::get_document(txn, key))
            })
    }

    pub fn read_documents(&self, keys: &BTreeSet<DocumentKey>) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Read documents", TransactionMode::ReadOnly, |txn| {
                Ok(local_documents_view::get_documents(txn, keys.iter()))
            })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> SyncResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                Ok(txn.targets().get_matching_keys_for_target_id(target_id))
            })
    }

    pub fn last_remote_snapshot_version(&self) -> SyncResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                Ok(txn.targets().last_remote_snapshot_version())
            })
    }

    pub fn collect_garbage(&self) -> SyncResult<LruResults> {
        let state = lock(&self.state);
        let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
        let references = &state.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWrite, |txn| {
                self.garbage_collector
                    .collect(txn, &active, |key| references.contains_key(key))
            })
    }

    pub fn garbage_collector(&self) -> &LruGarbageCollector {
        &self.garbage_collector
    }

    /// Replaces the configured field indexes with `indexes` and backfills
    /// entries for the new ones.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> SyncResult<()> {
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = txn.indexes().field_indexes();
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.same_definition(index)) {
                        txn.indexes_mut()?.delete_field_index(index.index_id());
                    }
                }
                for index in indexes {
                    if existing.iter().any(|current| current.same_definition(&index)) {
                        continue;
                    }
                    let group = index.collection_group().to_string();
                    let documents: Vec<MutableDocument> = txn
                        .remote_documents()
                        .documents()
                        .filter(|doc| doc.key().has_collection_id(&group))
                        .cloned()
                        .collect();
                    let indexes = txn.indexes_mut()?;
                    indexes.add_field_index(index);
                    for document in &documents {
                        indexes.update_index_entries(document);
                    }
                }
                Ok(())
            })
    }

    pub fn field_indexes(&self) -> SyncResult<Vec<FieldIndex>> {
        self.persistence
            .run_transaction("Get field indexes", TransactionMode::ReadOnly, |txn| {
                Ok(txn.indexes().field_indexes())
            })
    }

    pub fn delete_all_field_indexes(&self) -> SyncResult<()> {
        self.configure_field_indexes(Vec::new())
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        lock(&self.state)
            .query_engine
            .set_index_auto_creation_enabled(enabled);
    }
}

fn apply_write_to_remote_document_cache(
    txn: &mut PersistenceTransaction<'_>,
    batch_result: &MutationBatchResult,
) -> SyncResult<()> {
    let batch = batch_result.batch();
    for key in batch.keys() {
        let mut document = txn.remote_documents().get(&key);
        let Some(ack_version) = batch_result.doc_versions().get(&key).copied() else {
            continue;
        };
        if document.version() < ack_version {
            batch.apply_to_remote_document(&mut document, batch_result);
            if document.is_valid_document() {
                txn.put_remote_document(document, batch_result.commit_version())?;
            }
        }
    }
    Ok(())
}

/// Removes `batch` from the queue and rebuilds the overlays of its keys
/// from the batches that remain.
fn remove_batch(txn: &mut PersistenceTransaction<'_>, batch: &MutationBatch) -> SyncResult<()> {
    let affected = batch.keys();
    txn.mutation_queue_mut()?.remove_mutation_batch(batch);
    let sequence_number = txn.current_sequence_number();
    for key in &affected {
        txn.targets_mut()?.record_document_sequence_number(key, sequence_number);
    }
    txn.overlays_mut()?.remove_overlays_for_batch_id(batch.batch_id());
    local_documents_view::recalculate_and_save_overlays_for_document_keys(txn, &affected)
}

/// Writes newer remote documents to the cache. Returns the documents that
/// changed and the keys whose existence flipped.
fn populate_document_changes(
    txn: &mut PersistenceTransaction<'_>,
    updates: &BTreeMap<DocumentKey, MutableDocument>,
    read_time: SnapshotVersion,
) -> SyncResult<(BTreeMap<DocumentKey, MutableDocument>, BTreeSet<DocumentKey>)> {
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();
    for (key, document) in updates {
        let existing = txn.remote_documents().get(key);
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }
        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes mean access was lost; forget the document.
            txn.remove_remote_document(key)?;
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            txn.put_remote_document(document.clone(), read_time)?;
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current {}, received {}",
                existing.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

fn should_persist_target_data(old: &TargetData, updated: &TargetData, change: &TargetChange) -> bool {
    if updated.resume_token.is_empty() {
        // A cleared token must reach disk so a restart does not resume
        // from stale state.
        return !old.resume_token.is_empty();
    }
    if old.resume_token.is_empty() {
        return true;
    }
    let age = updated.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.has_document_changes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FilterOperator;
    use crate::model::{FieldPath, MutationResult};
    use crate::value::{ObjectValue, Value};

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(Persistence::memory()), &SyncSettings::default())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn object(field: &str, value: impl Into<Value>) -> ObjectValue {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value.into());
        data
    }

    fn field(doc: &MutableDocument, name: &str) -> Option<Value> {
        doc.field(&FieldPath::from_dot_separated(name).unwrap()).cloned()
    }

    fn ack(store: &LocalStore, batch_id: BatchId, version: i64) -> BTreeMap<DocumentKey, MutableDocument> {
        let batch = store.next_mutation_batch(batch_id - 1).unwrap().unwrap();
        let results = batch
            .mutations()
            .iter()
            .map(|_| MutationResult::new(SnapshotVersion::from_micros(version), Vec::new()))
            .collect();
        let result = MutationBatchResult::from(
            batch,
            SnapshotVersion::from_micros(version),
            results,
            b"token".to_vec(),
        )
        .unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_update(target_id: TargetId, doc: MutableDocument, version: i64) -> RemoteEvent {
        let mut change = TargetChange::default();
        change.added_documents.insert(doc.key().clone());
        change.current = true;
        change.resume_token = b"resume".to_vec();
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(target_id, change);
        event.document_updates.insert(doc.key().clone(), doc);
        event
    }

    #[test]
    fn local_write_is_visible_before_acknowledgement() {
        let store = store();
        let result = store
            .write_locally(vec![Mutation::set(key("patients/a"), object("x", 1))])
            .unwrap();
        assert_eq!(result.batch_id, 1);
        let doc = store.read_document(&key("patients/a")).unwrap();
        assert!(doc.has_local_mutations());
        assert_eq!(field(&doc, "x"), Some(Value::from(1)));
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), 1);
    }

    #[test]
    fn acknowledged_write_lands_in_remote_cache() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("patients/a"), object("x", 1))])
            .unwrap();
        let changes = ack(&store, 1, 100);
        let doc = &changes[&key("patients/a")];
        assert!(!doc.has_local_mutations());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(100));
        assert_eq!(store.pending_batch_count().unwrap(), 0);
        assert_eq!(store.last_stream_token().unwrap(), b"token".to_vec());
    }

    #[test]
    fn rejected_write_is_rolled_back() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("patients/a"), object("x", 1))])
            .unwrap();
        let changes = store.reject_batch(1).unwrap();
        assert!(!changes[&key("patients/a")].is_found_document());
        assert!(store.reject_batch(1).is_err());
    }

    #[test]
    fn later_writes_stack_on_earlier_ones() {
        let store = store();
        store
            .write_locally(vec![Mutation::set(key("patients/a"), object("x", 1))])
            .unwrap();
        let mask = crate::model::FieldMask::new(vec![FieldPath::from_dot_separated("y").unwrap()]);
        store
            .write_locally(vec![Mutation::patch(key("patients/a"), object("y", 2), mask)])
            .unwrap();
        ack(&store, 1, 10);
        let doc = store.read_document(&key("patients/a")).unwrap();
        assert_eq!(field(&doc, "x"), Some(Value::from(1)));
        assert_eq!(field(&doc, "y"), Some(Value::from(2)));
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn remote_event_ignores_older_versions() {
        let store = store();
        let query = Query::collection("patients").unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();

        let newer = MutableDocument::new_found(key("patients/a"), SnapshotVersion::from_micros(5), object("v", 2));
        store.apply_remote_event(&remote_update(target.target_id, newer, 5)).unwrap();
        let older = MutableDocument::new_found(key("patients/a"), SnapshotVersion::from_micros(3), object("v", 1));
        let changes = store.apply_remote_event(&remote_update(target.target_id, older, 6)).unwrap();
        assert!(changes.is_empty());

        let doc = store.read_document(&key("patients/a")).unwrap();
        assert_eq!(field(&doc, "v"), Some(Value::from(2)));
        assert_eq!(store.remote_document_keys(target.target_id).unwrap().len(), 1);
        assert_eq!(store.last_remote_snapshot_version().unwrap(), SnapshotVersion::from_micros(6));
    }

    #[test]
    fn query_merges_cache_and_pending_writes() {
        let store = store();
        let query = Query::collection("patients")
            .unwrap()
            .where_field("ward", FilterOperator::Equal, "north")
            .unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let remote = MutableDocument::new_found(key("patients/a"), SnapshotVersion::from_micros(5), object("ward", "north"));
        store.apply_remote_event(&remote_update(target.target_id, remote, 5)).unwrap();
        store
            .write_locally(vec![Mutation::set(key("patients/b"), object("ward", "north"))])
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("patients/c"), object("ward", "south"))])
            .unwrap();

        let result = store.execute_query(&query, true).unwrap();
        let ids: Vec<_> = result.documents.keys().map(|k| k.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(result.remote_keys.len(), 1);
    }

    #[test]
    fn released_target_is_kept_for_reuse() {
        let store = store();
        let target = Query::collection("patients").unwrap().to_target();
        let first = store.allocate_target(target.clone()).unwrap();
        store.release_target(first.target_id, true).unwrap();
        assert!(store.active_target_data(first.target_id).is_none());
        let again = store.allocate_target(target).unwrap();
        assert_eq!(again.target_id, first.target_id);
    }

    #[test]
    fn configured_indexes_are_backfilled() {
        let store = store();
        let query = Query::collection("patients")
            .unwrap()
            .where_field("ward", FilterOperator::Equal, "north")
            .unwrap();
        let target = store.allocate_target(query.to_target()).unwrap();
        let remote = MutableDocument::new_found(key("patients/a"), SnapshotVersion::from_micros(5), object("ward", "north"));
        store.apply_remote_event(&remote_update(target.target_id, remote, 5)).unwrap();

        store
            .configure_field_indexes(vec![FieldIndex::new(
                "patients",
                vec![crate::model::IndexSegment::new(
                    FieldPath::from_dot_separated("ward").unwrap(),
                    crate::model::IndexKind::Ascending,
                )],
            )])
            .unwrap();
        assert_eq!(store.field_indexes().unwrap().len(), 1);
        assert_eq!(store.execute_query(&query, false).unwrap().documents.len(), 1);
        store.delete_all_field_indexes().unwrap();
        assert!(store.field_indexes().unwrap().is_empty());
    }
}
