//! Local view of documents: the remote cache with pending writes applied
//! through their overlays.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::SyncResult;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, Overlay,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

fn apply_overlay(document: &mut MutableDocument, overlay: &Overlay) -> Option<FieldMask> {
    let mask = overlay.mutation.field_mask();
    overlay
        .mutation
        .apply_to_local_view(document, mask.clone(), Timestamp::now());
    mask
}

pub(crate) fn get_document(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
    let mut document = txn.remote_documents().get(key);
    if let Some(overlay) = txn.overlays().get_overlay(key) {
        apply_overlay(&mut document, overlay);
    }
    document
}

pub(crate) fn get_documents<'a, I>(
    txn: &PersistenceTransaction<'_>,
    keys: I,
) -> BTreeMap<DocumentKey, MutableDocument>
where
    I: IntoIterator<Item = &'a DocumentKey>,
{
    keys.into_iter()
        .map(|key| (key.clone(), get_document(txn, key)))
        .collect()
}

/// Applies the stored overlays to `documents`, reporting which fields each
/// overlay touched. An empty mask means no pending writes.
pub(crate) fn get_overlayed_documents(
    txn: &PersistenceTransaction<'_>,
    documents: BTreeMap<DocumentKey, MutableDocument>,
) -> BTreeMap<DocumentKey, OverlayedDocument> {
    documents
        .into_iter()
        .map(|(key, mut document)| {
            let mask = match txn.overlays().get_overlay(&key) {
                Some(overlay) => apply_overlay(&mut document, overlay),
                None => Some(FieldMask::empty()),
            };
            (key, OverlayedDocument::new(document, mask))
        })
        .collect()
}

/// Local view of freshly changed remote documents. Documents whose
/// existence flipped get their overlays recomputed, since a patch that
/// applied to a missing document no longer means the same thing.
pub(crate) fn get_local_view_of_documents(
    txn: &mut PersistenceTransaction<'_>,
    documents: BTreeMap<DocumentKey, MutableDocument>,
    existence_state_changed: &BTreeSet<DocumentKey>,
) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
    let mut recalculate = BTreeMap::new();
    let mut results = BTreeMap::new();
    for (key, mut document) in documents {
        let overlay = txn.overlays().get_overlay(&key);
        let needs_recalculation = existence_state_changed.contains(&key)
            && overlay.map_or(true, |o| o.mutation.field_mask().is_some());
        if needs_recalculation {
            recalculate.insert(key, document);
        } else {
            if let Some(overlay) = overlay {
                apply_overlay(&mut document, overlay);
            }
            results.insert(key, document);
        }
    }
    recalculate_and_save_overlays(txn, &mut recalculate)?;
    results.extend(recalculate);
    Ok(results)
}

/// Replays every pending batch over `documents` and stores one overlay per
/// document under the largest batch that touched it.
pub(crate) fn recalculate_and_save_overlays(
    txn: &mut PersistenceTransaction<'_>,
    documents: &mut BTreeMap<DocumentKey, MutableDocument>,
) -> SyncResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
    if documents.is_empty() {
        return Ok(BTreeMap::new());
    }
    let batches = txn.mutation_queue().all_batches_affecting_keys(documents.keys());
    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();

    for batch in &batches {
        for key in batch.keys() {
            let Some(document) = documents.get_mut(&key) else {
                continue;
            };
            let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
            let mask = batch.apply_to_local_view(document, mask);
            masks.insert(key.clone(), mask);
            keys_by_batch.entry(batch.batch_id()).or_default().insert(key);
        }
    }

    let mut processed = BTreeSet::new();
    for (batch_id, keys) in keys_by_batch.into_iter().rev() {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if !processed.insert(key.clone()) {
                continue;
            }
            let Some(document) = documents.get(&key) else {
                continue;
            };
            let mask = masks.get(&key).cloned().flatten();
            let overlay = calculate_overlay_mutation(document, mask.as_ref());
            overlays.insert(key, overlay);
        }
        txn.overlays_mut()?.save_overlays(batch_id, overlays);
    }
    Ok(masks)
}

pub(crate) fn recalculate_and_save_overlays_for_document_keys(
    txn: &mut PersistenceTransaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> SyncResult<()> {
    let mut documents = txn.remote_documents().get_all(keys.iter());
    recalculate_and_save_overlays(txn, &mut documents)?;
    Ok(())
}

/// All documents matching `query` in the local view. Only remote documents
/// read after `since_read_time` are scanned; documents with pending writes
/// are always included. Returns the documents and how many were scanned.
pub(crate) fn get_documents_matching_query(
    txn: &PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> (BTreeMap<DocumentKey, MutableDocument>, usize) {
    if query.is_document_query() {
        let mut results = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = get_document(txn, &key);
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        return (results, 1);
    }

    if let Some(group) = query.collection_group_id() {
        let mut results = BTreeMap::new();
        let mut scanned = 0;
        for parent in txn.indexes().get_collection_parents(group) {
            let collection_query = query.as_collection_query_at_path(parent.child([group]));
            let (documents, count) =
                get_documents_matching_collection_query(txn, &collection_query, since_read_time);
            scanned += count;
            results.extend(documents);
        }
        return (results, scanned);
    }

    get_documents_matching_collection_query(txn, query, since_read_time)
}

fn get_documents_matching_collection_query(
    txn: &PersistenceTransaction<'_>,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> (BTreeMap<DocumentKey, MutableDocument>, usize) {
    let (mut documents, scanned) = txn
        .remote_documents()
        .get_documents_matching_collection(query.path(), since_read_time);
    let overlays = txn
        .overlays()
        .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN);
    for key in overlays.keys() {
        if !documents.contains_key(key) {
            documents.insert(key.clone(), txn.remote_documents().get(key));
        }
    }
    for (key, document) in documents.iter_mut() {
        if let Some(overlay) = overlays.get(key) {
            apply_overlay(document, overlay);
        }
    }
    documents.retain(|_, document| query.matches(document));
    (documents, scanned + overlays.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::local::{LocalStore, Persistence, TransactionMode};
    use crate::model::{
        FieldPath, FieldTransform, Mutation, MutationBatchResult, MutationResult, TransformOperation,
    };
    use crate::settings::SyncSettings;
    use crate::value::{ObjectValue, Value};

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(Persistence::memory()), &SyncSettings::default())
    }

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn path(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn object(fields: &[(&str, Value)]) -> ObjectValue {
        let mut data = ObjectValue::empty();
        for (name, value) in fields {
            data.set(&path(name), value.clone());
        }
        data
    }

    /// A set, a patch and an increment on the same document, one batch each.
    fn stacked_writes(store: &LocalStore) -> Vec<BatchId> {
        let writes = vec![
            Mutation::set(
                key(),
                object(&[("n", Value::from(1)), ("title", Value::from("lobby"))]),
            ),
            Mutation::patch(
                key(),
                object(&[("title", Value::from("hall"))]),
                FieldMask::new(vec![path("title")]),
            ),
            Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty()).with_field_transforms(vec![
                FieldTransform::new(path("n"), TransformOperation::NumericIncrement(Value::from(5))),
            ]),
        ];
        writes
            .into_iter()
            .map(|mutation| store.write_locally(vec![mutation]).unwrap().batch_id)
            .collect()
    }

    /// Folds the queued batches over the cached remote document, ignoring
    /// stored overlays.
    fn replay_queue(store: &LocalStore) -> MutableDocument {
        let keys = [key()];
        store
            .persistence()
            .run_transaction("replay", TransactionMode::ReadOnly, |txn| {
                let mut document = txn.remote_documents().get(&keys[0]);
                let mut mask = Some(FieldMask::empty());
                for batch in txn.mutation_queue().all_batches_affecting_keys(keys.iter()) {
                    mask = batch.apply_to_local_view(&mut document, mask);
                }
                Ok(document)
            })
            .unwrap()
    }

    fn local_view(store: &LocalStore) -> MutableDocument {
        store
            .persistence()
            .run_transaction("read", TransactionMode::ReadOnly, |txn| Ok(get_document(txn, &key())))
            .unwrap()
    }

    fn overlay(store: &LocalStore) -> Option<Overlay> {
        store
            .persistence()
            .run_transaction("overlay", TransactionMode::ReadOnly, |txn| {
                Ok(txn.overlays().get_overlay(&key()).cloned())
            })
            .unwrap()
    }

    fn rebuild(store: &LocalStore) {
        store
            .persistence()
            .run_transaction("rebuild", TransactionMode::ReadWrite, |txn| {
                recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key()]))
            })
            .unwrap();
    }

    #[test]
    fn stacked_writes_fold_into_one_overlay() {
        let store = store();
        let batches = stacked_writes(&store);
        let view = local_view(&store);
        assert_eq!(view.field(&path("n")), Some(&Value::from(6)));
        assert_eq!(view.field(&path("title")), Some(&Value::from("hall")));
        assert_eq!(view.data(), replay_queue(&store).data());
        assert_eq!(overlay(&store).map(|o| o.largest_batch_id), Some(batches[2]));
    }

    #[test]
    fn rejecting_the_middle_batch_matches_a_replay_of_the_rest() {
        let store = store();
        let batches = stacked_writes(&store);

        store.reject_batch(batches[1]).unwrap();

        let view = local_view(&store);
        assert_eq!(view.data(), replay_queue(&store).data());
        assert_eq!(view.field(&path("title")), Some(&Value::from("lobby")));
        assert_eq!(view.field(&path("n")), Some(&Value::from(6)));
        assert!(view.has_local_mutations());
        assert_eq!(overlay(&store).map(|o| o.largest_batch_id), Some(batches[2]));
    }

    #[test]
    fn acknowledging_the_first_batch_matches_a_replay_of_the_rest() {
        let store = store();
        let batches = stacked_writes(&store);
        let before = local_view(&store);

        let batch = store.next_mutation_batch(batches[0] - 1).unwrap().unwrap();
        let version = SnapshotVersion::from_micros(1_000_000);
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, Vec::new())],
            b"token".to_vec(),
        )
        .unwrap();
        store.acknowledge_batch(&result).unwrap();

        let view = local_view(&store);
        assert_eq!(view.data(), replay_queue(&store).data());
        assert_eq!(view.data(), before.data());
        assert!(view.has_local_mutations());
        assert_eq!(store.pending_batch_count().unwrap(), 2);
    }

    #[test]
    fn rebuilding_twice_changes_nothing() {
        let store = store();
        let batches = stacked_writes(&store);
        store.reject_batch(batches[1]).unwrap();
        let after_reject = overlay(&store);
        assert!(after_reject.is_some());

        rebuild(&store);
        let first = overlay(&store);
        rebuild(&store);

        assert_eq!(first, after_reject);
        assert_eq!(overlay(&store), first);
        assert_eq!(local_view(&store).data(), replay_queue(&store).data());
    }
}
