use std::collections::{BTreeMap, BTreeSet};

use crate::core::{DocumentSet, LimitType, Query};
use crate::error::SyncResult;
use crate::local::index_manager::IndexType;
use crate::local::local_documents_view;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::settings::IndexAutoCreationSettings;

#[derive(Clone, Copy, Debug, Default)]
struct ScanStats {
    scanned: usize,
    returned: usize,
}

/// Picks the cheapest way to answer a query from the local cache: a field
/// index, the keys the server last reported for the target, or a full
/// collection scan.
#[derive(Debug)]
pub struct QueryEngine {
    index_auto_creation: IndexAutoCreationSettings,
    scan_stats: BTreeMap<String, ScanStats>,
}

impl QueryEngine {
    pub fn new(index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self {
            index_auto_creation,
            scan_stats: BTreeMap::new(),
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation.enabled = enabled;
    }

    pub fn get_documents_matching_query(
        &mut self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        if let Some(results) = self.perform_query_using_index(txn, query) {
            return Ok(results);
        }
        if let Some(results) = self.perform_query_using_remote_keys(
            txn,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        ) {
            return Ok(results);
        }
        let (results, scanned) =
            local_documents_view::get_documents_matching_query(txn, query, SnapshotVersion::min());
        if self.index_auto_creation.enabled {
            self.create_cache_indexes(txn, query, scanned, results.len())?;
        }
        Ok(results)
    }

    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() {
            return None;
        }
        let target = query.to_target();
        let index_type = txn.indexes().get_index_type(&target);
        if index_type == IndexType::None {
            return None;
        }
        let mut candidates = txn.indexes().get_documents_matching_target(&target)?;
        // Pending writes are not indexed until acknowledged.
        let overlay_keys = match query.collection_group_id() {
            Some(group) => txn
                .overlays()
                .get_overlays_for_collection_group(group, crate::model::BATCH_ID_UNKNOWN),
            None => txn
                .overlays()
                .get_overlays_for_collection(query.path(), crate::model::BATCH_ID_UNKNOWN),
        };
        candidates.extend(overlay_keys.into_keys());

        let documents = local_documents_view::get_documents(txn, candidates.iter());
        let results = apply_query(query, documents);
        log::debug!(
            "query {} answered from a {:?} index with {} documents",
            query.canonical_id(),
            index_type,
            results.len()
        );
        Some(
            results
                .to_vec()
                .into_iter()
                .map(|document| (document.key().clone(), document))
                .collect(),
        )
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let documents = local_documents_view::get_documents(txn, remote_keys.iter());
        let previous_results = apply_query(query, documents);
        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        // Documents changed after the limbo-free version may have started
        // matching.
        let (mut results, _) = local_documents_view::get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
        );
        for document in previous_results.iter() {
            results.insert(document.key().clone(), document.clone());
        }
        Some(results)
    }

    /// Builds an index once full scans of a query have proven expensive
    /// relative to the results they return.
    fn create_cache_indexes(
        &mut self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        scanned: usize,
        returned: usize,
    ) -> SyncResult<()> {
        let target = query.to_target();
        let stats = self.scan_stats.entry(target.canonical_id()).or_default();
        stats.scanned += scanned;
        stats.returned += returned;
        let stats = *stats;

        if stats.scanned < self.index_auto_creation.min_scanned_documents {
            return Ok(());
        }
        let threshold = self.index_auto_creation.relative_index_read_cost * stats.returned as f64;
        if (stats.scanned as f64) <= threshold {
            return Ok(());
        }

        let documents: Vec<MutableDocument> = match target.collection_id() {
            Some(group) => txn
                .remote_documents()
                .documents()
                .filter(|doc| doc.key().has_collection_id(group))
                .cloned()
                .collect(),
            None => return Ok(()),
        };
        let indexes = txn.indexes_mut()?;
        if let Some(index) = indexes.create_target_index(&target) {
            for document in &documents {
                indexes.update_index_entries(document);
            }
            log::info!(
                "created index {} on '{}' after scanning {} documents for {} results",
                index.index_id(),
                index.collection_group(),
                stats.scanned,
                stats.returned
            );
        }
        self.scan_stats.remove(&target.canonical_id());
        Ok(())
    }
}

fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, MutableDocument>) -> DocumentSet {
    let mut results = DocumentSet::new(query.normalized_order_by());
    for document in documents.into_values() {
        if query.matches(&document) {
            results.add(document);
        }
    }
    results
}

/// A limit query answered from previous results must be re-run in full
/// when a remote key no longer matches or the document at the limit edge
/// changed after the results were last known to be complete.
fn needs_refill(
    query: &Query,
    previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => previous_results.last(),
        LimitType::Last => previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
