use std::collections::BTreeSet;

use crate::error::SyncResult;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::settings::LruSettings;

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Least-recently-used collection of inactive targets and the documents
/// only they referenced. Runs only once the cache outgrows its threshold.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    settings: LruSettings,
}

impl LruGarbageCollector {
    pub fn new(settings: LruSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LruSettings {
        &self.settings
    }

    /// `is_pinned` reports documents referenced outside the target cache,
    /// such as by an active view.
    pub fn collect<F>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        is_pinned: F,
    ) -> SyncResult<LruResults>
    where
        F: Fn(&DocumentKey) -> bool,
    {
        if !self.settings.is_enabled() {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = txn.remote_documents().byte_size() as i64;
        if cache_size < self.settings.cache_size_bytes {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is below threshold {}",
                self.settings.cache_size_bytes
            );
            return Ok(LruResults::skipped());
        }

        let to_collect = self.sequence_numbers_to_collect(txn);
        let upper_bound = self.nth_sequence_number(txn, to_collect);
        let targets_removed = txn
            .targets_mut()?
            .remove_targets(upper_bound, active_target_ids);
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, &is_pinned)?;

        log::info!(
            "garbage collection removed {targets_removed} targets and {documents_removed} documents (upper bound {upper_bound})"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }

    fn sequence_numbers_to_collect(&self, txn: &PersistenceTransaction<'_>) -> usize {
        let count = txn.targets().target_count() + txn.targets().orphaned_documents().count();
        let percentile = (self.settings.percentile_to_collect as usize * count) / 100;
        percentile.min(self.settings.max_sequence_numbers_to_collect)
    }

    fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut sequence_numbers: Vec<ListenSequenceNumber> = txn
            .targets()
            .targets()
            .map(|data| data.sequence_number)
            .chain(txn.targets().orphaned_documents().map(|(_, seq)| seq))
            .collect();
        sequence_numbers.sort_unstable();
        sequence_numbers
            .get(n - 1)
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    fn remove_orphaned_documents<F>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        is_pinned: &F,
    ) -> SyncResult<usize>
    where
        F: Fn(&DocumentKey) -> bool,
    {
        let doomed: Vec<DocumentKey> = txn
            .targets()
            .orphaned_documents()
            .filter(|(key, seq)| {
                *seq <= upper_bound
                    && !is_pinned(key)
                    && !txn.mutation_queue().contains_key(key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            txn.remove_remote_document(key)?;
            txn.targets_mut()?.forget_document(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::local::target_data::{TargetData, TargetPurpose};
    use crate::model::{MutableDocument, SnapshotVersion};
    use crate::value::ObjectValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn seed_released_target(persistence: &Persistence, collection: &str, docs: &[&str]) -> TargetId {
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                let seq = txn.current_sequence_number();
                let target_id = txn.targets_mut()?.allocate_target_id();
                let target = Query::collection(collection).unwrap().to_target();
                txn.targets_mut()?
                    .add_target_data(TargetData::new(target, target_id, TargetPurpose::Listen, seq));
                let keys: Vec<DocumentKey> = docs.iter().map(|d| key(d)).collect();
                for key in &keys {
                    let doc = MutableDocument::new_found(
                        key.clone(),
                        SnapshotVersion::from_micros(1),
                        ObjectValue::empty(),
                    );
                    txn.put_remote_document(doc, SnapshotVersion::from_micros(1))?;
                }
                txn.targets_mut()?.add_matching_keys(keys.iter(), target_id, seq);
                Ok(target_id)
            })
            .unwrap()
    }

    fn collect(persistence: &Persistence, gc: &LruGarbageCollector, active: &[TargetId]) -> LruResults {
        let active: BTreeSet<TargetId> = active.iter().copied().collect();
        persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                gc.collect(txn, &active, |_| false)
            })
            .unwrap()
    }

    fn settings(threshold: i64, percentile: u32) -> LruSettings {
        LruSettings {
            cache_size_bytes: threshold,
            percentile_to_collect: percentile,
            ..LruSettings::default()
        }
    }

    #[test]
    fn does_not_run_below_threshold() {
        let persistence = Persistence::memory();
        seed_released_target(&persistence, "a", &["a/1"]);
        let gc = LruGarbageCollector::new(settings(1_000_000, 100));
        assert!(!collect(&persistence, &gc, &[]).did_run);
    }

    #[test]
    fn removes_oldest_inactive_targets_and_their_documents() {
        let persistence = Persistence::memory();
        seed_released_target(&persistence, "old", &["old/1", "old/2"]);
        let active = seed_released_target(&persistence, "live", &["live/1"]);
        seed_released_target(&persistence, "newer", &["newer/1"]);

        // Collect half of the three targets, i.e. the oldest one.
        let gc = LruGarbageCollector::new(settings(1, 50));
        let results = collect(&persistence, &gc, &[active]);
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    txn.remote_documents().contains(&key("old/1")),
                    txn.remote_documents().contains(&key("live/1")),
                    txn.remote_documents().contains(&key("newer/1")),
                ))
            })
            .unwrap();
        assert_eq!(remaining, (false, true, true));
    }

    #[test]
    fn never_collects_active_targets() {
        let persistence = Persistence::memory();
        let only = seed_released_target(&persistence, "live", &["live/1"]);
        let gc = LruGarbageCollector::new(settings(1, 100));
        let results = collect(&persistence, &gc, &[only]);
        assert_eq!(results.targets_removed, 0);
        assert_eq!(results.documents_removed, 0);
    }
}
