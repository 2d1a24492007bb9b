use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{Target, TargetIdGenerator};
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Persistent record of listened targets and the documents matching each.
///
/// Also records, per document, the sequence number at which it was last
/// referenced or released. The garbage collector uses it to age out
/// documents no target holds anymore.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    ids_by_canonical_id: BTreeMap<String, BTreeSet<TargetId>>,
    keys_by_target: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    targets_by_key: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    highest_target_id: TargetId,
    last_remote_snapshot_version: SnapshotVersion,
    document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
}

impl TargetCache {
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub(crate) fn allocate_target_id(&mut self) -> TargetId {
        let id = TargetIdGenerator::for_target_cache(self.highest_target_id).next();
        self.highest_target_id = id;
        id
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub(crate) fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        let ids = self.ids_by_canonical_id.get(&target.canonical_id())?;
        ids.iter()
            .filter_map(|id| self.targets.get(id))
            .find(|data| &data.target == target)
    }

    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub(crate) fn add_target_data(&mut self, data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(data.target_id);
        self.ids_by_canonical_id
            .entry(data.target.canonical_id())
            .or_default()
            .insert(data.target_id);
        self.targets.insert(data.target_id, data);
    }

    pub(crate) fn update_target_data(&mut self, data: TargetData) {
        self.add_target_data(data);
    }

    /// Drops the target and its key mappings.
    pub(crate) fn remove_target_data(&mut self, target_id: TargetId, sequence_number: ListenSequenceNumber) {
        if let Some(data) = self.targets.remove(&target_id) {
            let canonical_id = data.target.canonical_id();
            if let Some(ids) = self.ids_by_canonical_id.get_mut(&canonical_id) {
                ids.remove(&target_id);
                if ids.is_empty() {
                    self.ids_by_canonical_id.remove(&canonical_id);
                }
            }
        }
        self.remove_matching_keys_for_target_id(target_id, sequence_number);
    }

    pub(crate) fn add_matching_keys<'a, I>(
        &mut self,
        keys: I,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.keys_by_target
                .entry(target_id)
                .or_default()
                .insert(key.clone());
            self.targets_by_key
                .entry(key.clone())
                .or_default()
                .insert(target_id);
            self.document_sequence_numbers
                .insert(key.clone(), sequence_number);
        }
    }

    pub(crate) fn remove_matching_keys<'a, I>(
        &mut self,
        keys: I,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            if let Some(keys) = self.keys_by_target.get_mut(&target_id) {
                keys.remove(key);
            }
            if let Some(targets) = self.targets_by_key.get_mut(key) {
                targets.remove(&target_id);
                if targets.is_empty() {
                    self.targets_by_key.remove(key);
                }
            }
            let released_at = self
                .document_sequence_numbers
                .entry(key.clone())
                .or_insert(sequence_number);
            *released_at = (*released_at).max(sequence_number);
        }
    }

    pub(crate) fn remove_matching_keys_for_target_id(
        &mut self,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) {
        let keys = self.keys_by_target.remove(&target_id).unwrap_or_default();
        self.remove_matching_keys(keys.iter(), target_id, sequence_number);
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.keys_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// True when any target currently matches `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.targets_by_key.contains_key(key)
    }

    pub(crate) fn record_document_sequence_number(
        &mut self,
        key: &DocumentKey,
        sequence_number: ListenSequenceNumber,
    ) {
        self.document_sequence_numbers
            .insert(key.clone(), sequence_number);
    }

    pub(crate) fn forget_document(&mut self, key: &DocumentKey) {
        self.document_sequence_numbers.remove(key);
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    /// Documents not held by any target, with their last sequence number.
    pub fn orphaned_documents(&self) -> impl Iterator<Item = (&DocumentKey, ListenSequenceNumber)> {
        self.document_sequence_numbers
            .iter()
            .filter(|(key, _)| !self.targets_by_key.contains_key(*key))
            .map(|(key, seq)| (key, *seq))
    }

    /// Removes every inactive target whose sequence number is at most
    /// `upper_bound`. Released documents inherit the target's sequence
    /// number, so they age out in the same pass. Returns how many targets
    /// were removed.
    pub(crate) fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<(TargetId, ListenSequenceNumber)> = self
            .targets
            .values()
            .filter(|data| {
                data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id)
            })
            .map(|data| (data.target_id, data.sequence_number))
            .collect();
        for (target_id, sequence_number) in &doomed {
            self.remove_target_data(*target_id, *sequence_number);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::target_data::TargetPurpose;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn target_data(cache: &mut TargetCache, collection: &str, seq: ListenSequenceNumber) -> TargetData {
        let id = cache.allocate_target_id();
        let target = Query::collection(collection).unwrap().to_target();
        let data = TargetData::new(target, id, TargetPurpose::Listen, seq);
        cache.add_target_data(data.clone());
        data
    }

    #[test]
    fn allocates_even_increasing_ids() {
        let mut cache = TargetCache::default();
        let first = cache.allocate_target_id();
        let second = cache.allocate_target_id();
        assert_eq!(first % 2, 0);
        assert!(second > first);
    }

    #[test]
    fn looks_up_targets_by_value() {
        let mut cache = TargetCache::default();
        let data = target_data(&mut cache, "patients", 1);
        assert_eq!(cache.get_target_data(&data.target), Some(&data));
        let other = Query::collection("visits").unwrap().to_target();
        assert!(cache.get_target_data(&other).is_none());
    }

    #[test]
    fn tracks_matching_keys_in_both_directions() {
        let mut cache = TargetCache::default();
        let data = target_data(&mut cache, "patients", 1);
        cache.add_matching_keys([&key("patients/a"), &key("patients/b")], data.target_id, 2);
        assert!(cache.contains_key(&key("patients/a")));
        cache.remove_matching_keys([&key("patients/a")], data.target_id, 3);
        assert!(!cache.contains_key(&key("patients/a")));
        assert_eq!(cache.get_matching_keys_for_target_id(data.target_id).len(), 1);

        let orphans: Vec<_> = cache.orphaned_documents().collect();
        assert_eq!(orphans, vec![(&key("patients/a"), 3)]);
    }

    #[test]
    fn removes_only_old_inactive_targets() {
        let mut cache = TargetCache::default();
        let old = target_data(&mut cache, "a", 1);
        let active = target_data(&mut cache, "b", 1);
        let fresh = target_data(&mut cache, "c", 10);
        cache.add_matching_keys([&key("a/x")], old.target_id, 1);

        let mut active_ids = BTreeSet::new();
        active_ids.insert(active.target_id);
        assert_eq!(cache.remove_targets(5, &active_ids), 1);
        assert!(cache.get_target_data_by_id(old.target_id).is_none());
        assert!(cache.get_target_data_by_id(fresh.target_id).is_some());
        assert!(!cache.contains_key(&key("a/x")));
    }
}
