use std::collections::{BTreeMap, BTreeSet};

use crate::local::{TargetData, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::BloomFilter;

/// What the aggregator needs to know about the targets the client listens to.
pub trait TargetMetadataProvider {
    /// Keys the local cache associates with the target as of the last
    /// applied remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` once the client stopped listening to the target.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Tracks the state of one target between remote events.
#[derive(Debug)]
struct TargetState {
    /// Add/remove requests the server has not answered yet. Changes for a
    /// target with pending responses are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts true so a freshly added target raises an event.
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn record_target_response(&mut self) {
        if self.pending_responses == 0 {
            log::warn!("received an unexpected target acknowledgement");
            return;
        }
        self.pending_responses -= 1;
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::create_synthesized_target_change(
            self.current,
            self.resume_token.clone(),
        );
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds listen-stream messages into [`RemoteEvent`]s. One event is produced
/// whenever the server reports a consistent snapshot.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets a pending document update was reported for.
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Every target a document was added to or removed from.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentWatchChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let found = change
            .document
            .as_ref()
            .filter(|document| document.is_found_document());
        for target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(*target_id, document.clone(), provider),
                None => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    change.document.clone(),
                    provider,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.document.clone(), provider);
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.targets_for_change(change, provider) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, provider) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A newly added target must not report changes
                        // received before its acknowledgement.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, provider) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, provider) {
                        self.reset_target(target_id, provider);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Empty `target_ids` address every active target.
    fn targets_for_change(
        &self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, provider))
            .collect()
    }

    /// Compares the server's document count with the local one. A mismatch
    /// that a bloom filter cannot explain schedules the target for a reset.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted without the server telling us.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted), provider);
                }
            } else if expected_count != 1 {
                log::warn!(
                    "single document target {target_id} reported {expected_count} documents"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, provider);
        if current_count == expected_count as i64 {
            return;
        }

        let application = match self.parse_bloom_filter(change) {
            Some(filter) => self.apply_bloom_filter(&filter, change, current_count, provider),
            None => BloomFilterApplication::Skipped,
        };
        if application != BloomFilterApplication::Success {
            self.reset_target(target_id, provider);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let payload = change.unchanged_names.as_ref()?;
        match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
            Ok(filter) if filter.bit_count() > 0 => Some(filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("ignoring malformed bloom filter: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
        provider: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let removed = self.filter_removed_documents(filter, change.target_id, provider);
        if change.count as i64 == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached member of the target the filter rules out and
    /// returns how many were removed.
    fn filter_removed_documents(
        &mut self,
        filter: &BloomFilter,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = key.qualified_name(provider.database_id());
            if !filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None, provider);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything aggregated so far and clears the
    /// per-document bookkeeping.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current single-document target that never heard about
                // its document proves the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let reported = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map(|targets| targets.contains(&target_id))
                        .unwrap_or(false);
                    if !reported && !self.target_contains_document(target_id, &key, provider) {
                        let missing = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(missing), provider);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id, provider) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called when the client sends an add or remove request for a target.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Forgets a target's state, e.g. when the listen stream restarts.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, provider) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated` carries the document's new state when the server knows it
    /// (e.g. a delete); `None` when the document only left the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated: Option<MutableDocument>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // The document was added and removed within one event.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated {
            self.pending_document_updates.insert(key.clone(), document);
            self.pending_document_updates_by_target
                .entry(key.clone())
                .or_default()
                .insert(target_id);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    /// Drops the target's pending changes and removes every document the
    /// cache associates with it, so the next event rebuilds it from scratch.
    fn reset_target(&mut self, target_id: TargetId, provider: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, provider);
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, provider: &dyn TargetMetadataProvider) -> bool {
        let active = self.target_data_for_active_target(target_id, provider).is_some();
        if !active {
            log::debug!("ignoring change for inactive target {target_id}");
        }
        active
    }

    /// Target data for targets that are listened to and have no
    /// unacknowledged requests.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        provider: &dyn TargetMetadataProvider,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Query, Target};
    use crate::model::Timestamp;
    use crate::remote::watch_change::BloomFilterPayload;
    use crate::value::ObjectValue;

    struct TestMetadata {
        database_id: DatabaseId,
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn new() -> Self {
            Self {
                database_id: DatabaseId::for_project("demo"),
                targets: BTreeMap::new(),
                remote_keys: BTreeMap::new(),
            }
        }

        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection("rooms").unwrap().to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            let target = Target::for_document(&key(path));
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }

        fn database_id(&self) -> &DatabaseId {
            &self.database_id
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found(key(path), version(1), ObjectValue::empty())
    }

    fn doc_change(path: &str, updated: Vec<TargetId>, removed: Vec<TargetId>) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: key(path),
            document: Some(doc(path)),
        }
    }

    fn target_change(state: WatchTargetChangeState, ids: Vec<TargetId>, token: &[u8]) -> WatchTargetChange {
        WatchTargetChange::new(state, ids).with_resume_token(token.to_vec())
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = TestMetadata::new().with_query_target(1, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();

        aggregator.handle_document_change(doc_change("rooms/a", vec![1], vec![]), &metadata);
        aggregator.handle_document_change(doc_change("rooms/b", vec![1], vec![]), &metadata);
        aggregator.handle_target_change(
            &target_change(WatchTargetChangeState::Current, vec![1], b"t1"),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(5), &metadata);
        let change = event.target_changes.get(&1).expect("target change");
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1");
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.added_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), version(5));
    }

    #[test]
    fn ignores_changes_while_add_is_pending() {
        let metadata = TestMetadata::new().with_query_target(1, &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(1);

        aggregator.handle_document_change(doc_change("rooms/a", vec![1], vec![]), &metadata);
        assert!(aggregator
            .create_remote_event(version(2), &metadata)
            .document_updates
            .is_empty());

        aggregator.handle_target_change(
            &target_change(WatchTargetChangeState::Added, vec![1], b""),
            &metadata,
        );
        aggregator.handle_document_change(doc_change("rooms/a", vec![1], vec![]), &metadata);
        let event = aggregator.create_remote_event(version(3), &metadata);
        assert!(event.target_changes[&1].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn global_no_change_updates_every_active_target() {
        let metadata = TestMetadata::new()
            .with_query_target(1, &[])
            .with_query_target(3, &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(
            &target_change(WatchTargetChangeState::Current, vec![1, 3], b"a"),
            &metadata,
        );
        aggregator.create_remote_event(version(1), &metadata);

        aggregator.handle_target_change(
            &target_change(WatchTargetChangeState::NoChange, vec![], b"global"),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(event.target_changes[&1].resume_token, b"global");
        assert_eq!(event.target_changes[&3].resume_token, b"global");
    }

    #[test]
    fn existence_filter_without_bloom_filter_resets_target() {
        let metadata = TestMetadata::new().with_query_target(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            },
            &metadata,
        );

        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let change = &event.target_changes[&1];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn bloom_filter_removes_exactly_the_missing_documents() {
        let metadata = TestMetadata::new().with_query_target(1, &["rooms/a", "rooms/b", "rooms/c"]);
        let database_id = DatabaseId::for_project("demo");
        let survivors = [key("rooms/a"), key("rooms/c")];
        let names: Vec<String> = survivors
            .iter()
            .map(|key| key.qualified_name(&database_id))
            .collect();
        let filter = BloomFilter::with_members(names.iter().map(String::as_str), 512, 7);
        assert!(!filter.might_contain(&key("rooms/b").qualified_name(&database_id)));

        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 2,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: filter.bitmap().to_vec(),
                    padding: filter.padding(),
                    hash_count: filter.hash_count() as i32,
                }),
            },
            &metadata,
        );

        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_mismatches.is_empty());
        let removed: Vec<_> = event.target_changes[&1].removed_documents.iter().cloned().collect();
        assert_eq!(removed, vec![key("rooms/b")]);
    }

    #[test]
    fn malformed_bloom_filter_falls_back_to_reset() {
        let metadata = TestMetadata::new().with_query_target(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: Some(BloomFilterPayload {
                    bitmap: vec![],
                    padding: 3,
                    hash_count: 1,
                }),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_deletion() {
        let metadata = TestMetadata::new().with_limbo_target(5, "rooms/ghost");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(
            &target_change(WatchTargetChangeState::Current, vec![5], b"t"),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(9), &metadata);
        let ghost = &event.document_updates[&key("rooms/ghost")];
        assert!(ghost.is_no_document());
        assert_eq!(ghost.version(), version(9));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/ghost")));
    }

    #[test]
    fn documents_shared_with_listen_targets_are_not_limbo_only() {
        let metadata = TestMetadata::new()
            .with_query_target(1, &[])
            .with_limbo_target(5, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(doc_change("rooms/a", vec![1, 5], vec![]), &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
