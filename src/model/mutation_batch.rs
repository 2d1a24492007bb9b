use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, SyncResult};
use crate::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, Mutation,
    MutationResult, OverlayedDocument, SnapshotVersion, Timestamp,
};

/// One atomic group of local writes.
///
/// `base_mutations` pin the inputs of non-idempotent transforms; they are
/// applied before `mutations` in the local view but never sent to the
/// authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(batch_result.mutation_results()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to every document it touches and returns the
    /// resulting overlay per key. Keys in `without_remote_version` get a
    /// whole-document overlay since there is nothing to patch against.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(entry) = documents.get_mut(&key) else {
                continue;
            };
            let mask = self.apply_to_local_view(&mut entry.document, entry.mutated_fields.take());
            let mask = if without_remote_version.contains(&key) {
                None
            } else {
                mask
            };
            entry.mutated_fields = mask;
            if let Some(overlay) =
                calculate_overlay_mutation(&entry.document, entry.mutated_fields.as_ref())
            {
                overlays.insert(key, overlay);
            }
            if !entry.document.is_valid_document() {
                entry.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// A batch together with the authority's acknowledgement of it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    batch: MutationBatch,
    commit_version: SnapshotVersion,
    mutation_results: Vec<MutationResult>,
    stream_token: Vec<u8>,
    doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> SyncResult<Self> {
        if batch.mutations().len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Batch {} has {} mutations but received {} results",
                batch.batch_id(),
                batch.mutations().len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations()
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    pub fn batch(&self) -> &MutationBatch {
        &self.batch
    }

    pub fn commit_version(&self) -> SnapshotVersion {
        self.commit_version
    }

    pub fn mutation_results(&self) -> &[MutationResult] {
        &self.mutation_results
    }

    pub fn stream_token(&self) -> &[u8] {
        &self.stream_token
    }

    pub fn doc_versions(&self) -> &BTreeMap<DocumentKey, SnapshotVersion> {
        &self.doc_versions
    }
}
