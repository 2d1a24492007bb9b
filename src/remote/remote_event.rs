use std::collections::{BTreeMap, BTreeSet};

use crate::local::TargetPurpose;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// Per-target part of a [`RemoteEvent`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Opaque token to resume the target from this point. Empty when the
    /// server did not send one.
    pub resume_token: Vec<u8>,
    /// The target has caught up with the server's state as of this event.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }

    /// Change that only marks the target current, used to synthesize
    /// events for rejected or reset targets.
    pub fn create_synthesized_target_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}

/// Everything learned from the listen stream at one consistent snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; their cached results
    /// must be discarded and the target re-listened with `purpose`.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents only referenced by limbo-resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}
