use std::collections::{BTreeMap, BTreeSet};

use crate::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use crate::core::{DocumentSet, LimitType, OnlineState, Query};
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::TargetChange;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Output of [`View::compute_doc_changes`], fed to [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query lost a document at its edge; the caller must re-run
    /// the query against the whole cache before applying.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// Materialized result set of one query.
///
/// The view tracks which of its documents the remote target has confirmed
/// (`synced_documents`); any other document it shows without pending local
/// writes is in limbo once the target is current.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.normalized_order_by());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: BTreeSet::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Computes the effect of `changes` on the view without applying it.
    /// Pass the result of an earlier call as `previous` to refill.
    pub fn compute_doc_changes(
        &self,
        changes: &BTreeMap<DocumentKey, MutableDocument>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, old_mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut mutated_keys = old_mutated_keys;
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() == limit as usize);
        let last_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = if self.query.matches(entry) {
                Some(entry)
            } else {
                None
            };
            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if !old_doc.data().is_equal(new_doc.data()) {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            applied = true;
                            let past_last = last_in_limit.as_ref().is_some_and(|last| {
                                document_set.compare(new_doc, last).is_gt()
                            });
                            let before_first = first_in_limit.as_ref().is_some_and(|first| {
                                document_set.compare(new_doc, first).is_lt()
                            });
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and the optional target change, returning a
    /// snapshot when anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| self.document_set.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_state);
        self.sync_state = Some(new_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let has_cached_results =
            target_change.is_some_and(|change| !change.resume_token.is_empty());
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                document_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Going offline marks the view as not current, so its next snapshot
    /// reports `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let previous = std::mem::take(&mut self.limbo_documents);
        let next: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = previous
            .difference(&next)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            next.difference(&previous)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = next;
        changes
    }

    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    // An acknowledged write may arrive before the watch snapshot carrying it.
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
