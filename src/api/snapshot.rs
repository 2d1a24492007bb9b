use crate::core::{ChangeType, Query, ViewSnapshot};
use crate::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion};
use crate::value::{ObjectValue, Value};

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// The result may be stale: it came from the local cache without the
    /// remote authority confirming it.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Local writes not yet acknowledged by the remote authority are
    /// reflected in the result.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    data: Option<ObjectValue>,
    version: SnapshotVersion,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn new(
        key: DocumentKey,
        data: Option<ObjectValue>,
        version: SnapshotVersion,
        metadata: SnapshotMetadata,
    ) -> Self {
        Self {
            key,
            data,
            version,
            metadata,
        }
    }

    pub(crate) fn from_document(document: &MutableDocument, from_cache: bool) -> Self {
        let data = document
            .is_found_document()
            .then(|| document.data().clone());
        Self::new(
            document.key().clone(),
            data,
            document.version(),
            SnapshotMetadata::new(from_cache, document.has_local_mutations()),
        )
    }

    pub(crate) fn missing(key: DocumentKey, from_cache: bool) -> Self {
        Self::new(
            key,
            None,
            SnapshotVersion::min(),
            SnapshotMetadata::new(from_cache, false),
        )
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&ObjectValue> {
        self.data.as_ref()
    }

    pub fn get(&self, field: &FieldPath) -> Option<&Value> {
        self.data.as_ref()?.field(field)
    }

    /// Version of the last remote write, or of the acknowledged local
    /// write that produced this state.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub change_type: ChangeType,
    pub document: DocumentSnapshot,
}

/// Result set of a query as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn from_view_snapshot(snapshot: ViewSnapshot) -> Self {
        let from_cache = snapshot.from_cache;
        let metadata = SnapshotMetadata::new(from_cache, snapshot.has_pending_writes());
        let documents = snapshot
            .documents
            .iter()
            .map(|document| DocumentSnapshot::from_document(document, from_cache))
            .collect();
        let changes = snapshot
            .document_changes
            .iter()
            .map(|change| DocumentChange {
                change_type: change.change_type,
                document: DocumentSnapshot::from_document(&change.document, from_cache),
            })
            .collect();
        Self {
            query: snapshot.query,
            documents,
            changes,
            metadata,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Documents in query order.
    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// Changes since the previous snapshot delivered to the same subscriber;
    /// every document is `Added` in the first one.
    pub fn changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&DocumentSnapshot> {
        self.documents.iter().find(|document| document.key() == key)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn from_cache(&self) -> bool {
        self.metadata.from_cache()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::core::DocumentSet;

    #[test]
    fn metadata_flags() {
        let meta = SnapshotMetadata::new(true, false);
        assert!(meta.from_cache());
        assert!(!meta.has_pending_writes());
    }

    #[test]
    fn missing_document_does_not_exist() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let snapshot = DocumentSnapshot::missing(key, true);
        assert!(!snapshot.exists());
        assert!(snapshot.from_cache());
    }

    #[test]
    fn query_snapshot_reports_local_mutations_per_document() {
        let query = Query::collection("rooms").unwrap();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), Value::from_integer(1));
        let mut document = MutableDocument::new_found(
            key.clone(),
            SnapshotVersion::min(),
            ObjectValue::from_map(fields),
        );
        document.set_has_local_mutations();
        let mut documents = DocumentSet::new(query.normalized_order_by());
        documents.add(document);
        let view = ViewSnapshot::from_initial_documents(
            query,
            documents,
            BTreeSet::from([key.clone()]),
            true,
            false,
        );

        let snapshot = QuerySnapshot::from_view_snapshot(view);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.has_pending_writes());
        assert_eq!(snapshot.changes()[0].change_type, ChangeType::Added);
        let document = snapshot.get(&key).expect("document");
        assert!(document.has_pending_writes());
        assert_eq!(
            document.get(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&Value::from_integer(1))
        );
    }
}
