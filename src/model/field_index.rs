use serde::{Deserialize, Serialize};

use crate::model::FieldPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Secondary index over a collection group. Entries are ordered by the
/// segment values, then by document key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    index_id: i32,
    collection_group: String,
    segments: Vec<IndexSegment>,
}

impl FieldIndex {
    /// Id assigned by the index manager on creation.
    pub const UNKNOWN_ID: i32 = -1;

    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: Self::UNKNOWN_ID,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub(crate) fn with_index_id(mut self, index_id: i32) -> Self {
        self.index_id = index_id;
        self
    }

    pub fn index_id(&self) -> i32 {
        self.index_id
    }

    pub fn collection_group(&self) -> &str {
        &self.collection_group
    }

    pub fn segments(&self) -> &[IndexSegment] {
        &self.segments
    }

    /// Same collection group and segments, ignoring the id.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}
