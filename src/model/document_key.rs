use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{invalid_argument, SyncResult};
use crate::model::{DatabaseId, ResourcePath};

/// Stable identity of a document: a path with an even number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> SyncResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments): '{path}'"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> SyncResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    /// Sorts before every valid key. Only used as a range bound.
    pub(crate) fn min_key() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// Smallest key that can live under `collection`.
    pub(crate) fn first_in_collection(collection: &ResourcePath) -> Self {
        Self {
            path: collection.child([""]),
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection directly containing the document.
    pub fn collection_group(&self) -> &str {
        let len = self.path.len();
        if len < 2 {
            return "";
        }
        self.path.segment(len - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// Fully qualified resource name, e.g. `projects/p/databases/d/documents/a/b`.
    pub fn qualified_name(&self, database_id: &DatabaseId) -> String {
        format!(
            "{}/{}",
            database_id.documents_root(),
            self.path.canonical_string()
        )
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.canonical_string())
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DocumentKey::from_string(&raw).map_err(serde::de::Error::custom)
    }
}
