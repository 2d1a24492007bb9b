use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    document: MutableDocument,
    size: usize,
}

/// Last known server state of every cached document, keyed by path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteDocumentCache {
    entries: BTreeMap<DocumentKey, CacheEntry>,
    byte_size: usize,
}

impl RemoteDocumentCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate serialized size of all cached documents.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub(crate) fn add(&mut self, document: MutableDocument) {
        let size = estimate_size(&document);
        let key = document.key().clone();
        if let Some(previous) = self.entries.insert(key, CacheEntry { document, size }) {
            self.byte_size -= previous.size;
        }
        self.byte_size += size;
    }

    /// Drops the entry. Returns the bytes freed.
    pub(crate) fn remove(&mut self, key: &DocumentKey) -> usize {
        match self.entries.remove(key) {
            Some(entry) => {
                self.byte_size -= entry.size;
                entry.size
            }
            None => 0,
        }
    }

    /// Cached document, or an invalid placeholder when nothing is cached.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.entries
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_all<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `since_read_time`.
    pub fn get_documents_matching_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> (BTreeMap<DocumentKey, MutableDocument>, usize) {
        let mut scanned = 0;
        let mut results = BTreeMap::new();
        let start = DocumentKey::first_in_collection(collection);
        for (key, entry) in self.entries.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            scanned += 1;
            if entry.document.read_time() > since_read_time {
                results.insert(key.clone(), entry.document.clone());
            }
        }
        (results, scanned)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.entries.keys()
    }

    pub(crate) fn documents(&self) -> impl Iterator<Item = &MutableDocument> {
        self.entries.values().map(|entry| &entry.document)
    }
}

fn estimate_size(document: &MutableDocument) -> usize {
    serde_json::to_vec(document)
        .map(|bytes| bytes.len())
        .unwrap_or_default()
}
