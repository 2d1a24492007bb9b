use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// One collapsed mutation per document with pending writes, tagged with
/// the largest batch that contributed to it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| self.overlays.get(key).map(|o| (key.clone(), o.clone())))
            .collect()
    }

    /// Replaces the overlay of each key. `None` clears it.
    pub(crate) fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Option<Mutation>>,
    ) {
        for (key, mutation) in overlays {
            self.remove_overlay(&key);
            if let Some(mutation) = mutation {
                self.keys_by_batch
                    .entry(largest_batch_id)
                    .or_default()
                    .insert(key.clone());
                self.overlays
                    .insert(key, Overlay::new(largest_batch_id, mutation));
            }
        }
    }

    /// Clears overlays last written by `batch_id`.
    pub(crate) fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        if let Some(keys) = self.keys_by_batch.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.remove(key) {
            if let Some(keys) = self.keys_by_batch.get_mut(&existing.largest_batch_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch.remove(&existing.largest_batch_id);
                }
            }
        }
    }

    /// Overlays for documents directly inside `collection`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = DocumentKey::first_in_collection(collection);
        self.overlays
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                key.path().len() == collection.len() + 1 && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}
