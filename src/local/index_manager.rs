use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{FilterOperator, Target};
use crate::model::{DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument, ResourcePath};
use crate::value::{compare_values, Value};

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    /// An index narrows the candidates, but results must be re-filtered and
    /// limits cannot be pushed down.
    Partial,
    Full,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    values: Vec<Value>,
    key: DocumentKey,
}

impl IndexEntry {
    fn compare_values_with(&self, values: &[Value]) -> Ordering {
        for (left, right) in self.values.iter().zip(values) {
            match compare_values(left, right) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.values.len().cmp(&values.len())
    }
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_values_with(&other.values)
            .then_with(|| self.key.cmp(&other.key))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct IndexData {
    entries: BTreeSet<IndexEntry>,
    values_by_key: BTreeMap<DocumentKey, Vec<Value>>,
}

/// Collection-parent index plus the client-side field indexes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    field_indexes: BTreeMap<i32, FieldIndex>,
    index_data: BTreeMap<i32, IndexData>,
    next_index_id: i32,
}

impl IndexManager {
    /// Records that `collection_path` exists, so collection-group queries
    /// can find it.
    pub(crate) fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    /// Parent paths of every collection named `collection_id`.
    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers `index`. An existing index with the same definition is
    /// returned unchanged. Entries are filled by [`Self::update_index_entries`].
    pub(crate) fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex {
        if let Some(existing) = self
            .field_indexes
            .values()
            .find(|existing| existing.same_definition(&index))
        {
            return existing.clone();
        }
        self.next_index_id += 1;
        let index = index.with_index_id(self.next_index_id);
        self.field_indexes.insert(index.index_id(), index.clone());
        self.index_data.insert(index.index_id(), IndexData::default());
        index
    }

    pub(crate) fn delete_field_index(&mut self, index_id: i32) {
        self.field_indexes.remove(&index_id);
        self.index_data.remove(&index_id);
    }

    pub fn field_indexes(&self) -> Vec<FieldIndex> {
        self.field_indexes.values().cloned().collect()
    }

    pub fn get_field_indexes(&self, collection_group: &str) -> Vec<&FieldIndex> {
        self.field_indexes
            .values()
            .filter(|index| index.collection_group() == collection_group)
            .collect()
    }

    /// Brings every index over the document's collection group in line with
    /// its current contents.
    pub(crate) fn update_index_entries(&mut self, document: &MutableDocument) {
        let key = document.key();
        for index in self.field_indexes.values() {
            if index.collection_group() != key.collection_group() {
                continue;
            }
            let Some(data) = self.index_data.get_mut(&index.index_id()) else {
                continue;
            };
            if let Some(values) = data.values_by_key.remove(key) {
                data.entries.remove(&IndexEntry {
                    values,
                    key: key.clone(),
                });
            }
            if !document.is_found_document() {
                continue;
            }
            let values: Option<Vec<Value>> = index
                .segments()
                .iter()
                .map(|segment| document.field(&segment.field_path).cloned())
                .collect();
            if let Some(values) = values {
                data.values_by_key.insert(key.clone(), values.clone());
                data.entries.insert(IndexEntry {
                    values,
                    key: key.clone(),
                });
            }
        }
    }

    pub(crate) fn remove_document(&mut self, key: &DocumentKey) {
        for data in self.index_data.values_mut() {
            if let Some(values) = data.values_by_key.remove(key) {
                data.entries.remove(&IndexEntry {
                    values,
                    key: key.clone(),
                });
            }
        }
    }

    pub fn get_index_type(&self, target: &Target) -> IndexType {
        self.select_index(target)
            .map(|(_, index_type)| index_type)
            .unwrap_or(IndexType::None)
    }

    /// Candidate keys for `target` from the best matching index. Every
    /// document matching the target is among them; callers must re-filter.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<BTreeSet<DocumentKey>> {
        let (index, _) = self.select_index(target)?;
        let data = self.index_data.get(&index.index_id())?;
        let first_field = &index.segments().first()?.field_path;

        let mut equal_values: Option<Vec<Value>> = None;
        for filter in target.filters_on(first_field) {
            match filter.operator() {
                FilterOperator::Equal => equal_values = Some(vec![filter.value().clone()]),
                FilterOperator::In => {
                    equal_values = filter.value().as_array().map(|values| values.to_vec())
                }
                _ => {}
            }
        }

        let keys: Vec<&DocumentKey> = match equal_values {
            Some(values) => values
                .iter()
                .flat_map(|value| {
                    let start = IndexEntry {
                        values: vec![value.clone()],
                        key: DocumentKey::min_key(),
                    };
                    data.entries
                        .range(start..)
                        .take_while(move |entry| {
                            compare_values(&entry.values[0], value) == Ordering::Equal
                        })
                        .map(|entry| &entry.key)
                })
                .collect(),
            None => data.entries.iter().map(|entry| &entry.key).collect(),
        };

        let in_path = |key: &DocumentKey| {
            target.collection_group().is_some() || &key.collection_path() == target.path()
        };
        Some(keys.into_iter().filter(|key| in_path(key)).cloned().collect())
    }

    /// Creates an index covering every field `target` filters or sorts on,
    /// unless one already serves it fully.
    pub(crate) fn create_target_index(&mut self, target: &Target) -> Option<FieldIndex> {
        if self.get_index_type(target) == IndexType::Full {
            return None;
        }
        let collection_group = target.collection_id()?.to_string();
        let mut segments: Vec<IndexSegment> = Vec::new();
        let mut push = |field: &FieldPath, kind: IndexKind| {
            if !field.is_key_field() && !segments.iter().any(|s| &s.field_path == field) {
                segments.push(IndexSegment::new(field.clone(), kind));
            }
        };
        for filter in target.filters() {
            if matches!(filter.operator(), FilterOperator::Equal | FilterOperator::In) {
                push(filter.field(), IndexKind::Ascending);
            }
        }
        for filter in target.filters() {
            push(filter.field(), IndexKind::Ascending);
        }
        for order in target.order_by() {
            let kind = match order.direction() {
                crate::core::OrderDirection::Ascending => IndexKind::Ascending,
                crate::core::OrderDirection::Descending => IndexKind::Descending,
            };
            push(order.field(), kind);
        }
        if segments.is_empty() {
            return None;
        }
        Some(self.add_field_index(FieldIndex::new(collection_group, segments)))
    }

    fn select_index(&self, target: &Target) -> Option<(&FieldIndex, IndexType)> {
        if target.is_document_target() {
            return None;
        }
        let collection_id = target.collection_id()?;
        let required: BTreeSet<&FieldPath> = target
            .filters()
            .iter()
            .map(|filter| filter.field())
            .chain(target.order_by().iter().map(|order| order.field()))
            .filter(|field| !field.is_key_field())
            .collect();

        let mut best: Option<(&FieldIndex, IndexType)> = None;
        for index in self.get_field_indexes(collection_id) {
            let covered: BTreeSet<&FieldPath> =
                index.segments().iter().map(|s| &s.field_path).collect();
            // Documents missing an indexed field have no entry, so every
            // indexed field must be one the target requires.
            if covered.is_empty() || !covered.is_subset(&required) {
                continue;
            }
            let index_type = if required.is_subset(&covered) {
                IndexType::Full
            } else {
                IndexType::Partial
            };
            let better = match best {
                None => true,
                Some((current, current_type)) => {
                    (index_type == IndexType::Full && current_type == IndexType::Partial)
                        || (index_type == current_type
                            && index.segments().len() > current.segments().len())
                }
            };
            if better {
                best = Some((index, index_type));
            }
        }
        best
    }
}
