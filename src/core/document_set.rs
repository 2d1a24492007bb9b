use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::query::{comparator, OrderBy};
use crate::model::{DocumentKey, MutableDocument};

/// Documents of a view, ordered by the query's comparator with a key
/// lookup on the side.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    order_by: Vec<OrderBy>,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(order_by: Vec<OrderBy>) -> Self {
        Self {
            order_by,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Ordered by key only.
    pub fn by_key_order() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.keys()
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        comparator(&self.order_by)(left, right)
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        let compare = comparator(&self.order_by);
        self.sorted
            .binary_search_by(|candidate| compare(candidate, document))
    }

    /// Inserts `document`, replacing any previous entry with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.by_key.remove(key) {
            let compare = comparator(&self.order_by);
            if let Ok(index) = self
                .sorted
                .binary_search_by(|candidate| compare(candidate, &existing))
            {
                self.sorted.remove(index);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<MutableDocument> {
        self.sorted.clone()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted.len() == other.sorted.len()
            && self
                .sorted
                .iter()
                .zip(other.sorted.iter())
                .all(|(l, r)| l.key() == r.key() && l.data().is_equal(r.data()))
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a MutableDocument;
    type IntoIter = std::slice::Iter<'a, MutableDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.sorted.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::OrderDirection;
    use crate::model::{FieldPath, SnapshotVersion};
    use crate::value::{ObjectValue, Value};

    fn doc(path: &str, n: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), Value::from(n));
        MutableDocument::new_found(DocumentKey::from_string(path).unwrap(), SnapshotVersion::min(), data)
    }

    fn by_n() -> DocumentSet {
        DocumentSet::new(vec![OrderBy::new(
            FieldPath::from_dot_separated("n").unwrap(),
            OrderDirection::Ascending,
        )])
    }

    #[test]
    fn keeps_comparator_order() {
        let mut set = by_n();
        set.add(doc("c/a", 3));
        set.add(doc("c/b", 1));
        set.add(doc("c/c", 2));
        let ids: Vec<&str> = set.iter().map(|d| d.key().id()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/c").unwrap()), Some(1));
    }

    #[test]
    fn add_replaces_existing_entry() {
        let mut set = by_n();
        set.add(doc("c/a", 3));
        set.add(doc("c/b", 1));
        set.add(doc("c/a", 0));
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().unwrap().key().id(), "a");
    }

    #[test]
    fn delete_removes_entry() {
        let mut set = by_n();
        set.add(doc("c/a", 3));
        set.delete(&DocumentKey::from_string("c/a").unwrap());
        assert!(set.is_empty());
        assert!(!set.has(&DocumentKey::from_string("c/a").unwrap()));
    }
}
