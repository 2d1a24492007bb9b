use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{FieldMask, FieldPath};
use crate::value::{values_equal, Value, ValueKind};

/// Mutable root map of a document's fields with nested-path access.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::from_map(self.fields.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field-by-field equality under value semantics.
    pub fn is_equal(&self, other: &ObjectValue) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment).map(Value::kind) {
                Some(ValueKind::Map(map)) => current = map.fields(),
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Sets the value at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::from_map(BTreeMap::new()));
            if !matches!(entry.kind(), ValueKind::Map(_)) {
                *entry = Value::from_map(BTreeMap::new());
            }
            current = match entry.as_map_mut() {
                Some(map) => map.fields_mut(),
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).and_then(Value::as_map_mut) {
                Some(map) => map.fields_mut(),
                None => return,
            };
        }
        current.remove(last);
    }

    /// Applies sets (`Some`) and deletes (`None`) in iteration order.
    pub fn set_all<I>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (FieldPath, Option<Value>)>,
    {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of the object. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, None, &mut paths);
        FieldMask::new(paths)
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, Value>,
    prefix: Option<&FieldPath>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => FieldPath::from_segment(key.clone()),
        };
        match value.kind() {
            ValueKind::Map(map) if !map.is_empty() => {
                collect_leaf_paths(map.fields(), Some(&path), out)
            }
            _ => out.push(path),
        }
    }
}

impl From<BTreeMap<String, Value>> for ObjectValue {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self::from_map(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn sets_and_reads_nested_fields() {
        let mut object = ObjectValue::empty();
        object.set(&path("address.city"), Value::from("Lisbon"));
        object.set(&path("age"), Value::from(30));
        assert_eq!(object.field(&path("address.city")), Some(&Value::from("Lisbon")));
        assert_eq!(object.field(&path("age")), Some(&Value::from(30)));
        assert!(object.field(&path("address.zip")).is_none());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), Value::from(1));
        object.set(&path("a.b"), Value::from(2));
        assert_eq!(object.field(&path("a.b")), Some(&Value::from(2)));
    }

    #[test]
    fn delete_removes_leaf_only() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), Value::from(1));
        object.set(&path("a.c"), Value::from(2));
        object.delete(&path("a.b"));
        object.delete(&path("missing.field"));
        assert!(object.field(&path("a.b")).is_none());
        assert_eq!(object.field(&path("a.c")), Some(&Value::from(2)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), Value::from(1));
        object.set(&path("c"), Value::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        assert_eq!(mask.paths(), &[path("a.b"), path("c")]);
    }
}
