use std::collections::BTreeSet;

use crate::error::{invalid_argument, SyncResult};
use crate::model::{FieldPath, Precondition};

/// Where a one-shot read takes its answer from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GetSource {
    /// The authority when reachable, the cache otherwise.
    #[default]
    Default,
    /// The authority only; fails while offline.
    Server,
    Cache,
}

/// Controls how `set` writes combine with the existing document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    /// Merge every field present in the data instead of replacing the
    /// document.
    pub merge: bool,
    /// Merge only these fields. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
    pub precondition: Precondition,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            ..Self::default()
        }
    }

    pub fn merge_fields<I>(fields: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut seen = BTreeSet::new();
        let unique: Vec<FieldPath> = fields
            .into_iter()
            .filter(|field| seen.insert(field.clone()))
            .collect();
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge_fields: Some(unique),
            ..Self::default()
        })
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_fields_deduplicates() {
        let path = FieldPath::from_dot_separated("a.b").unwrap();
        let options = SetOptions::merge_fields(vec![path.clone(), path]).unwrap();
        assert_eq!(options.merge_fields.map(|fields| fields.len()), Some(1));
        assert!(SetOptions::merge_fields(Vec::new()).is_err());
    }
}
