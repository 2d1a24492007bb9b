use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::value::{values_equal, ObjectValue, Value, ValueKind};

/// Sorted, de-duplicated set of field paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    paths: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut paths: Vec<FieldPath>) -> Self {
        paths.sort();
        paths.dedup();
        Self { paths }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> &[FieldPath] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// True when `path` is one of the mask's paths or nested below one.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|candidate| candidate.is_prefix_of(path))
    }

    pub fn union<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut paths = self.paths.clone();
        paths.extend(extra);
        Self::new(paths)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Value),
}

impl TransformOperation {
    /// Optimistic result computed against the current local value.
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                Value::pending_server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.iter().any(|existing| values_equal(existing, element)) {
                        values.push(element.clone());
                    }
                }
                Value::from_array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let values = coerce_array(previous)
                    .into_iter()
                    .filter(|existing| !elements.iter().any(|element| values_equal(existing, element)))
                    .collect();
                Value::from_array(values)
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .or_else(|| previous.cloned())
                    .unwrap_or_else(|| Value::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Final value once the authority acknowledged the write.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&Value>,
        transform_result: Option<&Value>,
    ) -> Value {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            TransformOperation::ServerTimestamp => {
                transform_result.cloned().unwrap_or_else(Value::null)
            }
            TransformOperation::NumericIncrement(_) => match transform_result {
                Some(result) => result.clone(),
                None => self.apply_to_local_view(previous, Timestamp::default()),
            },
        }
    }

    /// Value to pin in a base mutation so later replays see the same input.
    /// Only increments of a non-numeric field need one: they start from 0.
    pub fn compute_base_value(&self, previous: Option<&Value>) -> Option<Value> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => None,
                _ => Some(Value::from_integer(0)),
            },
            _ => None,
        }
    }
}

fn coerce_array(previous: Option<&Value>) -> Vec<Value> {
    previous
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .unwrap_or_default()
}

fn add_numbers(base: &Value, operand: &Value) -> Value {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            Value::from_integer(left.saturating_add(*right))
        }
        _ => {
            let left = base.as_double().unwrap_or(0.0);
            let right = operand.as_double().unwrap_or(0.0);
            Value::from_double(left + right)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Per-mutation acknowledgement from the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<Value>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<Value>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A single write to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes the fields in `mask`; a masked path missing from `data` is deleted.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asserts a precondition without changing the document.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn with_field_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => *field_transforms = transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    /// Fields a patch writes. `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch { mask, .. } => Some(mask.clone()),
            _ => None,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transforms =
                    server_transform_results(field_transforms, document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transforms);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The patch was applied remotely to contents we never saw.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transforms =
                    server_transform_results(field_transforms, document, &result.transform_results);
                let mut patched = document.data().clone();
                apply_patch(&mut patched, mask, data);
                patched.set_all(transforms);
                document
                    .convert_to_found_document(result.version, patched)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the mutation optimistically. Returns the accumulated mask of
    /// changed fields, or `None` when the whole document changed.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transforms =
                    local_transform_results(field_transforms, document, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                mask,
                field_transforms,
                ..
            } => {
                let transforms =
                    local_transform_results(field_transforms, document, local_write_time);
                let mut patched = document.data().clone();
                apply_patch(&mut patched, mask, data);
                patched.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, patched)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous.union(
                        mask.paths()
                            .iter()
                            .cloned()
                            .chain(field_transforms.iter().map(|t| t.field.clone())),
                    )
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Values a later replay must start from, as an object of field paths.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        for transform in self.field_transforms() {
            let existing = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field, value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }
}

fn apply_patch(target: &mut ObjectValue, mask: &FieldMask, data: &ObjectValue) {
    for path in mask.paths() {
        match data.field(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    results: &[Value],
) -> Vec<(FieldPath, Option<Value>)> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_remote_document(previous, results.get(index));
            (transform.field.clone(), Some(value))
        })
        .collect()
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> Vec<(FieldPath, Option<Value>)> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(&transform.field);
            let value = transform
                .operation
                .apply_to_local_view(previous, local_write_time);
            (transform.field.clone(), Some(value))
        })
        .collect()
}

/// Derives the single mutation that turns the remote document into
/// `document`, given the fields changed by pending writes. `None` mask means
/// every field changed.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };
    if mask.is_empty() {
        return None;
    }

    let mut patch = ObjectValue::empty();
    let mut paths = Vec::new();
    for path in mask.paths() {
        let mut path = path.clone();
        let mut value = document.field(&path).cloned();
        if value.is_none() {
            // A removed nested field is written back through its parent.
            if let Some(parent) = path.parent() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        if paths.contains(&path) {
            continue;
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        paths.push(path);
    }
    Some(Mutation::Patch {
        key: document.key().clone(),
        data: patch,
        mask: FieldMask::new(paths),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}
