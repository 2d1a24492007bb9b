//! Turns application data into mutations. Sentinel values become field
//! transforms or masked deletes and never reach the cache.

use std::collections::BTreeMap;

use crate::api::options::SetOptions;
use crate::error::{invalid_argument, SyncResult};
use crate::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::value::{ObjectValue, SentinelValue, Value, ValueKind};

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSetData {
    pub data: ObjectValue,
    /// `Some` for merges; the write then only touches these fields.
    pub field_mask: Option<FieldMask>,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedSetData {
    pub fn to_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        match self.field_mask {
            Some(mask) => Mutation::Patch {
                key,
                data: self.data,
                mask,
                precondition,
                field_transforms: self.field_transforms,
            },
            None => Mutation::Set {
                key,
                value: self.data,
                precondition,
                field_transforms: self.field_transforms,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedUpdateData {
    pub data: ObjectValue,
    pub field_mask: FieldMask,
    pub field_transforms: Vec<FieldTransform>,
}

impl ParsedUpdateData {
    pub fn to_mutation(self, key: DocumentKey, precondition: Precondition) -> Mutation {
        Mutation::Patch {
            key,
            data: self.data,
            mask: self.field_mask,
            precondition,
            field_transforms: self.field_transforms,
        }
    }
}

struct ParseContext {
    method: &'static str,
    allow_delete: bool,
    field_mask: Vec<FieldPath>,
    field_transforms: Vec<FieldTransform>,
}

impl ParseContext {
    fn new(method: &'static str, allow_delete: bool) -> Self {
        Self {
            method,
            allow_delete,
            field_mask: Vec::new(),
            field_transforms: Vec::new(),
        }
    }

    fn contains(&self, path: &FieldPath) -> bool {
        self.field_mask.iter().any(|field| path.is_prefix_of(field))
            || self
                .field_transforms
                .iter()
                .any(|transform| path.is_prefix_of(&transform.field))
    }
}

pub fn parse_set_data(data: BTreeMap<String, Value>, options: &SetOptions) -> SyncResult<ParsedSetData> {
    let method = if options.is_merge() { "set() with merge" } else { "set()" };
    let mut context = ParseContext::new(method, options.is_merge());
    let fields = parse_object(&data, None, &mut context)?;
    let data = ObjectValue::from_map(fields);

    if let Some(merge_fields) = &options.merge_fields {
        for field in merge_fields {
            if !context.contains(field) {
                return Err(invalid_argument(format!(
                    "Field '{}' is specified in merge_fields but missing from the provided data",
                    field.canonical_string()
                )));
            }
        }
        let mask = FieldMask::new(merge_fields.clone());
        let field_transforms = context
            .field_transforms
            .into_iter()
            .filter(|transform| mask.covers(&transform.field))
            .collect();
        return Ok(ParsedSetData {
            data,
            field_mask: Some(mask),
            field_transforms,
        });
    }

    let field_mask = options
        .merge
        .then(|| FieldMask::new(std::mem::take(&mut context.field_mask)));
    Ok(ParsedSetData {
        data,
        field_mask,
        field_transforms: context.field_transforms,
    })
}

/// Parses `update` data. Keys are dot-separated field paths; a map value
/// replaces the whole field rather than merging into it.
pub fn parse_update_data(data: BTreeMap<String, Value>) -> SyncResult<ParsedUpdateData> {
    let mut context = ParseContext::new("update()", false);
    let mut object = ObjectValue::empty();
    let mut mask = Vec::new();
    for (field, value) in &data {
        let path = FieldPath::from_dot_separated(field)?;
        if matches!(value.kind(), ValueKind::Sentinel(SentinelValue::Delete)) {
            mask.push(path);
            continue;
        }
        if let Some(parsed) = parse_value(value, &path, &mut context)? {
            object.set(&path, parsed);
            mask.push(path);
        }
    }
    if mask.is_empty() && context.field_transforms.is_empty() {
        return Err(invalid_argument("update() requires at least one field"));
    }
    Ok(ParsedUpdateData {
        data: object,
        field_mask: FieldMask::new(mask),
        field_transforms: context.field_transforms,
    })
}

fn parse_object(
    data: &BTreeMap<String, Value>,
    path: Option<&FieldPath>,
    context: &mut ParseContext,
) -> SyncResult<BTreeMap<String, Value>> {
    if data.is_empty() {
        if let Some(path) = path {
            context.field_mask.push(path.clone());
        }
        return Ok(BTreeMap::new());
    }
    let mut fields = BTreeMap::new();
    for (key, value) in data {
        let child = match path {
            Some(parent) => parent.child(key.clone()),
            None => FieldPath::new([key.clone()])?,
        };
        if let Some(parsed) = parse_value(value, &child, context)? {
            fields.insert(key.clone(), parsed);
        }
    }
    Ok(fields)
}

fn parse_value(value: &Value, path: &FieldPath, context: &mut ParseContext) -> SyncResult<Option<Value>> {
    match value.kind() {
        ValueKind::Sentinel(sentinel) => {
            parse_sentinel(sentinel, path, context)?;
            Ok(None)
        }
        ValueKind::Map(map) => Ok(Some(Value::from_map(parse_object(
            map.fields(),
            Some(path),
            context,
        )?))),
        ValueKind::ServerTimestamp { .. } => Err(invalid_argument(format!(
            "Field '{}' holds a pending server timestamp, which cannot be written",
            path.canonical_string()
        ))),
        ValueKind::Array(array) => {
            for element in array.values() {
                assert_no_sentinel(element, path)?;
            }
            context.field_mask.push(path.clone());
            Ok(Some(value.clone()))
        }
        _ => {
            context.field_mask.push(path.clone());
            Ok(Some(value.clone()))
        }
    }
}

fn parse_sentinel(sentinel: &SentinelValue, path: &FieldPath, context: &mut ParseContext) -> SyncResult<()> {
    let operation = match sentinel {
        SentinelValue::Delete => {
            if !context.allow_delete {
                return Err(invalid_argument(format!(
                    "delete_field() cannot be used with {} (field '{}')",
                    context.method,
                    path.canonical_string()
                )));
            }
            context.field_mask.push(path.clone());
            return Ok(());
        }
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) => {
            elements.iter().try_for_each(|element| assert_no_sentinel(element, path))?;
            TransformOperation::ArrayUnion(elements.clone())
        }
        SentinelValue::ArrayRemove(elements) => {
            elements.iter().try_for_each(|element| assert_no_sentinel(element, path))?;
            TransformOperation::ArrayRemove(elements.clone())
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument(format!(
                    "increment() on '{}' requires a numeric operand",
                    path.canonical_string()
                )));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
    };
    context
        .field_transforms
        .push(FieldTransform::new(path.clone(), operation));
    Ok(())
}

fn assert_no_sentinel(value: &Value, path: &FieldPath) -> SyncResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Sentinel values cannot be used inside arrays (field '{}')",
            path.canonical_string()
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| assert_no_sentinel(element, path)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| assert_no_sentinel(element, path)),
        _ => Ok(()),
    }
}
