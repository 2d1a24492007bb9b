use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{invalid_argument, SyncError, SyncResult};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::remote::rpc_error::map_status;
use crate::remote::serializer::JsonSerializer;

/// One message received on the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

impl WatchTargetChangeState {
    fn as_wire(&self) -> &'static str {
        match self {
            WatchTargetChangeState::NoChange => "NO_CHANGE",
            WatchTargetChangeState::Added => "ADD",
            WatchTargetChangeState::Removed => "REMOVE",
            WatchTargetChangeState::Current => "CURRENT",
            WatchTargetChangeState::Reset => "RESET",
        }
    }

    fn from_wire(value: Option<&str>) -> SyncResult<Self> {
        match value {
            None | Some("NO_CHANGE") | Some("TARGET_CHANGE_TYPE_UNSPECIFIED") => {
                Ok(WatchTargetChangeState::NoChange)
            }
            Some("ADD") => Ok(WatchTargetChangeState::Added),
            Some("REMOVE") => Ok(WatchTargetChangeState::Removed),
            Some("CURRENT") => Ok(WatchTargetChangeState::Current),
            Some("RESET") => Ok(WatchTargetChangeState::Reset),
            Some(other) => Err(invalid_argument(format!("Unknown target change type '{other}'"))),
        }
    }
}

/// State change of one or more targets. An empty `target_ids` list on a
/// `NoChange` means the change applies to every active target.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Set when the server removed the targets because of an error.
    pub cause: Option<SyncError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: SyncError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered, changed in, left or was deleted from some targets.
///
/// `document` is a found document for changes, a `NoDocument` for deletes
/// and `None` when the document merely stopped matching.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<MutableDocument>,
}

/// Bloom filter over the names of the documents the server still has.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

pub fn decode_watch_change(serializer: &JsonSerializer, value: &JsonValue) -> SyncResult<WatchChange> {
    if let Some(change) = value.get("targetChange") {
        return decode_target_change(serializer, change);
    }
    if let Some(change) = value.get("documentChange") {
        let document = change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange without document"))?;
        let document = serializer.decode_document(document)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: decode_target_ids(change.get("targetIds"))?,
            removed_target_ids: decode_target_ids(change.get("removedTargetIds"))?,
            key: document.key().clone(),
            document: Some(document),
        }));
    }
    if let Some(change) = value.get("documentDelete") {
        let key = decode_document_name(serializer, change)?;
        let read_time = serializer.decode_optional_version(change.get("readTime"))?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: decode_target_ids(change.get("removedTargetIds"))?,
            document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
            key,
        }));
    }
    if let Some(change) = value.get("documentRemove") {
        let key = decode_document_name(serializer, change)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: decode_target_ids(change.get("removedTargetIds"))?,
            key,
            document: None,
        }));
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter(serializer, filter);
    }
    Err(invalid_argument("Unknown listen response"))
}

/// Global snapshot version carried by a listen response. Only target
/// changes addressed to every target advance it.
pub fn decode_snapshot_version(
    serializer: &JsonSerializer,
    value: &JsonValue,
) -> SyncResult<SnapshotVersion> {
    let Some(change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !decode_target_ids(change.get("targetIds"))?.is_empty() {
        return Ok(SnapshotVersion::min());
    }
    serializer.decode_optional_version(change.get("readTime"))
}

fn decode_target_change(serializer: &JsonSerializer, change: &JsonValue) -> SyncResult<WatchChange> {
    let state = WatchTargetChangeState::from_wire(
        change.get("targetChangeType").and_then(JsonValue::as_str),
    )?;
    let cause = match change.get("cause") {
        Some(cause) if !cause.is_null() => {
            let code = cause.get("code").and_then(JsonValue::as_i64).unwrap_or(2);
            let message = cause
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            Some(map_status(code, message))
        }
        _ => None,
    };
    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: decode_target_ids(change.get("targetIds"))?,
        resume_token: serializer.decode_bytes(change.get("resumeToken"))?,
        cause,
    }))
}

fn decode_filter(serializer: &JsonSerializer, filter: &JsonValue) -> SyncResult<WatchChange> {
    let target_id = filter
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("Existence filter without targetId"))?;
    let count = filter.get("count").and_then(JsonValue::as_i64).unwrap_or(0);
    let unchanged_names = match filter.get("unchangedNames") {
        Some(names) if !names.is_null() => {
            let bits = names.get("bits");
            Some(BloomFilterPayload {
                bitmap: serializer.decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
                padding: bits
                    .and_then(|bits| bits.get("padding"))
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0) as i32,
                hash_count: names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
            })
        }
        _ => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id: target_id as TargetId,
        count: count as i32,
        unchanged_names,
    }))
}

fn decode_document_name(serializer: &JsonSerializer, change: &JsonValue) -> SyncResult<DocumentKey> {
    let name = change
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Document change without document name"))?;
    serializer.decode_key(name)
}

fn decode_target_ids(value: Option<&JsonValue>) -> SyncResult<Vec<TargetId>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| invalid_argument("Target ids must be an array"))?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_i64()
                .map(|id| id as TargetId)
                .ok_or_else(|| invalid_argument("Target id must be an integer"))
        })
        .collect()
}

/// Encodes a watch change the way the remote authority sends it. Used by
/// in-process authorities.
pub fn encode_watch_change(
    serializer: &JsonSerializer,
    change: &WatchChange,
    read_time: Option<SnapshotVersion>,
) -> JsonValue {
    match change {
        WatchChange::TargetChange(change) => {
            let mut encoded = JsonMap::new();
            encoded.insert("targetChangeType".into(), json!(change.state.as_wire()));
            encoded.insert("targetIds".into(), json!(change.target_ids));
            if !change.resume_token.is_empty() {
                encoded.insert(
                    "resumeToken".into(),
                    json!(serializer.encode_bytes(&change.resume_token)),
                );
            }
            if let Some(read_time) = read_time {
                encoded.insert("readTime".into(), json!(serializer.encode_version(&read_time)));
            }
            if let Some(cause) = &change.cause {
                encoded.insert(
                    "cause".into(),
                    json!({ "code": cause.code.to_status(), "message": cause.message() }),
                );
            }
            json!({ "targetChange": JsonValue::Object(encoded) })
        }
        WatchChange::Document(change) => match &change.document {
            Some(document) if document.is_found_document() => json!({
                "documentChange": {
                    "document": serializer.encode_document(document),
                    "targetIds": change.updated_target_ids,
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            Some(document) => json!({
                "documentDelete": {
                    "document": serializer.encode_key(&change.key),
                    "readTime": serializer.encode_version(&document.version()),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            None => json!({
                "documentRemove": {
                    "document": serializer.encode_key(&change.key),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
        },
        WatchChange::ExistenceFilter(filter) => {
            let mut encoded = JsonMap::new();
            encoded.insert("targetId".into(), json!(filter.target_id));
            encoded.insert("count".into(), json!(filter.count));
            if let Some(names) = &filter.unchanged_names {
                encoded.insert(
                    "unchangedNames".into(),
                    json!({
                        "bits": {
                            "bitmap": serializer.encode_bytes(&names.bitmap),
                            "padding": names.padding,
                        },
                        "hashCount": names.hash_count,
                    }),
                );
            }
            json!({ "filter": JsonValue::Object(encoded) })
        }
    }
}
