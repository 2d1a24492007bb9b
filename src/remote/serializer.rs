use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::core::Target;
use crate::error::{invalid_argument, SyncResult};
use crate::local::TargetData;
use crate::model::{
    DatabaseId, DocumentKey, FieldPath, FieldTransform, GeoPoint, MutableDocument, Mutation,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, TargetId, Timestamp,
    TransformOperation,
};
use crate::value::{BytesValue, ObjectValue, Value, ValueKind};

/// Acknowledgement received on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// Converts between the model and the JSON messages exchanged with the
/// remote authority. Values use a tagged encoding (`{"integerValue": "1"}`).
#[derive(Clone, Debug)]
pub struct JsonSerializer {
    database_id: DatabaseId,
}

impl JsonSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn encode_key(&self, key: &DocumentKey) -> String {
        key.qualified_name(&self.database_id)
    }

    pub fn decode_key(&self, name: &str) -> SyncResult<DocumentKey> {
        let root = self.database_id.documents_root();
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!("Document name '{name}' is not part of {root}"))
            })?;
        DocumentKey::from_path(ResourcePath::from_string(relative)?)
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        version.timestamp().to_rfc3339()
    }

    pub fn decode_version(&self, value: &JsonValue) -> SyncResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected an RFC 3339 timestamp string"))?;
        Ok(SnapshotVersion::new(Timestamp::from_rfc3339(text)?))
    }

    /// Decodes an optional version field, defaulting to the minimum version.
    pub fn decode_optional_version(&self, value: Option<&JsonValue>) -> SyncResult<SnapshotVersion> {
        match value {
            Some(JsonValue::Null) | None => Ok(SnapshotVersion::min()),
            Some(value) => self.decode_version(value),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> SyncResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => BASE64_STANDARD
                .decode(text)
                .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    pub fn encode_value(&self, value: &Value) -> JsonValue {
        encode_value(value, &self.database_id)
    }

    pub fn decode_value(&self, value: &JsonValue) -> SyncResult<Value> {
        decode_value(value, self)
    }

    pub fn encode_fields(&self, object: &ObjectValue) -> JsonValue {
        encode_map_fields(object.fields(), &self.database_id)
    }

    /// Decodes the `fields` object of a document or map value.
    pub fn decode_fields(&self, value: Option<&JsonValue>) -> SyncResult<ObjectValue> {
        let Some(value) = value else {
            return Ok(ObjectValue::empty());
        };
        let fields = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut decoded = BTreeMap::new();
        for (name, field) in fields {
            decoded.insert(name.clone(), self.decode_value(field)?);
        }
        Ok(ObjectValue::from_map(decoded))
    }

    /// Decodes a `{name, fields, updateTime}` document.
    pub fn decode_document(&self, value: &JsonValue) -> SyncResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.decode_key(name)?;
        let version = self.decode_optional_version(value.get("updateTime"))?;
        let data = self.decode_fields(value.get("fields"))?;
        Ok(MutableDocument::new_found(key, version, data))
    }

    pub fn encode_document(&self, document: &MutableDocument) -> JsonValue {
        json!({
            "name": self.encode_key(document.key()),
            "fields": self.encode_fields(document.data()),
            "updateTime": self.encode_version(&document.version()),
        })
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert("update".into(), self.encode_update_document(key, value));
            }
            Mutation::Patch { key, data, mask, .. } => {
                write.insert("update".into(), self.encode_update_document(key, data));
                let paths: Vec<String> = mask.paths().iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".into(), JsonValue::String(self.encode_key(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".into(), JsonValue::String(self.encode_key(key)));
            }
        }

        let transforms = mutation.field_transforms();
        if !transforms.is_empty() {
            let encoded: Vec<JsonValue> = transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(encoded));
        }

        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    fn encode_update_document(&self, key: &DocumentKey, data: &ObjectValue) -> JsonValue {
        json!({
            "name": self.encode_key(key),
            "fields": self.encode_fields(data),
        })
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(version) }))
            }
        }
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": self.encode_values(elements) },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": self.encode_values(elements) },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand),
            }),
        }
    }

    fn encode_values(&self, values: &[Value]) -> Vec<JsonValue> {
        values.iter().map(|value| self.encode_value(value)).collect()
    }

    /// Encodes the `addTarget` payload. A resume token takes precedence over
    /// a read time; the expected count is only meaningful when resuming.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut encoded = JsonMap::new();
        encoded.insert("targetId".into(), json!(target_data.target_id));
        let target = &target_data.target;
        match DocumentKey::from_path(target.path().clone()) {
            Ok(key) if target.is_document_target() => {
                encoded.insert("documents".into(), json!({ "documents": [self.encode_key(&key)] }));
            }
            _ => {
                encoded.insert(
                    "query".into(),
                    serde_json::to_value(target).unwrap_or(JsonValue::Null),
                );
            }
        }

        let resuming = if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".into(),
                JsonValue::String(self.encode_bytes(&target_data.resume_token)),
            );
            true
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".into(),
                JsonValue::String(self.encode_version(&target_data.snapshot_version)),
            );
            true
        } else {
            false
        };
        if resuming {
            if let Some(count) = target_data.expected_count {
                encoded.insert("expectedCount".into(), json!(count));
            }
        }
        JsonValue::Object(encoded)
    }

    /// Decodes the target portion of an `addTarget` payload.
    pub fn decode_target(&self, value: &JsonValue) -> SyncResult<Target> {
        if let Some(names) = value
            .get("documents")
            .and_then(|documents| documents.get("documents"))
            .and_then(JsonValue::as_array)
        {
            let name = names
                .first()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Document target without a document name"))?;
            return Ok(Target::for_document(&self.decode_key(name)?));
        }
        let query = value
            .get("query")
            .ok_or_else(|| invalid_argument("Target has neither documents nor query"))?;
        serde_json::from_value(query.clone())
            .map_err(|err| invalid_argument(format!("Invalid query target: {err}")))
    }

    pub fn encode_watch_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unwatch_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect();
        json!({
            "streamToken": self.encode_bytes(stream_token),
            "writes": writes,
        })
    }

    /// Decodes a write acknowledgement. Results without an update time
    /// inherit the commit version.
    pub fn decode_write_response(&self, value: &JsonValue) -> SyncResult<WriteResponse> {
        let stream_token = self.decode_bytes(value.get("streamToken"))?;
        let commit_version = self.decode_optional_version(value.get("commitTime"))?;
        let mut mutation_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            for result in results {
                let version = match result.get("updateTime") {
                    Some(update_time) if !update_time.is_null() => self.decode_version(update_time)?,
                    _ => commit_version,
                };
                let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
                    Some(values) => values
                        .iter()
                        .map(|value| self.decode_value(value))
                        .collect::<SyncResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                mutation_results.push(MutationResult::new(version, transform_results));
            }
        }
        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }
}

fn encode_map_fields(fields: &BTreeMap<String, Value>, database_id: &DatabaseId) -> JsonValue {
    let mut encoded = JsonMap::new();
    for (name, value) in fields {
        encoded.insert(name.clone(), encode_value(value, database_id));
    }
    JsonValue::Object(encoded)
}

fn encode_value(value: &Value, database_id: &DatabaseId) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        // Local placeholders never go over the wire as values; writes carry
        // a transform instead.
        ValueKind::ServerTimestamp { previous, .. } => match previous {
            Some(previous) => encode_value(previous, database_id),
            None => json!({ "nullValue": JsonValue::Null }),
        },
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(key) => json!({ "referenceValue": key.qualified_name(database_id) }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values: Vec<JsonValue> = array
                .values()
                .iter()
                .map(|value| encode_value(value, database_id))
                .collect();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": { "fields": encode_map_fields(map.fields(), database_id) }
        }),
        ValueKind::Sentinel(_) => json!({ "nullValue": JsonValue::Null }),
    }
}

fn decode_value(value: &JsonValue, serializer: &JsonSerializer) -> SyncResult<Value> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected a tagged value object"))?;
    if object.contains_key("nullValue") {
        return Ok(Value::null());
    }
    if let Some(boolean) = object.get("booleanValue") {
        let boolean = boolean
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(Value::from_bool(boolean));
    }
    if let Some(integer) = object.get("integerValue") {
        let parsed = match integer {
            JsonValue::String(text) => i64::from_str(text)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(Value::from_integer(parsed));
    }
    if let Some(double) = object.get("doubleValue") {
        let parsed = match double {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(text) => text
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(Value::from_double(parsed));
    }
    if let Some(timestamp) = object.get("timestampValue") {
        let text = timestamp
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(Value::from_timestamp(Timestamp::from_rfc3339(text)?));
    }
    if let Some(string) = object.get("stringValue") {
        let text = string
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(Value::from_string(text));
    }
    if let Some(bytes) = object.get("bytesValue") {
        let text = bytes
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(text)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(Value::from_bytes(decoded));
    }
    if let Some(reference) = object.get("referenceValue") {
        let name = reference
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(Value::from_reference(serializer.decode_key(name)?));
    }
    if let Some(point) = object.get("geoPointValue") {
        let latitude = point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| invalid_argument("geoPointValue.latitude must be f64"))?;
        let longitude = point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| invalid_argument("geoPointValue.longitude must be f64"))?;
        return Ok(Value::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array) = object.get("arrayValue") {
        let values = match array.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| decode_value(entry, serializer))
                .collect::<SyncResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(Value::from_array(values));
    }
    if let Some(map) = object.get("mapValue") {
        let fields = serializer.decode_fields(map.get("fields"))?;
        return Ok(Value::from_map(fields.into_map()));
    }

    Err(invalid_argument("Unknown value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::TargetPurpose;
    use crate::model::FieldMask;

    fn serializer() -> JsonSerializer {
        JsonSerializer::new(DatabaseId::for_project("demo"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn object(entries: &[(&str, Value)]) -> ObjectValue {
        ObjectValue::from_map(
            entries
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    #[test]
    fn integer_values_are_strings_on_the_wire() {
        let encoded = serializer().encode_value(&Value::from_integer(42));
        assert_eq!(encoded, json!({ "integerValue": "42" }));
    }

    #[test]
    fn decodes_nested_document() {
        let serializer = serializer();
        let document = serializer
            .decode_document(&json!({
                "name": "projects/demo/databases/(default)/documents/rooms/r1",
                "updateTime": "2024-01-02T03:04:05.000000006Z",
                "fields": {
                    "title": { "stringValue": "lobby" },
                    "meta": { "mapValue": { "fields": {
                        "seats": { "integerValue": "12" },
                        "tags": { "arrayValue": { "values": [ { "booleanValue": true } ] } }
                    } } },
                    "owner": { "referenceValue": "projects/demo/databases/(default)/documents/users/u1" }
                }
            }))
            .expect("document");

        assert_eq!(document.key(), &key("rooms/r1"));
        assert_eq!(document.version().timestamp(), Timestamp::new(1_704_164_645, 6));
        let seats = FieldPath::from_dot_separated("meta.seats").unwrap();
        assert_eq!(document.field(&seats), Some(&Value::from_integer(12)));
        let owner = FieldPath::from_dot_separated("owner").unwrap();
        assert_eq!(document.field(&owner), Some(&Value::from_reference(key("users/u1"))));
    }

    #[test]
    fn rejects_names_outside_database() {
        let err = serializer()
            .decode_key("projects/other/databases/(default)/documents/rooms/r1")
            .unwrap_err();
        assert_eq!(err.code_str(), "docsync/invalid-argument");
    }

    #[test]
    fn encodes_patch_with_mask_transforms_and_precondition() {
        let serializer = serializer();
        let mask = FieldMask::new(vec![FieldPath::from_dot_separated("title").unwrap()]);
        let mutation = Mutation::patch(
            key("rooms/r1"),
            object(&[("title", Value::from_string("hall"))]),
            mask,
        )
        .with_field_transforms(vec![FieldTransform::new(
            FieldPath::from_dot_separated("visits").unwrap(),
            TransformOperation::NumericIncrement(Value::from_integer(1)),
        )]);

        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(
            encoded["update"]["name"],
            json!("projects/demo/databases/(default)/documents/rooms/r1")
        );
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["title"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(
            encoded["updateTransforms"][0],
            json!({ "fieldPath": "visits", "increment": { "integerValue": "1" } })
        );
    }

    #[test]
    fn encodes_delete_without_precondition() {
        let encoded = serializer().encode_mutation(&Mutation::delete(key("rooms/r1")));
        assert_eq!(
            encoded,
            json!({ "delete": "projects/demo/databases/(default)/documents/rooms/r1" })
        );
    }

    #[test]
    fn resume_token_takes_precedence_over_read_time() {
        let serializer = serializer();
        let target = Query::collection("rooms").unwrap().to_target();
        let mut data = TargetData::new(target, 2, TargetPurpose::Listen, 1);
        data.expected_count = Some(3);

        let fresh = serializer.encode_target(&data);
        assert!(fresh.get("resumeToken").is_none());
        assert!(fresh.get("expectedCount").is_none());

        data.snapshot_version = SnapshotVersion::new(Timestamp::new(10, 0));
        data.resume_token = b"token".to_vec();
        let resumed = serializer.encode_target(&data);
        assert_eq!(resumed["resumeToken"], json!(BASE64_STANDARD.encode(b"token")));
        assert!(resumed.get("readTime").is_none());
        assert_eq!(resumed["expectedCount"], json!(3));
        assert_eq!(serializer.decode_target(&resumed).unwrap(), data.target);
    }

    #[test]
    fn document_targets_use_document_names() {
        let serializer = serializer();
        let target = Target::for_document(&key("rooms/r1"));
        let data = TargetData::new(target.clone(), 1, TargetPurpose::LimboResolution, 1);
        let encoded = serializer.encode_target(&data);
        assert_eq!(
            encoded["documents"]["documents"][0],
            json!("projects/demo/databases/(default)/documents/rooms/r1")
        );
        assert_eq!(serializer.decode_target(&encoded).unwrap(), target);
    }

    #[test]
    fn write_results_default_to_commit_time() {
        let serializer = serializer();
        let response = serializer
            .decode_write_response(&json!({
                "streamToken": BASE64_STANDARD.encode(b"s1"),
                "commitTime": "1970-01-01T00:00:20Z",
                "writeResults": [
                    { "updateTime": "1970-01-01T00:00:15Z" },
                    { "transformResults": [ { "integerValue": "7" } ] }
                ]
            }))
            .expect("response");

        assert_eq!(response.stream_token, b"s1");
        assert_eq!(response.commit_version, SnapshotVersion::new(Timestamp::new(20, 0)));
        assert_eq!(
            response.mutation_results[0].version,
            SnapshotVersion::new(Timestamp::new(15, 0))
        );
        assert_eq!(response.mutation_results[1].version, response.commit_version);
        assert_eq!(
            response.mutation_results[1].transform_results,
            vec![Value::from_integer(7)]
        );
    }
}
