use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::core::{Direction, FieldFilter, FilterOperator, Target};
use crate::error::{invalid_argument, FirestoreResult};
use crate::local::TargetData;
use crate::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, MutableDocument, Mutation,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between the model types and the JSON form of the backend protocol.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.document_name_for_path(key.path())
    }

    pub fn document_name_for_path(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn decode_document_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let path = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!("Document name '{name}' does not belong to {}", self.database_name()))
        })?;
        DocumentKey::from_string(path)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    /// Decodes a `fields` object; a missing object means an empty document.
    pub fn decode_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        match fields {
            Some(fields) => decode_map_fields(fields),
            None => Ok(MapValue::empty()),
        }
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(version.timestamp().to_rfc3339())
    }

    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Ok(SnapshotVersion::new(Timestamp::from_rfc3339(text)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => BASE64_STANDARD
                .decode(text)
                .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    /// `{name, fields, updateTime}` for a found document.
    pub fn encode_document(&self, document: &MutableDocument) -> JsonValue {
        json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": self.encode_version(document.version()),
        })
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.decode_document_key(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        let data = self.decode_fields(value.get("fields"))?;
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set {
                key,
                value,
                field_transforms,
                ..
            } => {
                write.insert("update".into(), self.encode_update_document(key, value));
                self.insert_transforms(&mut write, field_transforms);
            }
            Mutation::Patch {
                key,
                value,
                field_mask,
                field_transforms,
                ..
            } => {
                write.insert("update".into(), self.encode_update_document(key, value));
                write.insert("updateMask".into(), encode_field_mask(field_mask));
                self.insert_transforms(&mut write, field_transforms);
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".into(), JsonValue::String(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".into(), JsonValue::String(self.document_name(key)));
            }
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition()) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = self.decode_precondition(value.get("currentDocument"))?;
        let field_transforms = match value.get("updateTransforms").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_field_transform(entry))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        if let Some(update) = value.get("update") {
            let document = self.decode_document(update)?;
            let key = document.key().clone();
            let data = document.data().clone();
            return Ok(match value.get("updateMask") {
                Some(mask) => Mutation::Patch {
                    key,
                    value: data,
                    field_mask: decode_field_mask(mask)?,
                    precondition,
                    field_transforms,
                },
                None => Mutation::Set {
                    key,
                    value: data,
                    precondition,
                    field_transforms,
                },
            });
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::Delete {
                key: self.decode_document_key(name)?,
                precondition,
            });
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::Verify {
                key: self.decode_document_key(name)?,
                precondition,
            });
        }
        Err(invalid_argument(format!("Unknown write payload: {value}")))
    }

    fn encode_update_document(&self, key: &DocumentKey, value: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(value),
        })
    }

    fn insert_transforms(&self, write: &mut JsonMap<String, JsonValue>, transforms: &[FieldTransform]) {
        if transforms.is_empty() {
            return;
        }
        let encoded = transforms
            .iter()
            .map(|transform| self.encode_field_transform(transform))
            .collect();
        write.insert("updateTransforms".into(), JsonValue::Array(encoded));
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field_path().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform is missing fieldPath"))
            .and_then(FieldPath::from_dot_separated)?;

        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_value_list(union.get("values"))?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_value_list(remove.get("values"))?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument(format!("Unknown field transform: {value}")));
        };
        Ok(FieldTransform::new(field_path, operation))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(*version) })),
        }
    }

    fn decode_precondition(&self, value: Option<&JsonValue>) -> FirestoreResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if value.get("updateTime").is_some() {
            return Ok(Precondition::UpdateTime(self.decode_version(value.get("updateTime"))?));
        }
        Ok(Precondition::None)
    }

    /// Decodes one entry of a write response. A write without `updateTime` (for
    /// example a delete) is reported at the commit version.
    pub fn decode_mutation_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            version = commit_version;
        }
        let transform_results = decode_value_list(value.get("transformResults"))?;
        Ok(MutationResult::new(version, transform_results))
    }

    /// The `addTarget` payload for a watch request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = JsonMap::new();
        encoded.insert("targetId".into(), json!(target_data.target_id));
        if target.is_document_target() {
            encoded.insert(
                "documents".into(),
                json!({ "documents": [self.document_name_for_path(target.path())] }),
            );
        } else {
            encoded.insert("query".into(), self.encode_query_target(target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".into(),
                JsonValue::String(self.encode_bytes(&target_data.resume_token)),
            );
            if let Some(count) = target_data.expected_count {
                encoded.insert("expectedCount".into(), json!(count));
            }
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert("readTime".into(), self.encode_version(target_data.snapshot_version));
            if let Some(count) = target_data.expected_count {
                encoded.insert("expectedCount".into(), json!(count));
            }
        }
        JsonValue::Object(encoded)
    }

    /// `{parent, structuredQuery}` for a collection or collection-group target.
    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, from) = match target.collection_group() {
            Some(group) => (
                self.document_name_for_path(target.path()),
                json!([{ "collectionId": group, "allDescendants": true }]),
            ),
            None => (
                self.document_name_for_path(&target.path().without_last()),
                json!([{ "collectionId": target.path().last_segment().unwrap_or_default() }]),
            ),
        };

        let mut structured = JsonMap::new();
        structured.insert("from".into(), from);
        if let Some(filter) = self.encode_filters(target.filters()) {
            structured.insert("where".into(), filter);
        }
        if !target.order_by().is_empty() {
            let orders = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": match order.direction() {
                            Direction::Ascending => "ASCENDING",
                            Direction::Descending => "DESCENDING",
                        }
                    })
                })
                .collect::<Vec<_>>();
            structured.insert("orderBy".into(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit() {
            structured.insert("limit".into(), json!(limit));
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    fn encode_filters(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        let mut encoded: Vec<JsonValue> = filters.iter().map(|filter| self.encode_filter(filter)).collect();
        match encoded.len() {
            0 => None,
            1 => encoded.pop(),
            _ => Some(json!({ "compositeFilter": { "op": "AND", "filters": encoded } })),
        }
    }

    fn encode_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        match (filter.operator(), filter.value().kind()) {
            (FilterOperator::Equal, ValueKind::Null) => {
                json!({ "unaryFilter": { "field": field, "op": "IS_NULL" } })
            }
            (FilterOperator::Equal, ValueKind::Double(value)) if value.is_nan() => {
                json!({ "unaryFilter": { "field": field, "op": "IS_NAN" } })
            }
            (FilterOperator::NotEqual, ValueKind::Null) => {
                json!({ "unaryFilter": { "field": field, "op": "IS_NOT_NULL" } })
            }
            (FilterOperator::NotEqual, ValueKind::Double(value)) if value.is_nan() => {
                json!({ "unaryFilter": { "field": field, "op": "IS_NOT_NAN" } })
            }
            (operator, _) => json!({
                "fieldFilter": {
                    "field": field,
                    "op": operator.wire_name(),
                    "value": encode_value(filter.value()),
                }
            }),
        }
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    let paths: Vec<String> = mask.iter().map(FieldPath::canonical_string).collect();
    json!({ "fieldPaths": paths })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = value
        .get("fieldPaths")
        .and_then(JsonValue::as_array)
        .map(|entries| entries.as_slice())
        .unwrap_or_default();
    paths
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .ok_or_else(|| invalid_argument("updateMask paths must be strings"))
                .and_then(FieldPath::from_dot_separated)
        })
        .collect()
}

fn decode_value_list(value: Option<&JsonValue>) -> FirestoreResult<Vec<FirestoreValue>> {
    match value.and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = JsonMap::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) if double.is_finite() => json!({ "doubleValue": double }),
        ValueKind::Double(double) => json!({ "doubleValue": encode_special_double(*double) }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn encode_special_double(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn decode_map_fields(value: &JsonValue) -> FirestoreResult<MapValue> {
    let fields_object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => {
                i64::from_str(value).map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?
            }
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let text = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::from_rfc3339(text)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let text = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(text));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let text = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded =
            BytesValue::from_base64(text).map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let text = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(text));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(FirestoreValue::from_array(decode_value_list(array_value.get("values"))?));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = match map_value.get("fields") {
            Some(fields) => decode_map_fields(fields)?,
            None => MapValue::empty(),
        };
        return Ok(FirestoreValue::from(map));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn value_round_trip_keeps_special_doubles() {
        let serializer = serializer();
        let mut fields = BTreeMap::new();
        fields.insert("nan".to_string(), FirestoreValue::from_double(f64::NAN));
        fields.insert("count".to_string(), FirestoreValue::from_integer(42));
        fields.insert(
            "nested".to_string(),
            FirestoreValue::from_map(BTreeMap::from([("flag".to_string(), FirestoreValue::from_bool(true))])),
        );
        let map = MapValue::new(fields);

        let decoded = serializer.decode_fields(Some(&serializer.encode_fields(&map))).unwrap();
        assert!(decoded.fields()["nan"].is_nan());
        assert_eq!(decoded.fields()["count"], FirestoreValue::from_integer(42));
        assert_eq!(decoded.fields()["nested"], map.fields()["nested"]);
    }

    #[test]
    fn mutation_wire_format() {
        let serializer = serializer();
        let mutation = Mutation::patch(
            key("docs/a"),
            MapValue::new(BTreeMap::from([("x".to_string(), FirestoreValue::from_integer(1))])),
        )
        .with_transform(FieldTransform::server_timestamp(FieldPath::from_dot_separated("updated").unwrap()));

        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(
            encoded["update"]["name"],
            json!("projects/project/databases/(default)/documents/docs/a")
        );
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["x"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(encoded["updateTransforms"][0]["setToServerValue"], json!("REQUEST_TIME"));

        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), mutation);

        let verify = Mutation::verify(key("docs/b"), Precondition::Exists(true));
        let encoded = serializer.encode_mutation(&verify);
        assert_eq!(encoded["verify"], json!("projects/project/databases/(default)/documents/docs/b"));
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), verify);
    }

    #[test]
    fn encodes_collection_query_targets() {
        let serializer = serializer();
        let query = Query::collection("rooms/eros/messages")
            .unwrap()
            .with_filter("author", FilterOperator::Equal, FirestoreValue::from_string("ada"))
            .unwrap()
            .limit_to_first(5);
        let encoded = serializer.encode_query_target(&query.to_target());
        assert_eq!(
            encoded["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        let structured = &encoded["structuredQuery"];
        assert_eq!(structured["from"][0]["collectionId"], json!("messages"));
        assert_eq!(structured["where"]["fieldFilter"]["op"], json!("EQUAL"));
        assert_eq!(structured["orderBy"][0]["field"]["fieldPath"], json!("__name__"));
        assert_eq!(structured["limit"], json!(5));
    }

    #[test]
    fn mutation_results_default_to_commit_version() {
        let serializer = serializer();
        let commit = SnapshotVersion::new(Timestamp::new(100, 0));
        let result = serializer
            .decode_mutation_result(&json!({ "transformResults": [{ "integerValue": "7" }] }), commit)
            .unwrap();
        assert_eq!(result.version, commit);
        assert_eq!(result.transform_results, vec![FirestoreValue::from_integer(7)]);
    }
}
