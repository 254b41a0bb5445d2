use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, map_grpc_status, FirestoreError, FirestoreResult};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::remote::serializer::JsonProtoSerializer;

/// One decoded message of the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Snapshot version carried by the message. Only a target change addressed to
    /// no target in particular marks a consistent snapshot.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) if change.target_ids.is_empty() => change.read_time,
            _ => SnapshotVersion::min(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    pub target_ids: Vec<i32>,
    /// Empty when the message carried no token.
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A document entering, changing in or leaving a set of targets.
///
/// `new_document` is a found document for `documentChange`, a deleted document
/// for `documentDelete`, and `None` for `documentRemove`, which only says the
/// document no longer matches.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub new_document: Option<MutableDocument>,
}

/// Bloom filter bits as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BloomFilterBits {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterBits>,
}

pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter(serializer, filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value.get("cause").map(|cause| {
        let code = cause.get("code").and_then(JsonValue::as_i64).unwrap_or(2) as i32;
        let message = cause
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("watch target error");
        map_grpc_status(code, message)
    });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: serializer.decode_bytes(value.get("resumeToken"))?,
        read_time: serializer.decode_version(value.get("readTime"))?,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_document: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = serializer.decode_version(value.get("readTime"))?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_document: None,
    }))
}

fn decode_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;

    let unchanged_names = match value.get("unchangedNames") {
        Some(names) => match names.get("bits") {
            Some(bits) => Some(BloomFilterBits {
                bitmap: serializer.decode_bytes(bits.get("bitmap"))?,
                padding: bits.get("padding").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
                hash_count: names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
            }),
            None => None,
        },
        None => None,
    };

    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.decode_document_key(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as i32))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Added,
        "REMOVE" => TargetChangeState::Removed,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, Timestamp};
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        assert!(decoded.snapshot_version().is_min());
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn global_no_change_carries_the_snapshot_version() {
        let change = json!({
            "targetChange": { "readTime": "1970-01-01T00:00:05Z" }
        });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        assert_eq!(decoded.snapshot_version(), SnapshotVersion::new(Timestamp::new(5, 0)));
    }

    #[test]
    fn decodes_deletes_and_filters() {
        let delete = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/docs/a",
                "readTime": "1970-01-01T00:00:07Z",
                "removedTargetIds": [2]
            }
        });
        match decode_watch_change(&serializer(), &delete).unwrap().unwrap() {
            WatchChange::DocumentChange(change) => {
                assert_eq!(change.removed_target_ids, vec![2]);
                let document = change.new_document.unwrap();
                assert!(document.is_no_document());
                assert_eq!(document.version(), SnapshotVersion::new(Timestamp::new(7, 0)));
            }
            other => panic!("unexpected change: {other:?}"),
        }

        let filter = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": { "bits": { "bitmap": BASE64_STANDARD.encode([0xffu8]), "padding": 1 }, "hashCount": 2 }
            }
        });
        match decode_watch_change(&serializer(), &filter).unwrap().unwrap() {
            WatchChange::ExistenceFilter(filter) => {
                assert_eq!((filter.target_id, filter.count), (2, 3));
                let bits = filter.unchanged_names.unwrap();
                assert_eq!((bits.bitmap, bits.padding, bits.hash_count), (vec![0xff], 1, 2));
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }
}
