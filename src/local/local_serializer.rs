//! Persisted record layouts for the local caches.
//!
//! Values, documents and writes reuse the wire encoding so a record can be read
//! back by any build that speaks the same protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::Target;
use crate::error::{internal_error, FirestoreResult};
use crate::local::{TargetData, TargetPurpose};
use crate::model::{
    DocumentKey, DocumentKind, MutableDocument, Mutation, MutationBatch, Overlay, SnapshotVersion, Timestamp,
};
use crate::remote::JsonProtoSerializer;
use crate::value::MapValue;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl From<Timestamp> for DbTimestamp {
    fn from(value: Timestamp) -> Self {
        Self {
            seconds: value.seconds,
            nanos: value.nanos,
        }
    }
}

impl From<SnapshotVersion> for DbTimestamp {
    fn from(value: SnapshotVersion) -> Self {
        value.timestamp().into()
    }
}

impl DbTimestamp {
    pub fn to_timestamp(self) -> Timestamp {
        Timestamp::new(self.seconds, self.nanos)
    }

    pub fn to_version(self) -> SnapshotVersion {
        SnapshotVersion::new(self.to_timestamp())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationBatch {
    pub batch_id: i32,
    pub local_write_time: DbTimestamp,
    #[serde(default)]
    pub base_mutations: Vec<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDocumentOverlay {
    pub collection_path: String,
    pub collection_group: String,
    pub largest_batch_id: i32,
    pub overlay_mutation: JsonValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DbDocumentKind {
    Document,
    NoDocument,
    UnknownDocument,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocument {
    pub kind: DbDocumentKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
    pub version: DbTimestamp,
    pub read_time: DbTimestamp,
    #[serde(default)]
    pub has_committed_mutations: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTarget {
    pub target_id: i32,
    pub canonical_id: String,
    pub purpose: String,
    pub sequence_number: i64,
    pub snapshot_version: DbTimestamp,
    pub last_limbo_free_snapshot_version: DbTimestamp,
    #[serde(default)]
    pub resume_token: String,
    /// Wire form of the target, kept for inspection.
    pub query: JsonValue,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetGlobal {
    pub highest_target_id: i32,
    pub highest_listen_sequence_number: i64,
    pub last_remote_snapshot_version: DbTimestamp,
    pub target_count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationQueue {
    pub last_acknowledged_batch_id: i32,
    pub next_batch_id: i32,
    #[serde(default)]
    pub last_stream_token: String,
}

/// Converts model types to and from their persisted records.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote_serializer(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn to_db_mutation_batch(&self, batch: &MutationBatch) -> DbMutationBatch {
        DbMutationBatch {
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time.into(),
            base_mutations: batch
                .base_mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        }
    }

    pub fn from_db_mutation_batch(&self, record: &DbMutationBatch) -> FirestoreResult<MutationBatch> {
        let decode = |values: &[JsonValue]| -> FirestoreResult<Vec<Mutation>> {
            values.iter().map(|value| self.remote.decode_mutation(value)).collect()
        };
        Ok(MutationBatch::new(
            record.batch_id,
            record.local_write_time.to_timestamp(),
            decode(&record.base_mutations)?,
            decode(&record.mutations)?,
        ))
    }

    pub fn to_db_document_overlay(&self, overlay: &Overlay) -> DbDocumentOverlay {
        let key = overlay.key();
        DbDocumentOverlay {
            collection_path: key.collection_path().canonical_string(),
            collection_group: key.collection_group().to_string(),
            largest_batch_id: overlay.largest_batch_id,
            overlay_mutation: self.remote.encode_mutation(&overlay.mutation),
        }
    }

    pub fn from_db_document_overlay(&self, record: &DbDocumentOverlay) -> FirestoreResult<Overlay> {
        let mutation = self.remote.decode_mutation(&record.overlay_mutation)?;
        Ok(Overlay::new(record.largest_batch_id, mutation))
    }

    pub fn to_db_remote_document(&self, document: &MutableDocument) -> FirestoreResult<DbRemoteDocument> {
        let kind = match document.kind() {
            DocumentKind::FoundDocument => DbDocumentKind::Document,
            DocumentKind::NoDocument => DbDocumentKind::NoDocument,
            DocumentKind::UnknownDocument => DbDocumentKind::UnknownDocument,
            DocumentKind::Invalid => {
                return Err(internal_error(format!(
                    "Cannot persist invalid document {}",
                    document.key()
                )))
            }
        };
        let fields = document
            .is_found_document()
            .then(|| self.remote.encode_fields(document.data()));
        Ok(DbRemoteDocument {
            kind,
            path: document.key().path().canonical_string(),
            fields,
            version: document.version().into(),
            read_time: document.read_time().into(),
            has_committed_mutations: document.has_committed_mutations(),
        })
    }

    pub fn from_db_remote_document(&self, record: &DbRemoteDocument) -> FirestoreResult<MutableDocument> {
        let key = DocumentKey::from_string(&record.path)?;
        let version = record.version.to_version();
        let mut document = match record.kind {
            DbDocumentKind::Document => {
                let data = match &record.fields {
                    Some(fields) => self.remote.decode_fields(Some(fields))?,
                    None => MapValue::empty(),
                };
                MutableDocument::new_found_document(key, version, data)
            }
            DbDocumentKind::NoDocument => MutableDocument::new_no_document(key, version),
            DbDocumentKind::UnknownDocument => MutableDocument::new_unknown_document(key, version),
        };
        if record.has_committed_mutations {
            document.set_has_committed_mutations();
        }
        document.set_read_time(record.read_time.to_version());
        Ok(document)
    }

    pub fn to_db_target(&self, target_data: &TargetData) -> DbTarget {
        DbTarget {
            target_id: target_data.target_id,
            canonical_id: target_data.target.canonical_id(),
            purpose: purpose_name(target_data.purpose).to_string(),
            sequence_number: target_data.sequence_number,
            snapshot_version: target_data.snapshot_version.into(),
            last_limbo_free_snapshot_version: target_data.last_limbo_free_snapshot_version.into(),
            resume_token: self.remote.encode_bytes(&target_data.resume_token),
            query: if target_data.target.is_document_target() {
                serde_json::json!({ "documents": [self.remote.document_name_for_path(target_data.target.path())] })
            } else {
                self.remote.encode_query_target(&target_data.target)
            },
        }
    }

    /// Rebuilds target data for `target`, whose canonical id matches the record.
    pub fn from_db_target(&self, record: &DbTarget, target: Target) -> FirestoreResult<TargetData> {
        let resume_token = self
            .remote
            .decode_bytes(Some(&JsonValue::String(record.resume_token.clone())))?;
        let purpose = purpose_from_name(&record.purpose);
        Ok(TargetData::new(target, record.target_id, purpose, record.sequence_number)
            .with_resume_token(resume_token, record.snapshot_version.to_version())
            .with_last_limbo_free_snapshot_version(record.last_limbo_free_snapshot_version.to_version()))
    }
}

fn purpose_name(purpose: TargetPurpose) -> &'static str {
    match purpose {
        TargetPurpose::Listen => "listen",
        TargetPurpose::ExistenceFilterMismatch => "existenceFilterMismatch",
        TargetPurpose::ExistenceFilterMismatchBloom => "existenceFilterMismatchBloom",
        TargetPurpose::LimboResolution => "limboResolution",
    }
}

fn purpose_from_name(name: &str) -> TargetPurpose {
    match name {
        "existenceFilterMismatch" => TargetPurpose::ExistenceFilterMismatch,
        "existenceFilterMismatchBloom" => TargetPurpose::ExistenceFilterMismatchBloom,
        "limboResolution" => TargetPurpose::LimboResolution,
        _ => TargetPurpose::Listen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, FieldPath, FieldTransform};
    use crate::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")))
    }

    #[test]
    fn mutation_batches_survive_storage() {
        let key = DocumentKey::from_string("docs/a").unwrap();
        let batch = MutationBatch::new(
            4,
            Timestamp::new(10, 5),
            vec![Mutation::patch(
                key.clone(),
                MapValue::new(BTreeMap::from([("count".to_string(), FirestoreValue::from_integer(5))])),
            )],
            vec![Mutation::patch(key, MapValue::empty()).with_transform(
                FieldTransform::increment(
                    FieldPath::from_dot_separated("count").unwrap(),
                    FirestoreValue::from_integer(1),
                )
                .unwrap(),
            )],
        );
        let serializer = serializer();
        let record = serializer.to_db_mutation_batch(&batch);
        let json = serde_json::to_value(&record).unwrap();
        let restored: DbMutationBatch = serde_json::from_value(json).unwrap();
        assert_eq!(serializer.from_db_mutation_batch(&restored).unwrap(), batch);
    }

    #[test]
    fn remote_documents_keep_state_and_read_time() {
        let serializer = serializer();
        let key = DocumentKey::from_string("docs/gone").unwrap();
        let mut document = MutableDocument::new_no_document(key, SnapshotVersion::new(Timestamp::new(3, 0)));
        document.set_has_committed_mutations();
        document.set_read_time(SnapshotVersion::new(Timestamp::new(4, 0)));

        let record = serializer.to_db_remote_document(&document).unwrap();
        assert!(record.fields.is_none());
        let restored = serializer.from_db_remote_document(&record).unwrap();
        assert!(restored.is_no_document());
        assert!(restored.has_committed_mutations());
        assert_eq!(restored.read_time(), SnapshotVersion::new(Timestamp::new(4, 0)));
    }
}
