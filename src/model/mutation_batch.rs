use std::collections::{BTreeMap, BTreeSet};

use crate::error::{assertion_failure, FirestoreResult};
use crate::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion,
    Timestamp,
};

pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A group of mutations written together by one application call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Patches capturing the values non-idempotent transforms started from. Applied
    /// before `mutations` in the local view only; never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

/// A document together with the mask of fields its pending mutations touched.
#[derive(Clone, Debug)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` when a set or delete replaced the whole document.
    pub mutated_fields: Option<FieldMask>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the server results for this batch to the remote view of `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationBatchResult) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            if let Some(mutation_result) = result.mutation_results.get(index) {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    pub fn apply_to_local_view(&self, document: &mut MutableDocument, mut mutated_fields: Option<FieldMask>) -> Option<FieldMask> {
        let key = document.key().clone();
        for mutation in self.base_mutations.iter().filter(|m| m.key() == &key) {
            mutated_fields = mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
        }
        for mutation in self.mutations.iter().filter(|m| m.key() == &key) {
            mutated_fields = mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
        }
        mutated_fields
    }

    /// Applies the batch to each affected document in `documents` and returns the
    /// overlay each document now needs.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mask = self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            let mask = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mask
            };
            overlayed.mutated_fields = mask.clone();
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// The backend's acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each document was committed at.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(assertion_failure(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(x: i64) -> MapValue {
        MapValue::new(BTreeMap::from([("x".to_string(), FirestoreValue::from_integer(x))]))
    }

    #[test]
    fn result_requires_matching_lengths() {
        let batch = MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![Mutation::set(key("docs/a"), data(1))]);
        let err = MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("docs/a"), data(1)), Mutation::delete(key("docs/b"))],
        );
        let mut documents = BTreeMap::new();
        for path in ["docs/a", "docs/b"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: MutableDocument::new_invalid_document(key(path)),
                    mutated_fields: Some(FieldMask::empty()),
                },
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        assert_eq!(overlays.get(&key("docs/a")), Some(&Mutation::set(key("docs/a"), data(1))));
        assert_eq!(overlays.get(&key("docs/b")), Some(&Mutation::delete(key("docs/b"))));
        assert!(documents[&key("docs/b")].document.is_no_document());
    }

    #[test]
    fn local_view_only_applies_mutations_for_the_document() {
        let batch = MutationBatch::new(
            4,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("docs/a"), data(1)), Mutation::set(key("docs/b"), data(2))],
        );
        let mut document = MutableDocument::new_invalid_document(key("docs/a"));
        batch.apply_to_local_view(&mut document, Some(FieldMask::empty()));

        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
        assert_eq!(document.data(), &data(1));
    }
}
