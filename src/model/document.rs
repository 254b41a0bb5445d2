use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Nothing is known about the document.
    Invalid,
    FoundDocument,
    NoDocument,
    /// The document exists but its contents are unknown, e.g. after a patch was
    /// acknowledged without the base document being cached.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as tracked by the local caches.
///
/// Converters mutate the document in place and return `&mut Self` so calls can be
/// chained, e.g. `doc.convert_to_found_document(version, data).set_has_local_mutations()`.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    kind: DocumentKind,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            kind: DocumentKind::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub(crate) fn from_parts(
        key: DocumentKey,
        kind: DocumentKind,
        version: SnapshotVersion,
        read_time: SnapshotVersion,
        data: MapValue,
        state: DocumentState,
    ) -> Self {
        Self {
            key,
            kind,
            version,
            read_time,
            data,
            state,
        }
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        self.version = version;
        self.kind = DocumentKind::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.kind = DocumentKind::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.kind = DocumentKind::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Locally mutated documents have no server version until they are reconciled.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.kind != DocumentKind::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.kind == DocumentKind::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.kind == DocumentKind::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.kind == DocumentKind::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    #[test]
    fn local_mutations_reset_version() {
        let key = DocumentKey::from_string("docs/a").unwrap();
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        let mut doc = MutableDocument::new_found_document(key, version, MapValue::empty());
        assert_eq!(doc.version(), version);
        doc.set_has_local_mutations();
        assert!(doc.version().is_min());
        assert!(doc.has_pending_writes());
    }
}
