use std::collections::{BTreeMap, BTreeSet};

use crate::local::TargetPurpose;
use crate::model::{DocumentKey, DocumentMap, SnapshotVersion};

/// Everything the watch stream reported up to one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose cached results must be discarded, with the purpose the
    /// re-listen should carry.
    pub target_mismatches: BTreeMap<i32, TargetPurpose>,
    pub document_updates: DocumentMap,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// How one target's result set changed within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change that only marks the target current, used for targets whose
    /// results were discarded locally.
    pub fn create_synthesized_target_change_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
