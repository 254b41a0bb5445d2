use std::collections::BTreeSet;

use crate::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, ViewSnapshot};
use crate::core::{LimitType, Query};
use crate::model::{DocumentKey, DocumentMap, MutableDocument};
use crate::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results come from the cache only.
    Local,
    /// The backend marked the target current and no document is in limbo.
    Synced,
}

/// A document entering or leaving limbo for a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query lost documents at its edge; the caller must rerun the
    /// query against the full cache and compute the changes again.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The local result set of one query, and the limbo bookkeeping that decides
/// whether it is in sync with the backend.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend says match the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(&query);
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Whether the last snapshot of this view was in sync with the backend.
    pub fn is_synced(&self) -> bool {
        self.sync_state == Some(SyncState::Synced)
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Folds `doc_changes` into the current results without modifying the view.
    ///
    /// Pass the output of an earlier call as `previous` to recompute on top of
    /// it after a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<&ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let mut change_set = previous
            .map(|previous| previous.change_set.clone())
            .unwrap_or_default();
        let old_document_set = previous
            .map(|previous| &previous.document_set)
            .unwrap_or(&self.document_set);
        let mut mutated_keys = previous
            .map(|previous| previous.mutated_keys.clone())
            .unwrap_or_else(|| self.mutated_keys.clone());
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending_mutations = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.query.compare_documents(new_doc, last).is_gt());
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.query.compare_documents(new_doc, first).is_lt());
                            if past_last || before_first {
                                // The document moved past the edge of the limit;
                                // another document may belong in its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending_mutations != new_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and an optional target change. Returns a
    /// snapshot when the results or the sync state changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;
        let changes = doc_changes.change_set.into_changes();

        if let Some(target_change) = target_change {
            self.apply_target_change(target_change);
        }

        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot::new(
            self.query.clone(),
            self.document_set.clone(),
            old_docs,
            changes,
            self.mutated_keys.clone(),
            new_sync_state == SyncState::Local,
            sync_state_changed,
        );
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops the view back to cache-backed results until the
    /// target becomes current again.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: &TargetChange) {
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced for the view");
            }
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(new_limbo.difference(&old_limbo).cloned().map(LimboDocumentChange::Added));
        self.limbo_documents = new_limbo;
        changes
    }

    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A document whose local write was just acknowledged keeps its local version
/// until the backend sends the committed one.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
