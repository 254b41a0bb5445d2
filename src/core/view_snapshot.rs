use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-writes state of the document changed.
    Metadata,
}

impl ChangeType {
    fn sort_order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Documents of a view, kept in the query's order.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Query,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<DocumentKey>,
}

impl DocumentSet {
    pub fn new(query: &Query) -> Self {
        Self {
            query: query.clone(),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first().and_then(|key| self.by_key.get(key))
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last().and_then(|key| self.by_key.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> + '_ {
        self.sorted.iter().filter_map(|key| self.by_key.get(key))
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.by_key.keys().cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<MutableDocument> {
        self.iter().cloned().collect()
    }

    /// Inserts or replaces the document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let position = self
            .sorted
            .binary_search_by(|key| match self.by_key.get(key) {
                Some(existing) => self.query.compare_documents(existing, &document),
                None => Ordering::Less,
            })
            .unwrap_or_else(|position| position);
        self.sorted.insert(position, document.key().clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let removed = self.by_key.remove(key)?;
        self.sorted.retain(|existing| existing != key);
        Some(removed)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted && self.by_key == other.by_key
    }
}

/// Accumulates the changes of one view computation, collapsing repeated
/// changes to the same key.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                log::warn!("unsupported view change combination {old_type:?} -> {new_type:?} for {key}");
                Some(change)
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// What a listener sees after a view changed.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    /// Removals first, then additions, then modifications, each in query order.
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents in `docs` that carry unacknowledged local writes.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub has_pending_writes: bool,
}

impl ViewSnapshot {
    pub(crate) fn new(
        query: Query,
        docs: DocumentSet,
        old_docs: DocumentSet,
        mut doc_changes: Vec<DocumentViewChange>,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        sync_state_changed: bool,
    ) -> Self {
        doc_changes.sort_by(|left, right| {
            left.change_type
                .sort_order()
                .cmp(&right.change_type.sort_order())
                .then_with(|| query.compare_documents(&left.document, &right.document))
        });
        let has_pending_writes = !mutated_keys.is_empty();
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed,
            has_pending_writes,
        }
    }

    /// A snapshot where every document counts as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
    ) -> Self {
        let changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(&query);
        Self::new(query, docs, old_docs, changes, mutated_keys, from_cache, true)
    }

    /// Whether `key` has pending local writes in this snapshot.
    pub fn has_pending_writes_for(&self, key: &DocumentKey) -> bool {
        self.mutated_keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;
    use crate::model::SnapshotVersion;
    use crate::value::{FirestoreValue, MapValue};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("rank".to_string(), FirestoreValue::from_integer(rank));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            MapValue::new(fields),
        )
    }

    #[test]
    fn document_set_keeps_query_order() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("rank", Direction::Descending)
            .unwrap();
        let mut set = DocumentSet::new(&query);
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 3));
        set.insert(doc("rooms/c", 2));
        set.insert(doc("rooms/a", 4));

        let order: Vec<&str> = set.iter().map(|document| document.key().id()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.last().unwrap().key().id(), "c");

        set.remove(&DocumentKey::from_string("rooms/b").unwrap());
        let order: Vec<&str> = set.iter().map(|document| document.key().id()).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn change_set_collapses_add_then_remove() {
        let mut changes = DocumentChangeSet::default();
        changes.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/a", 1),
        });
        changes.track(DocumentViewChange {
            change_type: ChangeType::Modified,
            document: doc("rooms/a", 2),
        });
        changes.track(DocumentViewChange {
            change_type: ChangeType::Removed,
            document: doc("rooms/b", 1),
        });
        changes.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/b", 5),
        });

        let changes = changes.into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].document, doc("rooms/a", 2));
        assert_eq!(changes[1].change_type, ChangeType::Modified);

        let mut collapsed = DocumentChangeSet::default();
        collapsed.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/a", 1),
        });
        collapsed.track(DocumentViewChange {
            change_type: ChangeType::Removed,
            document: doc("rooms/a", 1),
        });
        assert!(collapsed.is_empty());
    }
}
