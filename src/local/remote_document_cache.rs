use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::index_manager::IndexManager;
use crate::local::local_serializer::{DbRemoteDocument, LocalSerializer};
use crate::local::persistence::{PersistenceTransaction, StoreName};
use crate::model::{DocumentKey, DocumentMap, MutableDocument, ResourcePath, SnapshotVersion};

/// The last known server state of each document.
#[derive(Clone, Debug)]
pub struct RemoteDocumentCache {
    serializer: LocalSerializer,
    index_manager: IndexManager,
}

impl RemoteDocumentCache {
    pub fn new(serializer: LocalSerializer, index_manager: IndexManager) -> Self {
        Self {
            serializer,
            index_manager,
        }
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub async fn get_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        match txn
            .get_record::<DbRemoteDocument>(StoreName::RemoteDocuments, &document_key(key))
            .await?
        {
            Some(record) => self.serializer.from_db_remote_document(&record),
            None => Ok(MutableDocument::new_invalid_document(key.clone())),
        }
    }

    pub async fn get_entries(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let mut documents = DocumentMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key).await?);
        }
        Ok(documents)
    }

    /// Found documents of the query's collection(s) read after `since_read_time`
    /// whose cached state matches `query`. Keys in `excluded_keys` are skipped and
    /// the scan stops once `limit` documents were collected.
    pub async fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
        excluded_keys: &BTreeSet<DocumentKey>,
        limit: Option<usize>,
    ) -> FirestoreResult<DocumentMap> {
        let collections = match query.collection_group_id() {
            Some(group) => self
                .index_manager
                .get_collection_parents(txn, group)
                .await?
                .into_iter()
                .filter(|parent| query.path().is_prefix_of(parent))
                .map(|parent| parent.child([group]))
                .collect(),
            None => vec![query.path().clone()],
        };

        let mut documents = DocumentMap::new();
        for collection in collections {
            let prefix = format!("{}/", collection.canonical_string());
            for (_, record) in txn
                .scan_records::<DbRemoteDocument>(StoreName::RemoteDocuments, &prefix)
                .await?
            {
                if limit.is_some_and(|limit| documents.len() >= limit) {
                    return Ok(documents);
                }
                if record.read_time.to_version() <= since_read_time {
                    continue;
                }
                let document = self.serializer.from_db_remote_document(&record)?;
                if document.key().path().len() != collection.len() + 1
                    || excluded_keys.contains(document.key())
                    || !query.matches(&document)
                {
                    continue;
                }
                documents.insert(document.key().clone(), document);
            }
        }
        Ok(documents)
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer {
            cache: self.clone(),
            changes: BTreeMap::new(),
        }
    }
}

/// Collects document changes for one transaction. Reads see buffered changes
/// first; nothing reaches the transaction until [`apply`](Self::apply).
#[derive(Debug)]
pub struct RemoteDocumentChangeBuffer {
    cache: RemoteDocumentCache,
    changes: BTreeMap<DocumentKey, Option<MutableDocument>>,
}

impl RemoteDocumentChangeBuffer {
    /// Buffers `document`, whose read time must already be set.
    pub fn add_entry(&mut self, document: MutableDocument) {
        self.changes.insert(document.key().clone(), Some(document));
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.changes.insert(key.clone(), None);
    }

    pub async fn get_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        match self.changes.get(key) {
            Some(Some(document)) => Ok(document.clone()),
            Some(None) => Ok(MutableDocument::new_invalid_document(key.clone())),
            None => self.cache.get_entry(txn, key).await,
        }
    }

    pub async fn get_entries(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let mut documents = DocumentMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key).await?);
        }
        Ok(documents)
    }

    pub fn changed_keys(&self) -> BTreeSet<DocumentKey> {
        self.changes.keys().cloned().collect()
    }

    pub async fn apply(self, txn: &mut PersistenceTransaction) -> FirestoreResult<()> {
        let mut collections = BTreeSet::<ResourcePath>::new();
        for (key, change) in self.changes {
            match change {
                Some(document) if document.is_valid_document() => {
                    let record = self.cache.serializer.to_db_remote_document(&document)?;
                    txn.put_record(StoreName::RemoteDocuments, document_key(&key), &record)?;
                    collections.insert(key.collection_path());
                }
                _ => txn.delete(StoreName::RemoteDocuments, document_key(&key)),
            }
        }
        for collection in collections {
            self.cache
                .index_manager
                .add_to_collection_parent_index(txn, &collection)
                .await?;
        }
        Ok(())
    }
}

fn document_key(key: &DocumentKey) -> String {
    key.path().canonical_string()
}
