use std::collections::BTreeSet;

use serde_json::json;

use crate::core::Target;
use crate::error::FirestoreResult;
use crate::local::local_serializer::{DbTarget, DbTargetGlobal, LocalSerializer};
use crate::local::persistence::{PersistenceTransaction, StoreName};
use crate::local::TargetData;
use crate::model::{DocumentKey, SnapshotVersion};

const TARGET_GLOBAL_KEY: &str = "targetGlobal";

/// Persisted targets, the documents each target matches on the server, and the
/// global target metadata.
#[derive(Clone, Debug)]
pub struct TargetCache {
    serializer: LocalSerializer,
}

impl TargetCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    async fn metadata(&self, txn: &PersistenceTransaction) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn
            .get_record::<DbTargetGlobal>(StoreName::Metadata, TARGET_GLOBAL_KEY)
            .await?
            .unwrap_or_default())
    }

    fn save_metadata(&self, txn: &mut PersistenceTransaction, metadata: &DbTargetGlobal) -> FirestoreResult<()> {
        txn.put_record(StoreName::Metadata, TARGET_GLOBAL_KEY, metadata)
    }

    /// Next even target id. Odd ids are left to limbo resolution targets, which
    /// are never persisted.
    pub async fn allocate_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<i32> {
        let mut metadata = self.metadata(txn).await?;
        let next = (metadata.highest_target_id / 2 + 1) * 2;
        metadata.highest_target_id = next;
        self.save_metadata(txn, &metadata)?;
        Ok(next)
    }

    pub async fn get_highest_sequence_number(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        Ok(self.metadata(txn).await?.highest_listen_sequence_number)
    }

    pub async fn get_target_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<u64> {
        Ok(self.metadata(txn).await?.target_count)
    }

    pub async fn add_target_data(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target(txn, target_data)?;
        let mut metadata = self.metadata(txn).await?;
        metadata.target_count += 1;
        self.bump_metadata(&mut metadata, target_data);
        self.save_metadata(txn, &metadata)
    }

    pub async fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target(txn, target_data)?;
        let mut metadata = self.metadata(txn).await?;
        if self.bump_metadata(&mut metadata, target_data) {
            self.save_metadata(txn, &metadata)?;
        }
        Ok(())
    }

    pub async fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)
            .await?;
        txn.delete(StoreName::Targets, target_key(target_data.target_id));
        let mut metadata = self.metadata(txn).await?;
        metadata.target_count = metadata.target_count.saturating_sub(1);
        self.save_metadata(txn, &metadata)
    }

    /// Persisted data for `target`, matched by canonical id.
    pub async fn get_target_data(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        let found = txn
            .scan_records::<DbTarget>(StoreName::Targets, "")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.canonical_id == canonical_id);
        found
            .map(|record| self.serializer.from_db_target(&record, target.clone()))
            .transpose()
    }

    pub fn add_matching_keys<'a>(
        &self,
        txn: &mut PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: i32,
    ) {
        for key in keys {
            txn.put(StoreName::TargetDocuments, target_document_key(target_id, key), json!(true));
        }
    }

    pub fn remove_matching_keys<'a>(
        &self,
        txn: &mut PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: i32,
    ) {
        for key in keys {
            txn.delete(StoreName::TargetDocuments, target_document_key(target_id, key));
        }
    }

    pub async fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: i32,
    ) -> FirestoreResult<()> {
        for (key, _) in txn.scan(StoreName::TargetDocuments, &target_prefix(target_id)).await? {
            txn.delete(StoreName::TargetDocuments, key);
        }
        Ok(())
    }

    pub async fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: i32,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let prefix = target_prefix(target_id);
        txn.scan(StoreName::TargetDocuments, &prefix)
            .await?
            .into_iter()
            .map(|(key, _)| DocumentKey::from_string(&key[prefix.len()..]))
            .collect()
    }

    /// Whether any target currently matches `key` on the server.
    pub async fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        let suffix = format!("|{}", key.path().canonical_string());
        Ok(txn
            .scan(StoreName::TargetDocuments, "")
            .await?
            .iter()
            .any(|(entry, _)| entry.ends_with(&suffix)))
    }

    pub async fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction) -> FirestoreResult<SnapshotVersion> {
        Ok(self.metadata(txn).await?.last_remote_snapshot_version.to_version())
    }

    pub async fn set_target_metadata(
        &self,
        txn: &mut PersistenceTransaction,
        highest_sequence_number: i64,
        last_remote_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn).await?;
        metadata.highest_listen_sequence_number = metadata.highest_listen_sequence_number.max(highest_sequence_number);
        metadata.last_remote_snapshot_version = last_remote_snapshot_version.into();
        self.save_metadata(txn, &metadata)
    }

    fn save_target(&self, txn: &mut PersistenceTransaction, target_data: &TargetData) -> FirestoreResult<()> {
        let record = self.serializer.to_db_target(target_data);
        txn.put_record(StoreName::Targets, target_key(target_data.target_id), &record)
    }

    fn bump_metadata(&self, metadata: &mut DbTargetGlobal, target_data: &TargetData) -> bool {
        let mut changed = false;
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            changed = true;
        }
        if target_data.sequence_number > metadata.highest_listen_sequence_number {
            metadata.highest_listen_sequence_number = target_data.sequence_number;
            changed = true;
        }
        changed
    }
}

fn target_key(target_id: i32) -> String {
    format!("{target_id:010}")
}

fn target_prefix(target_id: i32) -> String {
    format!("{target_id:010}|")
}

fn target_document_key(target_id: i32, key: &DocumentKey) -> String {
    format!("{target_id:010}|{}", key.path().canonical_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::persistence::{MemoryPersistence, PersistenceArc};
    use crate::local::TargetPurpose;
    use crate::model::{DatabaseId, Timestamp};
    use crate::remote::JsonProtoSerializer;
    use std::sync::Arc;

    fn cache() -> (PersistenceArc, TargetCache) {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        (Arc::new(MemoryPersistence::new()), TargetCache::new(serializer))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn allocates_even_ids_and_finds_targets_by_canonical_id() {
        let (persistence, cache) = cache();
        let mut txn = PersistenceTransaction::new(persistence.clone(), "allocate");
        let first = cache.allocate_target_id(&mut txn).await.unwrap();
        let second = cache.allocate_target_id(&mut txn).await.unwrap();
        assert_eq!((first, second), (2, 4));

        let target = Query::collection("docs").unwrap().to_target();
        let data = TargetData::new(target.clone(), second, TargetPurpose::Listen, 7)
            .with_resume_token(b"resume".to_vec(), SnapshotVersion::new(Timestamp::new(5, 0)));
        cache.add_target_data(&mut txn, &data).await.unwrap();
        txn.commit().await.unwrap();

        let txn = PersistenceTransaction::new(persistence, "read");
        let restored = cache.get_target_data(&txn, &target).await.unwrap().unwrap();
        assert_eq!(restored.target_id, 4);
        assert_eq!(restored.resume_token, b"resume".to_vec());
        assert_eq!(cache.get_target_count(&txn).await.unwrap(), 1);
        assert_eq!(cache.get_highest_sequence_number(&txn).await.unwrap(), 7);

        let other = Query::collection("other").unwrap().to_target();
        assert!(cache.get_target_data(&txn, &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tracks_matching_keys_per_target() {
        let (persistence, cache) = cache();
        let mut txn = PersistenceTransaction::new(persistence, "keys");
        cache.add_matching_keys(&mut txn, [&key("docs/a"), &key("docs/b")], 2);
        cache.add_matching_keys(&mut txn, [&key("docs/a")], 12);
        cache.remove_matching_keys(&mut txn, [&key("docs/b")], 2);

        let keys = cache.get_matching_keys_for_target_id(&txn, 2).await.unwrap();
        assert_eq!(keys, BTreeSet::from([key("docs/a")]));
        assert!(cache.contains_key(&txn, &key("docs/a")).await.unwrap());
        assert!(!cache.contains_key(&txn, &key("docs/b")).await.unwrap());

        cache.remove_matching_keys_for_target_id(&mut txn, 2).await.unwrap();
        assert!(cache.get_matching_keys_for_target_id(&txn, 2).await.unwrap().is_empty());
        assert_eq!(cache.get_matching_keys_for_target_id(&txn, 12).await.unwrap().len(), 1);
    }
}
