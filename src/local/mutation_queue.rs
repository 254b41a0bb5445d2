use std::collections::BTreeSet;

use crate::core::Query;
use crate::error::{assertion_failure, FirestoreResult};
use crate::local::local_serializer::{DbMutationBatch, DbMutationQueue, LocalSerializer};
use crate::local::persistence::{PersistenceTransaction, StoreName};
use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};

const MUTATION_QUEUE_KEY: &str = "mutationQueue";

/// The durable, ordered log of batches the backend has not acknowledged yet.
///
/// Batch ids are allocated from a counter stored next to the queue, so ids keep
/// increasing across restarts even after the queue drained.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    serializer: LocalSerializer,
}

impl MutationQueue {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    async fn metadata(&self, txn: &PersistenceTransaction) -> FirestoreResult<DbMutationQueue> {
        if let Some(metadata) = txn
            .get_record::<DbMutationQueue>(StoreName::Metadata, MUTATION_QUEUE_KEY)
            .await?
        {
            return Ok(metadata);
        }
        let highest = self
            .all_records(txn)
            .await?
            .last()
            .map(|record| record.batch_id)
            .unwrap_or(0);
        Ok(DbMutationQueue {
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            next_batch_id: highest + 1,
            last_stream_token: String::new(),
        })
    }

    async fn all_records(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<DbMutationBatch>> {
        Ok(txn
            .scan_records::<DbMutationBatch>(StoreName::Mutations, "")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub async fn is_empty(&self, txn: &PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(txn.scan(StoreName::Mutations, "").await?.is_empty())
    }

    pub async fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut metadata = self.metadata(txn).await?;
        let batch_id = metadata.next_batch_id;
        metadata.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let record = self.serializer.to_db_mutation_batch(&batch);
        txn.put_record(StoreName::Mutations, batch_key(batch_id), &record)?;
        txn.put_record(StoreName::Metadata, MUTATION_QUEUE_KEY, &metadata)?;
        log::debug!("queued mutation batch {batch_id} with {} writes", batch.mutations.len());
        Ok(batch)
    }

    pub async fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        match txn
            .get_record::<DbMutationBatch>(StoreName::Mutations, &batch_key(batch_id))
            .await?
        {
            Some(record) => self.serializer.from_db_mutation_batch(&record).map(Some),
            None => Ok(None),
        }
    }

    /// First queued batch whose id is greater than `batch_id`; pass
    /// [`BATCH_ID_UNKNOWN`] for the head of the queue.
    pub async fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let next = self
            .all_records(txn)
            .await?
            .into_iter()
            .find(|record| record.batch_id > batch_id);
        next.map(|record| self.serializer.from_db_mutation_batch(&record))
            .transpose()
    }

    pub async fn get_all_mutation_batches(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<MutationBatch>> {
        self.all_records(txn)
            .await?
            .iter()
            .map(|record| self.serializer.from_db_mutation_batch(record))
            .collect()
    }

    pub async fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.batches_where(txn, |mutation| mutation.key() == key).await
    }

    pub async fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.batches_where(txn, |mutation| keys.contains(mutation.key())).await
    }

    pub async fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.batches_where(txn, |mutation| query.matches_path(mutation.key()))
            .await
    }

    async fn batches_where(
        &self,
        txn: &PersistenceTransaction,
        affects: impl Fn(&Mutation) -> bool,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .get_all_mutation_batches(txn)
            .await?
            .into_iter()
            .filter(|batch| batch.mutations.iter().any(&affects))
            .collect())
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub async fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let head = self.all_records(txn).await?.first().map(|record| record.batch_id);
        if head != Some(batch.batch_id) {
            return Err(assertion_failure(format!(
                "Can only remove the first entry of the mutation queue (expected {:?}, got {})",
                head, batch.batch_id
            )));
        }
        txn.delete(StoreName::Mutations, batch_key(batch.batch_id));
        Ok(())
    }

    /// Records the acknowledgement of `batch` together with the stream token that
    /// came with it.
    pub async fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn).await?;
        if batch.batch_id <= metadata.last_acknowledged_batch_id {
            return Err(assertion_failure(format!(
                "Mutation batch {} acknowledged out of order (last acknowledged {})",
                batch.batch_id, metadata.last_acknowledged_batch_id
            )));
        }
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = self.serializer.remote_serializer().encode_bytes(stream_token);
        txn.put_record(StoreName::Metadata, MUTATION_QUEUE_KEY, &metadata)
    }

    pub async fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction) -> FirestoreResult<i32> {
        Ok(self
            .all_records(txn)
            .await?
            .last()
            .map(|record| record.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub async fn get_last_stream_token(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        let metadata = self.metadata(txn).await?;
        if metadata.last_stream_token.is_empty() {
            return Ok(Vec::new());
        }
        self.serializer
            .remote_serializer()
            .decode_bytes(Some(&serde_json::Value::String(metadata.last_stream_token)))
    }

    pub async fn set_last_stream_token(&self, txn: &mut PersistenceTransaction, token: &[u8]) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn).await?;
        metadata.last_stream_token = self.serializer.remote_serializer().encode_bytes(token);
        txn.put_record(StoreName::Metadata, MUTATION_QUEUE_KEY, &metadata)
    }
}

fn batch_key(batch_id: i32) -> String {
    format!("{batch_id:010}")
}
