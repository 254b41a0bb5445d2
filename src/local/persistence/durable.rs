use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{failed_precondition, unavailable, FirestoreResult};
use crate::local::persistence::{apply_writes, scan_store, Persistence, StoreMap, StoreName, WriteRecord};

/// Number of logged commits after which the log is folded into the snapshot.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 1_000;

const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";
const LOG_FILE: &str = "commits.log";

/// File-backed persistence.
///
/// State lives in a directory holding `snapshot.json` (every store as of the last
/// compaction) and `commits.log` (one JSON line per committed write set since
/// then). Reads are served from an in-memory mirror rebuilt on open. Each commit
/// is appended to the log and synced before it becomes visible.
pub struct DurablePersistence {
    directory: PathBuf,
    compaction_threshold: usize,
    state: Mutex<DurableState>,
}

struct DurableState {
    stores: StoreMap,
    log: Option<File>,
    log_entries: usize,
}

impl std::fmt::Debug for DurablePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurablePersistence")
            .field("directory", &self.directory)
            .finish()
    }
}

impl DurablePersistence {
    pub fn open(directory: impl AsRef<Path>) -> FirestoreResult<Self> {
        Self::open_with_compaction_threshold(directory, DEFAULT_COMPACTION_THRESHOLD)
    }

    pub fn open_with_compaction_threshold(
        directory: impl AsRef<Path>,
        compaction_threshold: usize,
    ) -> FirestoreResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)
            .map_err(|err| unavailable(format!("Failed to create persistence directory: {err}")))?;

        let mut stores = load_snapshot(&directory.join(SNAPSHOT_FILE))?;
        let log_entries = replay_log(&directory.join(LOG_FILE), &mut stores)?;
        let log = open_log(&directory)?;
        log::debug!(
            "opened durable persistence at {} ({} logged commits)",
            directory.display(),
            log_entries
        );

        Ok(Self {
            directory,
            compaction_threshold: compaction_threshold.max(1),
            state: Mutex::new(DurableState {
                stores,
                log: Some(log),
                log_entries,
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn compact(&self, state: &mut DurableState) -> FirestoreResult<()> {
        let named: BTreeMap<&str, &BTreeMap<String, JsonValue>> = state
            .stores
            .iter()
            .map(|(store, entries)| (store.as_str(), entries))
            .collect();
        let serialized = serde_json::to_vec(&named)
            .map_err(|err| unavailable(format!("Failed to serialize persistence snapshot: {err}")))?;
        let tmp_path = self.directory.join(SNAPSHOT_TMP_FILE);
        let mut tmp = File::create(&tmp_path)
            .map_err(|err| unavailable(format!("Failed to create persistence snapshot: {err}")))?;
        tmp.write_all(&serialized)
            .and_then(|_| tmp.sync_all())
            .map_err(|err| unavailable(format!("Failed to write persistence snapshot: {err}")))?;
        fs::rename(&tmp_path, self.directory.join(SNAPSHOT_FILE))
            .map_err(|err| unavailable(format!("Failed to install persistence snapshot: {err}")))?;

        let log = File::create(self.directory.join(LOG_FILE))
            .map_err(|err| unavailable(format!("Failed to truncate commit log: {err}")))?;
        drop(log);
        state.log = Some(open_log(&self.directory)?);
        state.log_entries = 0;
        log::debug!("compacted durable persistence at {}", self.directory.display());
        Ok(())
    }
}

#[async_trait]
impl Persistence for DurablePersistence {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn get(&self, store: StoreName, key: &str) -> FirestoreResult<Option<JsonValue>> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ensure_open(&state)?;
        Ok(state.stores.get(&store).and_then(|entries| entries.get(key)).cloned())
    }

    async fn scan(&self, store: StoreName, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ensure_open(&state)?;
        Ok(scan_store(&state.stores, store, prefix))
    }

    async fn commit(&self, writes: Vec<WriteRecord>) -> FirestoreResult<()> {
        let mut line = serde_json::to_vec(&writes)
            .map_err(|err| unavailable(format!("Failed to serialize commit: {err}")))?;
        line.push(b'\n');

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ensure_open(&state)?;
        let log = state
            .log
            .as_mut()
            .ok_or_else(|| failed_precondition("The client has already been shut down."))?;
        append_or_roll_back(log, |log| log.write_all(&line).and_then(|_| log.sync_data()))?;

        apply_writes(&mut state.stores, &writes);
        state.log_entries += 1;
        if state.log_entries >= self.compaction_threshold {
            // The commit is already durable through the log; a failed compaction
            // only delays folding it into the snapshot.
            if let Err(err) = self.compact(&mut state) {
                log::warn!("persistence compaction failed: {err}");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(log) = state.log.take() {
            log.sync_all()
                .map_err(|err| unavailable(format!("Failed to flush commit log: {err}")))?;
        }
        Ok(())
    }
}

/// Runs `append` against the log and truncates the log back to its previous
/// length if it fails, so a partial line never precedes a later commit.
fn append_or_roll_back(log: &mut File, append: impl FnOnce(&mut File) -> io::Result<()>) -> FirestoreResult<()> {
    let committed_len = log
        .metadata()
        .map_err(|err| unavailable(format!("Failed to inspect commit log: {err}")))?
        .len();
    let Err(err) = append(log) else {
        return Ok(());
    };
    if let Err(truncate_err) = log.set_len(committed_len) {
        log::error!("failed to roll back commit log after a failed append: {truncate_err}");
    }
    Err(unavailable(format!("Failed to append to commit log: {err}")))
}

fn ensure_open(state: &DurableState) -> FirestoreResult<()> {
    if state.log.is_none() {
        return Err(failed_precondition("The client has already been shut down."));
    }
    Ok(())
}

fn open_log(directory: &Path) -> FirestoreResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(directory.join(LOG_FILE))
        .map_err(|err| unavailable(format!("Failed to open commit log: {err}")))
}

fn load_snapshot(path: &Path) -> FirestoreResult<StoreMap> {
    if !path.exists() {
        return Ok(StoreMap::new());
    }
    let bytes = fs::read(path).map_err(|err| unavailable(format!("Failed to read persistence snapshot: {err}")))?;
    if bytes.is_empty() {
        return Ok(StoreMap::new());
    }
    let named: BTreeMap<String, BTreeMap<String, JsonValue>> = serde_json::from_slice(&bytes)
        .map_err(|err| unavailable(format!("Corrupt persistence snapshot: {err}")))?;
    let mut stores = StoreMap::new();
    for (name, entries) in named {
        let store = StoreName::from_name(&name)
            .ok_or_else(|| unavailable(format!("Unknown store '{name}' in persistence snapshot")))?;
        stores.insert(store, entries);
    }
    Ok(stores)
}

/// Replays logged commits on top of the snapshot. A final line that fails to parse
/// is a torn write from a crash mid-append; it is dropped from the log.
fn replay_log(path: &Path, stores: &mut StoreMap) -> FirestoreResult<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path).map_err(|err| unavailable(format!("Failed to open commit log: {err}")))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| unavailable(format!("Failed to read commit log: {err}")))?;

    let mut applied = 0;
    let last_index = lines.len().saturating_sub(1);
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Vec<WriteRecord>>(line) {
            Ok(writes) => {
                apply_writes(stores, &writes);
                applied += 1;
            }
            Err(err) if index == last_index => {
                log::warn!("dropping torn commit log entry: {err}");
                let mut rewritten = String::new();
                for valid in &lines[..index] {
                    rewritten.push_str(valid);
                    rewritten.push('\n');
                }
                fs::write(path, rewritten)
                    .map_err(|err| unavailable(format!("Failed to repair commit log: {err}")))?;
            }
            Err(err) => return Err(unavailable(format!("Corrupt commit log entry {index}: {err}"))),
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-sync-durable-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&path);
        path
    }

    fn put(key: &str, value: JsonValue) -> WriteRecord {
        WriteRecord::Put {
            store: StoreName::RemoteDocuments,
            key: key.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = temp_dir("reopen");
        {
            let persistence = DurablePersistence::open(&dir).unwrap();
            persistence.commit(vec![put("docs/a", json!({"x": 1}))]).await.unwrap();
            persistence
                .commit(vec![
                    put("docs/b", json!({"x": 2})),
                    WriteRecord::Delete {
                        store: StoreName::RemoteDocuments,
                        key: "docs/a".into(),
                    },
                ])
                .await
                .unwrap();
            persistence.shutdown().await.unwrap();
        }

        let reopened = DurablePersistence::open(&dir).unwrap();
        assert!(reopened.get(StoreName::RemoteDocuments, "docs/a").await.unwrap().is_none());
        assert_eq!(
            reopened.get(StoreName::RemoteDocuments, "docs/b").await.unwrap(),
            Some(json!({"x": 2}))
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn compacts_and_ignores_torn_tail() {
        let dir = temp_dir("compact");
        {
            let persistence = DurablePersistence::open_with_compaction_threshold(&dir, 2).unwrap();
            for index in 0..3 {
                persistence
                    .commit(vec![put(&format!("docs/{index}"), json!(index))])
                    .await
                    .unwrap();
            }
            persistence.shutdown().await.unwrap();
        }
        assert!(dir.join(SNAPSHOT_FILE).exists());

        let mut log = OpenOptions::new().append(true).open(dir.join(LOG_FILE)).unwrap();
        log.write_all(b"[{\"op\":\"put\",\"sto").unwrap();
        drop(log);

        let reopened = DurablePersistence::open(&dir).unwrap();
        let scanned = reopened.scan(StoreName::RemoteDocuments, "docs/").await.unwrap();
        assert_eq!(scanned.len(), 3);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rejects_use_after_shutdown() {
        let dir = temp_dir("shutdown");
        let persistence = DurablePersistence::open(&dir).unwrap();
        persistence.shutdown().await.unwrap();
        let err = persistence.commit(vec![put("docs/a", json!(1))]).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back_before_the_next_commit() {
        let dir = temp_dir("rollback");
        {
            let persistence = DurablePersistence::open(&dir).unwrap();
            persistence.commit(vec![put("docs/a", json!(1))]).await.unwrap();
            {
                let mut state = persistence.state.lock().unwrap();
                let log = state.log.as_mut().unwrap();
                let err = append_or_roll_back(log, |log| {
                    log.write_all(br#"[{"Put":{"store":"#)?;
                    Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
                })
                .unwrap_err();
                assert_eq!(err.code_str(), "firestore/unavailable");
            }
            persistence.commit(vec![put("docs/b", json!(2))]).await.unwrap();
            persistence.shutdown().await.unwrap();
        }

        let reopened = DurablePersistence::open(&dir).unwrap();
        assert_eq!(reopened.get(StoreName::RemoteDocuments, "docs/a").await.unwrap(), Some(json!(1)));
        assert_eq!(reopened.get(StoreName::RemoteDocuments, "docs/b").await.unwrap(), Some(json!(2)));
        let _ = fs::remove_dir_all(dir);
    }
}
