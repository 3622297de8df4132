//! Single-file persistent blob store
//!
//! State that must survive restarts (prefix databases, allocated indices,
//! operator overrides) lives here as (key, serialized-blob) pairs. The
//! backing file is a format marker followed by length-prefixed journal
//! records, each carrying an integrity tag; mutations append records and a
//! compaction rewrites the file as one snapshot when the journal grows.
//! Flushes are debounced and back off on I/O errors.

use crate::error::{Result, StorageError, TrellisError};
use crate::protocol::{StoreRecord, StoreRecordAction};
use crate::utils::ExponentialBackoff;
use prost::Message;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Magic bytes opening every store file
const FORMAT_MARKER: &[u8] = b"TrellisStoreV1\n";

/// Journal records tolerated before a snapshot rewrite
const COMPACT_THRESHOLD: usize = 128;

enum StoreCmd {
    Store {
        key: String,
        value: Vec<u8>,
        resp: oneshot::Sender<Result<()>>,
    },
    Load {
        key: String,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    Erase {
        key: String,
        resp: oneshot::Sender<Result<bool>>,
    },
}

/// Handle for submitting operations to the store task
#[derive(Clone)]
pub struct ConfigStore {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl ConfigStore {
    /// Store raw bytes under a key
    pub async fn store(&self, key: impl Into<String>, value: Vec<u8>) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::Store {
                key: key.into(),
                value,
                resp,
            })
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?;
        rx.await
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?
    }

    /// Load raw bytes for a key
    pub async fn load(&self, key: impl Into<String>) -> Result<Vec<u8>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::Load {
                key: key.into(),
                resp,
            })
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?;
        rx.await
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?
    }

    /// Erase a key; `Ok(false)` when it did not exist
    pub async fn erase(&self, key: impl Into<String>) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(StoreCmd::Erase {
                key: key.into(),
                resp,
            })
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?;
        rx.await
            .map_err(|_| TrellisError::from(StorageError::NotRunning))?
    }

    /// Store a typed object (prost-encoded)
    pub async fn store_obj<T: Message>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        self.store(key, value.encode_to_vec()).await
    }

    /// Load a typed object; decode failures are surfaced, not swallowed
    pub async fn load_obj<T: Message + Default>(&self, key: impl Into<String>) -> Result<T> {
        let key = key.into();
        let bytes = self.load(key.clone()).await?;
        T::decode(bytes.as_slice()).map_err(|e| {
            StorageError::DecodeFailed {
                key,
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// The store itself; construct, then [`PersistentStore::spawn`]
pub struct PersistentStore {
    path: PathBuf,
    dryrun: bool,
    database: HashMap<String, Vec<u8>>,
    pending: Vec<StoreRecord>,
    records_on_disk: usize,
    flush_debounce: Duration,
    flush_backoff: ExponentialBackoff,
    writes_to_disk: u64,
}

impl PersistentStore {
    /// Open (or create) the store at `path`, loading existing contents
    ///
    /// A corrupt or truncated tail is tolerated: everything up to the
    /// damage is kept and the file is rewritten on the next flush.
    pub fn new(
        path: impl Into<PathBuf>,
        flush_initial: Duration,
        flush_max: Duration,
        dryrun: bool,
    ) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            dryrun,
            database: HashMap::new(),
            pending: Vec::new(),
            records_on_disk: 0,
            flush_debounce: flush_initial,
            flush_backoff: ExponentialBackoff::new(flush_initial, flush_max),
            writes_to_disk: 0,
        };
        if !dryrun {
            store.load_from_disk()?;
        }
        Ok(store)
    }

    /// Number of completed disk writes (snapshot + journal appends)
    pub fn writes_to_disk(&self) -> u64 {
        self.writes_to_disk
    }

    /// Spawn the owning task and return the client handle
    pub fn spawn(mut self) -> ConfigStore {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut flush_deadline: Option<tokio::time::Instant> = None;
            loop {
                let sleep_until = flush_deadline
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            None => {
                                // clients gone; final flush and exit
                                if let Err(e) = self.flush() {
                                    warn!("final store flush failed: {}", e);
                                }
                                break;
                            }
                            Some(cmd) => {
                                if self.handle_cmd(cmd) && flush_deadline.is_none() {
                                    // debounce; stretched while flushes are failing
                                    let wait = self
                                        .flush_debounce
                                        .max(self.flush_backoff.time_remaining_until_retry());
                                    flush_deadline =
                                        Some(tokio::time::Instant::now() + wait);
                                }
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(sleep_until), if flush_deadline.is_some() => {
                        flush_deadline = None;
                        match self.flush() {
                            Ok(()) => self.flush_backoff.report_success(),
                            Err(e) => {
                                warn!("store flush failed, backing off: {}", e);
                                self.flush_backoff.report_error();
                                flush_deadline = Some(
                                    tokio::time::Instant::now()
                                        + self.flush_backoff.current_backoff(),
                                );
                            }
                        }
                    }
                }
            }
        });
        ConfigStore { tx }
    }

    /// Returns true when the mutation made a flush necessary
    fn handle_cmd(&mut self, cmd: StoreCmd) -> bool {
        match cmd {
            StoreCmd::Store { key, value, resp } => {
                self.database.insert(key.clone(), value.clone());
                self.pending.push(StoreRecord {
                    action: StoreRecordAction::Add as i32,
                    key,
                    data: Some(value),
                });
                let _ = resp.send(Ok(()));
                !self.dryrun
            }
            StoreCmd::Load { key, resp } => {
                let result = match self.database.get(&key) {
                    Some(value) => Ok(value.clone()),
                    None => Err(StorageError::NotFound { key }.into()),
                };
                let _ = resp.send(result);
                false
            }
            StoreCmd::Erase { key, resp } => {
                let existed = self.database.remove(&key).is_some();
                if existed {
                    self.pending.push(StoreRecord {
                        action: StoreRecordAction::Del as i32,
                        key,
                        data: None,
                    });
                }
                let _ = resp.send(Ok(existed));
                existed && !self.dryrun
            }
        }
    }

    fn load_from_disk(&mut self) -> Result<()> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source: e,
                }
                .into())
            }
        };
        if bytes.is_empty() {
            return Ok(());
        }
        if !bytes.starts_with(FORMAT_MARKER) {
            return Err(StorageError::Corrupt {
                path: self.path.clone(),
                reason: "missing format marker".to_string(),
            }
            .into());
        }

        let mut offset = FORMAT_MARKER.len();
        let mut loaded = 0usize;
        while offset < bytes.len() {
            match decode_record(&bytes[offset..]) {
                Some((record, consumed)) => {
                    offset += consumed;
                    loaded += 1;
                    match StoreRecordAction::try_from(record.action) {
                        Ok(StoreRecordAction::Add) => {
                            self.database
                                .insert(record.key, record.data.unwrap_or_default());
                        }
                        Ok(StoreRecordAction::Del) => {
                            self.database.remove(&record.key);
                        }
                        Err(_) => {
                            warn!("skipping store record with unknown action");
                        }
                    }
                }
                None => {
                    // crash mid-append leaves a ragged tail; keep the prefix
                    warn!(
                        "store file {} has a corrupt tail at offset {}, keeping {} records",
                        self.path.display(),
                        offset,
                        loaded
                    );
                    break;
                }
            }
        }
        self.records_on_disk = loaded;
        debug!(
            "loaded {} keys from {}",
            self.database.len(),
            self.path.display()
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dryrun {
            self.pending.clear();
            return Ok(());
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.records_on_disk + self.pending.len() > COMPACT_THRESHOLD {
            self.write_snapshot()?;
        } else {
            self.append_journal()?;
        }
        self.pending.clear();
        self.writes_to_disk += 1;
        Ok(())
    }

    fn append_journal(&mut self) -> Result<()> {
        let io_err = |e: std::io::Error| StorageError::Io {
            path: self.path.clone(),
            source: e,
        };
        let fresh = !self.path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let mut buf = Vec::new();
        if fresh {
            buf.extend_from_slice(FORMAT_MARKER);
        }
        for record in &self.pending {
            encode_record(record, &mut buf);
        }
        file.write_all(&buf).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        self.records_on_disk += self.pending.len();
        Ok(())
    }

    fn write_snapshot(&mut self) -> Result<()> {
        let io_err = |e: std::io::Error| StorageError::Io {
            path: self.path.clone(),
            source: e,
        };
        let tmp_path = self.path.with_extension("tmp");
        let mut buf = Vec::with_capacity(FORMAT_MARKER.len() + self.database.len() * 64);
        buf.extend_from_slice(FORMAT_MARKER);
        let mut count = 0usize;
        for (key, value) in &self.database {
            let record = StoreRecord {
                action: StoreRecordAction::Add as i32,
                key: key.clone(),
                data: Some(value.clone()),
            };
            encode_record(&record, &mut buf);
            count += 1;
        }
        std::fs::write(&tmp_path, &buf).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        self.records_on_disk = count;
        debug!("compacted store to {} records", count);
        Ok(())
    }
}

/// Frame: [u32 len][record bytes][u64 blake3 tag of record bytes]
fn encode_record(record: &StoreRecord, out: &mut Vec<u8>) {
    let body = record.encode_to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    let tag = record_tag(&body);
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag.to_be_bytes());
}

fn decode_record(bytes: &[u8]) -> Option<(StoreRecord, usize)> {
    if bytes.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let total = 4 + len + 8;
    if bytes.len() < total {
        return None;
    }
    let body = &bytes[4..4 + len];
    let mut tag_bytes = [0u8; 8];
    tag_bytes.copy_from_slice(&bytes[4 + len..total]);
    if record_tag(body) != u64::from_be_bytes(tag_bytes) {
        return None;
    }
    let record = StoreRecord::decode(body).ok()?;
    Some((record, total))
}

fn record_tag(body: &[u8]) -> u64 {
    let digest = blake3::hash(body);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PrefixDatabase;
    use tempfile::TempDir;

    fn store_at(path: &Path) -> ConfigStore {
        PersistentStore::new(
            path,
            Duration::from_millis(5),
            Duration::from_millis(50),
            false,
        )
        .unwrap()
        .spawn()
    }

    #[tokio::test]
    async fn test_store_load_erase() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir.path().join("db"));

        store.store("alpha", b"one".to_vec()).await.unwrap();
        assert_eq!(store.load("alpha").await.unwrap(), b"one");

        assert!(store.erase("alpha").await.unwrap());
        assert!(!store.erase("alpha").await.unwrap());
        assert!(store.load("alpha").await.is_err());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir.path().join("db"));

        let db = PrefixDatabase {
            this_node_name: "node1".to_string(),
            ..Default::default()
        };
        store.store_obj("prefix-db", &db).await.unwrap();
        let loaded: PrefixDatabase = store.load_obj("prefix-db").await.unwrap();
        assert_eq!(loaded, db);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let store = store_at(&path);
            store.store("persistent", b"payload".to_vec()).await.unwrap();
            store.store("erased", b"gone".to_vec()).await.unwrap();
            store.erase("erased").await.unwrap();
            // give the debounced flush time to land
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let store = store_at(&path);
        assert_eq!(store.load("persistent").await.unwrap(), b"payload");
        assert!(store.load("erased").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_tail_keeps_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let store = store_at(&path);
            store.store("kept", b"value".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // simulate a crash mid-append
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&[0x00, 0x00, 0x01, 0x00, 0xde, 0xad])
            .unwrap();
        drop(file);

        let store = store_at(&path);
        assert_eq!(store.load("kept").await.unwrap(), b"value");
    }

    #[tokio::test]
    async fn test_dryrun_touches_no_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let store = PersistentStore::new(
            &path,
            Duration::from_millis(1),
            Duration::from_millis(10),
            true,
        )
        .unwrap()
        .spawn();
        store.store("k", b"v".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_compaction_bounds_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let store = store_at(&path);
        // rewrite the same key far past the compaction threshold
        for i in 0..(COMPACT_THRESHOLD * 2) {
            store
                .store("churn", format!("value-{}", i).into_bytes())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let store2 = store_at(&path);
        let value = store2.load("churn").await.unwrap();
        assert!(String::from_utf8(value).unwrap().starts_with("value-"));
    }
}
