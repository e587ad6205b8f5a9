//! Profile persistence accessors
//!
//! The server only ever hands a store full snapshot bytes keyed by owner id;
//! the store never interprets them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed for {owner_id}: {source}")]
    Io {
        owner_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored record for {owner_id} is corrupt: {reason}")]
    Corrupt { owner_id: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Loads the last saved snapshot, if any
    async fn restore(&self, owner_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Saves a full snapshot, replacing any earlier one
    async fn insert_or_update(&self, owner_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Keeps snapshots in memory; used by tests and when no data directory is set
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn restore(&self, owner_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.read().await.get(owner_id).cloned())
    }

    async fn insert_or_update(&self, owner_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(owner_id.to_string(), snapshot.to_vec());
        Ok(())
    }
}

/// On-disk record wrapping a snapshot
#[derive(Debug, Serialize, Deserialize)]
struct StoredProfile {
    owner_id: String,
    saved_at_ms: u64,
    snapshot: Vec<u8>,
}

/// Stores one bincode record per owner in a directory
///
/// Writes to the same file are serialized and each goes through its own
/// temporary file, so concurrent saves never interleave.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    writers: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
    next_temp: Arc<AtomicU64>,
}

impl FileStore {
    fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            writers: Arc::default(),
            next_temp: Arc::default(),
        }
    }

    /// Opens (and creates if needed) the data directory
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                owner_id: String::new(),
                source,
            })?;
        Ok(Self::with_root(root))
    }

    fn path_for(&self, owner_id: &str) -> PathBuf {
        // owner ids come from clients; keep file names to a safe alphabet
        let file_name: String = owner_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.profile", file_name))
    }

    /// Lock guarding writes to `path`; sanitized ids may share a file
    fn writer_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(writers.entry(path.to_path_buf()).or_default())
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.next_temp.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("profile.{}.{}.tmp", std::process::id(), n))
    }
}

#[async_trait]
impl ProfileStore for FileStore {
    async fn restore(&self, owner_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(owner_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    owner_id: owner_id.to_string(),
                    source,
                })
            }
        };

        let record: StoredProfile =
            bincode::deserialize(&data).map_err(|err| StoreError::Corrupt {
                owner_id: owner_id.to_string(),
                reason: err.to_string(),
            })?;
        if record.owner_id != owner_id {
            return Err(StoreError::Corrupt {
                owner_id: owner_id.to_string(),
                reason: format!("record belongs to {}", record.owner_id),
            });
        }

        debug!(
            "Restored {} ({} bytes, saved at {})",
            owner_id,
            record.snapshot.len(),
            record.saved_at_ms
        );
        Ok(Some(record.snapshot))
    }

    async fn insert_or_update(&self, owner_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let record = StoredProfile {
            owner_id: owner_id.to_string(),
            saved_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::from_secs(0))
                .as_millis() as u64,
            snapshot: snapshot.to_vec(),
        };
        let data = bincode::serialize(&record).map_err(|err| StoreError::Corrupt {
            owner_id: owner_id.to_string(),
            reason: err.to_string(),
        })?;

        // readers never observe a half-written record
        let path = self.path_for(owner_id);
        let temp = self.temp_path(&path);
        let io_err = |source| StoreError::Io {
            owner_id: owner_id.to_string(),
            source,
        };

        let writer = self.writer_for(&path);
        let _writing = writer.lock().await;
        if let Err(err) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err(err));
        }
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err(err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "profile-store-{}-{}",
            name,
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.restore("alice").await.unwrap(), None);

        store.insert_or_update("alice", &[1, 2, 3]).await.unwrap();
        store.insert_or_update("alice", &[4]).await.unwrap();

        assert_eq!(store.restore("alice").await.unwrap(), Some(vec![4]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = scratch_dir("round-trip");
        let store = FileStore::open(&dir).await.unwrap();

        assert_eq!(store.restore("bob").await.unwrap(), None);
        store.insert_or_update("bob", &[9, 8, 7]).await.unwrap();
        assert_eq!(store.restore("bob").await.unwrap(), Some(vec![9, 8, 7]));

        let reopened = FileStore::open(&dir).await.unwrap();
        assert_eq!(reopened.restore("bob").await.unwrap(), Some(vec![9, 8, 7]));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = scratch_dir("garbage");
        let store = FileStore::open(&dir).await.unwrap();
        std::fs::write(store.path_for("carol"), b"\x01").unwrap();

        let err = store.restore("carol").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_one_whole_record() {
        let dir = scratch_dir("concurrent");
        let store = FileStore::open(&dir).await.unwrap();
        let first = vec![1u8; 64 * 1024];
        let second = vec![2u8; 64 * 1024];

        let (a, b) = tokio::join!(
            store.insert_or_update("dave", &first),
            store.insert_or_update("dave", &second)
        );
        assert!(a.is_ok(), "{:?}", a);
        assert!(b.is_ok(), "{:?}", b);

        let saved = store.restore("dave").await.unwrap().unwrap();
        assert!(saved == first || saved == second);

        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_temp_files_are_unique() {
        let store = FileStore::with_root(PathBuf::from("/data"));
        let path = store.path_for("erin");
        assert_ne!(store.temp_path(&path), store.temp_path(&path));
        assert!(Arc::ptr_eq(&store.writer_for(&path), &store.writer_for(&path)));
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let store = FileStore::with_root(PathBuf::from("/data"));
        assert_eq!(
            store.path_for("../evil/name"),
            PathBuf::from("/data/___evil_name.profile")
        );
    }
}
