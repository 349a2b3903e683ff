//! Persistence: snapshot artifacts on disk, node metadata in sled, and the
//! object-store interface used for cloud off-load and rollback.
//!
//! Snapshot artifacts are flat files keyed by snapshot hash:
//! `snapshot/<hash>` holds the [`StoredSnapshot`](crate::snapshot::StoredSnapshot)
//! and `snapshot_info/<hash>` the full resumable state. The sled tree keeps
//! the small durable facts: the last majority state and the total block
//! counter.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Hash;

/// Upper bound for a single persisted artifact (1 GiB).
const MAX_ARTIFACT_BYTES: u64 = 1024 * 1024 * 1024;

/// Errors from persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("artifact not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

fn bincode_config() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(MAX_ARTIFACT_BYTES)
}

/// Serialize a persisted artifact.
pub fn serialize_artifact<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode_config()
        .serialize(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Deserialize a persisted artifact, bounding allocations.
pub fn deserialize_artifact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode_config()
        .deserialize(bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Flat-file store for snapshot artifacts.
pub struct SnapshotFileStorage {
    snapshot_dir: PathBuf,
    info_dir: PathBuf,
}

impl SnapshotFileStorage {
    /// Create the store under `base_dir`, creating directories as needed.
    pub fn open(base_dir: &Path) -> Result<Self, StorageError> {
        let snapshot_dir = base_dir.join("snapshot");
        let info_dir = base_dir.join("snapshot_info");
        std::fs::create_dir_all(&snapshot_dir)?;
        std::fs::create_dir_all(&info_dir)?;
        Ok(SnapshotFileStorage {
            snapshot_dir,
            info_dir,
        })
    }

    fn snapshot_path(&self, hash: &Hash) -> PathBuf {
        self.snapshot_dir.join(crate::hash_hex(hash))
    }

    fn info_path(&self, hash: &Hash) -> PathBuf {
        self.info_dir.join(crate::hash_hex(hash))
    }

    pub async fn write_snapshot(&self, hash: &Hash, bytes: &[u8]) -> Result<(), StorageError> {
        tokio::fs::write(self.snapshot_path(hash), bytes).await?;
        Ok(())
    }

    pub async fn read_snapshot(&self, hash: &Hash) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.snapshot_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(crate::hash_hex(hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_snapshot_info(&self, hash: &Hash, bytes: &[u8]) -> Result<(), StorageError> {
        tokio::fs::write(self.info_path(hash), bytes).await?;
        Ok(())
    }

    pub async fn read_snapshot_info(&self, hash: &Hash) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.info_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(crate::hash_hex(hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Free bytes on the volume holding the snapshot directory.
    pub fn usable_space(&self) -> u64 {
        fs2::available_space(&self.snapshot_dir).unwrap_or(0)
    }

    /// Total bytes currently used by stored snapshots.
    pub fn used_space(&self) -> u64 {
        let dir_size = |dir: &Path| -> u64 {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .flatten()
                        .filter_map(|e| e.metadata().ok())
                        .map(|m| m.len())
                        .sum()
                })
                .unwrap_or(0)
        };
        dir_size(&self.snapshot_dir) + dir_size(&self.info_dir)
    }

    /// Delete the oldest stored snapshots (by modification time), keeping
    /// the newest `keep`. Returns how many were removed.
    pub fn remove_oldest_snapshots(&self, keep: usize) -> usize {
        let mut entries: Vec<(std::time::SystemTime, PathBuf, String)> = Vec::new();
        if let Ok(dir) = std::fs::read_dir(&self.snapshot_dir) {
            for entry in dir.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        entries.push((modified, entry.path(), name));
                    }
                }
            }
        }
        if entries.len() <= keep {
            return 0;
        }
        entries.sort_by_key(|(modified, _, _)| *modified);
        let to_remove = entries.len() - keep;
        let mut removed = 0;
        for (_, path, name) in entries.into_iter().take(to_remove) {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            let _ = std::fs::remove_file(self.info_dir.join(&name));
        }
        removed
    }

    /// Hex hashes of all snapshots currently on disk.
    pub fn list_snapshot_hashes(&self) -> Vec<String> {
        std::fs::read_dir(&self.snapshot_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Durable node metadata (sled-backed).
pub struct MetaStorage {
    tree: sled::Db,
}

impl MetaStorage {
    pub fn open(base_dir: &Path) -> Result<Self, StorageError> {
        let db = sled::open(base_dir.join("meta")).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(MetaStorage { tree: db })
    }

    /// Open a temporary store (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(MetaStorage { tree: db })
    }

    /// Persist the latest majority state `(height, hash)`.
    pub fn set_last_majority_state(&self, height: u64, hash: &Hash) -> Result<(), StorageError> {
        let mut value = height.to_le_bytes().to_vec();
        value.extend_from_slice(hash);
        self.tree
            .insert(b"last_majority_state", value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.tree
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn last_majority_state(&self) -> Result<Option<(u64, Hash)>, StorageError> {
        let Some(value) = self
            .tree
            .get(b"last_majority_state")
            .map_err(|e| StorageError::Io(e.to_string()))?
        else {
            return Ok(None);
        };
        if value.len() != 8 + 32 {
            return Err(StorageError::Serialization(
                "malformed last_majority_state entry".into(),
            ));
        }
        let height = u64::from_le_bytes(value[..8].try_into().expect("length checked"));
        let hash: Hash = value[8..].try_into().expect("length checked");
        Ok(Some((height, hash)))
    }

    pub fn set_total_checkpoint_blocks(&self, total: u64) -> Result<(), StorageError> {
        self.tree
            .insert(b"total_checkpoint_blocks", total.to_le_bytes().to_vec())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn total_checkpoint_blocks(&self) -> u64 {
        self.tree
            .get(b"total_checkpoint_blocks")
            .ok()
            .flatten()
            .and_then(|v| v.as_ref().try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0)
    }
}

/// Errors from object-store access.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store I/O failure: {0}")]
    Io(String),
}

/// Minimal interface over an external object store (cloud bucket or local
/// directory). Rollback reads through an ordered list of these.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;
    async fn list(&self) -> Result<Vec<String>, ObjectStoreError>;
}

/// Directory-backed object store; also the local stand-in for tests.
pub struct DirectoryObjectStore {
    dir: PathBuf,
}

impl DirectoryObjectStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        Ok(DirectoryObjectStore {
            dir: dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl ObjectStore for DirectoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        match tokio::fs::read(self.dir.join(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(ObjectStoreError::Io(e.to_string())),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        tokio::fs::write(self.dir.join(key), bytes)
            .await
            .map_err(|e| ObjectStoreError::Io(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ObjectStoreError::Io(e.to_string()))?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out)
    }
}
