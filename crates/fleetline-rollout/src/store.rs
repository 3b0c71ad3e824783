//! Content-addressed bundle storage
//!
//! Bundles are keyed by the lowercase hex sha256 of their bytes. Reads verify
//! the hash, so a store never hands out bytes that differ from what was put.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetline_transport::protocol::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Where bundle bytes are kept.
#[async_trait::async_trait]
pub trait BundleStore: Send + Sync {
    /// Bytes stored under `checksum`, `None` when absent.
    async fn get(&self, checksum: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store bytes and return their checksum.
    async fn put(&self, data: &[u8]) -> Result<String, StoreError>;

    /// Whether a bundle is stored under `checksum`.
    async fn contains(&self, checksum: &str) -> bool;
}

/// Bundle store held in memory.
#[derive(Default)]
pub struct InMemoryBundleStore {
    blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryBundleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a bundle.
    pub async fn remove(&self, checksum: &str) -> bool {
        self.blobs.write().await.remove(checksum).is_some()
    }
}

#[async_trait::async_trait]
impl BundleStore for InMemoryBundleStore {
    async fn get(&self, checksum: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self.blobs.read().await.get(checksum).cloned();
        Ok(blob.map(|b| b.as_ref().clone()))
    }

    async fn put(&self, data: &[u8]) -> Result<String, StoreError> {
        let checksum = sha256_hex(data);
        self.blobs
            .write()
            .await
            .entry(checksum.clone())
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(checksum)
    }

    async fn contains(&self, checksum: &str) -> bool {
        self.blobs.read().await.contains_key(checksum)
    }
}

/// Index entry of a file-backed bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBundle {
    /// Bundle size in bytes
    pub size_bytes: u64,
    /// When the bundle was first stored
    pub stored_at: DateTime<Utc>,
    /// File holding the bytes
    pub path: PathBuf,
}

/// Bundle store backed by a directory: one `<checksum>.bin` per bundle plus
/// an `index.json`.
pub struct FileBundleStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, StoredBundle>>,
}

impl FileBundleStore {
    /// Open a store under `dir`, creating it if needed. Index entries whose
    /// file has gone missing are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the index is
    /// unreadable.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self {
            dir,
            index: RwLock::new(HashMap::new()),
        };
        store.load_index().await?;
        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    async fn load_index(&self) -> Result<(), StoreError> {
        let index_path = self.index_path();
        if !tokio::fs::try_exists(&index_path).await? {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&index_path).await?;
        let loaded: HashMap<String, StoredBundle> = serde_json::from_str(&content)?;

        let mut valid = HashMap::new();
        for (checksum, entry) in loaded {
            if tokio::fs::try_exists(&entry.path).await? {
                valid.insert(checksum, entry);
            } else {
                warn!(checksum = %checksum, path = ?entry.path, "Stored bundle missing, dropping from index");
            }
        }

        info!(dir = ?self.dir, bundles = valid.len(), "Bundle store opened");
        *self.index.write().await = valid;
        Ok(())
    }

    async fn save_index(&self, index: &HashMap<String, StoredBundle>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(index)?;
        let path = self.index_path();
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Index entry for a bundle.
    pub async fn info(&self, checksum: &str) -> Option<StoredBundle> {
        self.index.read().await.get(checksum).cloned()
    }

    async fn evict(&self, checksum: &str) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        if let Some(entry) = index.remove(checksum) {
            if tokio::fs::try_exists(&entry.path).await? {
                tokio::fs::remove_file(&entry.path).await?;
            }
            self.save_index(&index).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BundleStore for FileBundleStore {
    async fn get(&self, checksum: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entry = self.index.read().await.get(checksum).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        let data = tokio::fs::read(&entry.path).await?;
        let actual = sha256_hex(&data);
        if actual != checksum {
            warn!(expected = %checksum, actual = %actual, "Stored bundle hash mismatch, evicting");
            self.evict(checksum).await?;
            return Err(StoreError::Corrupt {
                expected: checksum.to_string(),
                actual,
            });
        }

        debug!(checksum = %checksum, bytes = data.len(), "Read bundle");
        Ok(Some(data))
    }

    async fn put(&self, data: &[u8]) -> Result<String, StoreError> {
        let checksum = sha256_hex(data);
        let mut index = self.index.write().await;
        if index.contains_key(&checksum) {
            return Ok(checksum);
        }

        let path = self.dir.join(format!("{checksum}.bin"));
        tokio::fs::write(&path, data).await?;
        index.insert(
            checksum.clone(),
            StoredBundle {
                size_bytes: u64::try_from(data.len()).unwrap_or(u64::MAX),
                stored_at: Utc::now(),
                path,
            },
        );
        self.save_index(&index).await?;

        info!(checksum = %checksum, bytes = data.len(), "Stored bundle");
        Ok(checksum)
    }

    async fn contains(&self, checksum: &str) -> bool {
        self.index.read().await.contains_key(checksum)
    }
}
