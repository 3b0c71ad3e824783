//! Ledger persistence: one JSON file per device, replaced atomically.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::model::ConfigurationVersion;

/// On-disk form of one device's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerFile {
    /// Device the rows belong to
    pub device_id: String,
    /// Rows in version order
    pub rows: Vec<ConfigurationVersion>,
}

/// Where ledger rows live.
#[derive(Debug, Clone)]
pub enum LedgerStorage {
    /// Process memory only
    Memory,
    /// One `<device>.json` file per device under a directory
    Directory(PathBuf),
}

/// Device ids become file names, so keep them to a safe alphabet.
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id.len() <= 128
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        && !device_id.starts_with('.')
}

impl LedgerStorage {
    fn device_path(dir: &Path, device_id: &str) -> PathBuf {
        dir.join(format!("{}.json", device_id.replace(':', "_")))
    }

    /// Persist one device's rows.
    pub async fn save(&self, file: &LedgerFile) -> LedgerResult<()> {
        let LedgerStorage::Directory(dir) = self else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(file)?;
        write_atomic(&Self::device_path(dir, &file.device_id), &content).await
    }

    /// Load every device file.
    pub async fn load_all(&self) -> LedgerResult<Vec<LedgerFile>> {
        let LedgerStorage::Directory(dir) = self else {
            return Ok(Vec::new());
        };

        async_fs::create_dir_all(dir).await?;
        let mut files = Vec::new();
        let mut entries = async_fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = async_fs::read_to_string(&path).await?;
            let mut file: LedgerFile = serde_json::from_str(&content)?;
            file.rows.sort_by_key(|row| row.version);
            debug!(path = ?path, rows = file.rows.len(), "Loaded device ledger");
            files.push(file);
        }

        info!(dir = ?dir, devices = files.len(), "Ledger loaded");
        Ok(files)
    }
}

/// Write `content` to a temp file next to `path`, then rename over it. The
/// previous file survives a failed write.
async fn write_atomic(path: &Path, content: &str) -> LedgerResult<()> {
    let temp_path = path.with_extension("tmp");
    async_fs::write(&temp_path, content).await?;
    async_fs::rename(&temp_path, path).await.map_err(LedgerError::from)?;
    debug!(path = ?path, "Ledger file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_alphabet() {
        assert!(is_valid_device_id("sensor-01"));
        assert!(is_valid_device_id("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_device_id(""));
        assert!(!is_valid_device_id("../etc/passwd"));
        assert!(!is_valid_device_id(".hidden"));
        assert!(!is_valid_device_id("with space"));
    }

    #[tokio::test]
    async fn test_memory_storage_is_noop() -> LedgerResult<()> {
        let storage = LedgerStorage::Memory;
        storage
            .save(&LedgerFile {
                device_id: "d".to_string(),
                rows: Vec::new(),
            })
            .await?;
        assert!(storage.load_all().await?.is_empty());
        Ok(())
    }
}
