//! File storage abstraction
//!
//! Queues and digest mailboxes live on the filesystem. Every write that must
//! be observed whole goes through [`FileStorage::store`], which writes a
//! temporary file and renames it into place. Renames are synced through the
//! parent directory so they survive a crash once the call returns.

use async_trait::async_trait;
use listrust_common::config::StorageConfig;
use listrust_common::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File storage trait
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Atomically store a file: readers see either the old content or all of `data`
    async fn store(&self, path: &str, data: &[u8]) -> Result<String>;

    /// Read a file
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Append to a file, creating it if needed
    async fn append(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Atomically rename a file
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file size
    async fn size(&self, path: &str) -> Result<u64>;

    /// File names (not paths) directly inside `dir`; empty if `dir` is missing
    async fn list(&self, dir: &str) -> Result<Vec<String>>;
}

const TEMP_EXT: &str = ".tmp";

/// Flush a directory entry change to disk
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Map an I/O error, keeping "not found" distinguishable from real failures
fn io_error(op: &str, path: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Storage(format!("Failed to {} {}: {}", op, path, e))
    }
}

/// Local filesystem storage
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage instance from config
    pub fn new(config: &StorageConfig) -> Result<Self> {
        match config.backend.as_str() {
            "fs" => Self::from_path(&config.path),
            other => Err(Error::Config(format!(
                "Unsupported storage backend: {}",
                other
            ))),
        }
    }

    /// Create a new local storage instance from a path
    pub fn from_path(path: &Path) -> Result<Self> {
        // Ensure base directory exists
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized local file storage");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Delete temporary files a crashed `store` left behind
    ///
    /// Only safe before anything else writes to this storage.
    pub async fn remove_temp_files(&self) -> Result<usize> {
        let mut dirs = vec![self.base_path.clone()];
        let mut removed = 0;

        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Storage(format!("Failed to list {}: {}", dir.display(), e)))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Storage(format!("Failed to list {}: {}", dir.display(), e)))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::Storage(format!("Failed to stat {}: {}", path.display(), e)))?;

                if file_type.is_dir() {
                    dirs.push(path);
                } else if path.to_string_lossy().ends_with(TEMP_EXT) {
                    fs::remove_file(&path).await.map_err(|e| {
                        Error::Storage(format!("Failed to remove {}: {}", path.display(), e))
                    })?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            warn!(removed, "Removed temporary files from an interrupted write");
        }

        Ok(removed)
    }

    /// Get full path for a relative path, with path traversal protection
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        if path.split(['/', '\\']).any(|component| component == "..") {
            return Err(Error::Storage(
                "Path traversal detected: '..' is not allowed".to_string(),
            ));
        }

        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::Storage("Absolute paths are not allowed".to_string()));
        }

        let full = self.base_path.join(path);

        let canonical_base = self
            .base_path
            .canonicalize()
            .map_err(|e| Error::Storage(format!("Failed to canonicalize base path: {}", e)))?;

        // New files are checked through their parent directory
        let canonical_full = if full.exists() {
            full.canonicalize()
                .map_err(|e| Error::Storage(format!("Failed to canonicalize path: {}", e)))?
        } else if let Some(parent) = full.parent().filter(|p| p.exists()) {
            let canonical_parent = parent.canonicalize().map_err(|e| {
                Error::Storage(format!("Failed to canonicalize parent path: {}", e))
            })?;
            match full.file_name() {
                Some(filename) => canonical_parent.join(filename),
                None => return Err(Error::Storage("Invalid file path".to_string())),
            }
        } else {
            full.clone()
        };

        if !canonical_full.starts_with(&canonical_base) {
            return Err(Error::Storage(
                "Path traversal detected: resolved path is outside storage directory".to_string(),
            ));
        }

        Ok(full)
    }

    /// Ensure parent directory exists
    async fn ensure_parent_exists(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.full_path(path)?;
        self.ensure_parent_exists(&full_path).await?;

        let mut tmp_name = full_path.clone().into_os_string();
        tmp_name.push(format!(".{}{}", Uuid::new_v4().simple(), TEMP_EXT));
        let tmp_path = PathBuf::from(tmp_name);

        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &full_path).await?;
            match full_path.parent() {
                Some(parent) => sync_dir(parent).await,
                None => Ok(()),
            }
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_error("store", path, e));
        }

        debug!(path = %path, size = data.len(), "Stored file");

        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;

        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| io_error("open", path, e))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| io_error("read", path, e))?;

        debug!(path = %path, size = data.len(), "Read file");

        Ok(data)
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        self.ensure_parent_exists(&full_path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .await
            .map_err(|e| io_error("open", path, e))?;

        file.write_all(data)
            .await
            .map_err(|e| io_error("append to", path, e))?;
        file.sync_data()
            .await
            .map_err(|e| io_error("sync", path, e))?;

        debug!(path = %path, size = data.len(), "Appended to file");

        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from)?;
        let to_path = self.full_path(to)?;
        self.ensure_parent_exists(&to_path).await?;

        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| io_error("rename", from, e))?;

        let mut parents = vec![to_path.parent(), from_path.parent()];
        parents.dedup();
        for parent in parents.into_iter().flatten() {
            sync_dir(parent)
                .await
                .map_err(|e| io_error("sync", to, e))?;
        }

        debug!(from = %from, to = %to, "Renamed file");

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;

        fs::remove_file(&full_path)
            .await
            .map_err(|e| io_error("delete", path, e))?;

        debug!(path = %path, "Deleted file");

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(fs::try_exists(&full_path).await.unwrap_or(false))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path)?;

        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error("stat", path, e))?;

        Ok(metadata.len())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(dir)?;

        let mut entries = match fs::read_dir(&full_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                if let Some(name) = entry.file_name().to_str().filter(|n| !n.ends_with(TEMP_EXT)) {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(temp_dir: &TempDir) -> LocalStorage {
        let config = StorageConfig {
            backend: "fs".to_string(),
            path: temp_dir.path().to_path_buf(),
        };
        LocalStorage::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let data = b"Hello, World!";
        let path = storage.store("test/message.eml", data).await.unwrap();
        assert_eq!(path, "test/message.eml");

        assert!(storage.exists("test/message.eml").await.unwrap());
        assert!(!storage.exists("nonexistent.eml").await.unwrap());

        let read_data = storage.read("test/message.eml").await.unwrap();
        assert_eq!(read_data, data);

        let size = storage.size("test/message.eml").await.unwrap();
        assert_eq!(size, data.len() as u64);

        storage.delete("test/message.eml").await.unwrap();
        assert!(!storage.exists("test/message.eml").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_leaves_no_temporary_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        storage.store("queue/in/a.pck", b"one").await.unwrap();
        storage.store("queue/in/a.pck", b"two").await.unwrap();

        assert_eq!(storage.list("queue/in").await.unwrap(), vec!["a.pck"]);
        assert_eq!(storage.read("queue/in/a.pck").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_interrupted_store_is_hidden_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        storage.store("queue/in/a.pck", b"one").await.unwrap();
        storage.append("lists/ant/digest.mmdf", b"x\n").await.unwrap();
        std::fs::write(temp_dir.path().join("queue/in/b.pck.0123abcd.tmp"), b"half").unwrap();
        std::fs::write(temp_dir.path().join("lists/ant/digest.mmdf.ids.4567.tmp"), b"").unwrap();

        assert_eq!(storage.list("queue/in").await.unwrap(), vec!["a.pck"]);

        assert_eq!(storage.remove_temp_files().await.unwrap(), 2);
        assert!(!temp_dir.path().join("queue/in/b.pck.0123abcd.tmp").exists());
        assert!(storage.exists("queue/in/a.pck").await.unwrap());
        assert!(storage.exists("lists/ant/digest.mmdf").await.unwrap());
        assert_eq!(storage.remove_temp_files().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_and_rename() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        storage.append("lists/ant/digest.mmdf", b"first\n").await.unwrap();
        storage.append("lists/ant/digest.mmdf", b"second\n").await.unwrap();
        assert_eq!(storage.size("lists/ant/digest.mmdf").await.unwrap(), 13);

        storage
            .rename("lists/ant/digest.mmdf", "lists/ant/digest.1.1.mmdf")
            .await
            .unwrap();
        assert!(!storage.exists("lists/ant/digest.mmdf").await.unwrap());
        assert_eq!(
            storage.read("lists/ant/digest.1.1.mmdf").await.unwrap(),
            b"first\nsecond\n"
        );

        // The source is gone, so a second rename reports not-found
        let err = storage
            .rename("lists/ant/digest.mmdf", "lists/ant/digest.1.2.mmdf")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        assert!(storage.list("queue/nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_traversal_prevention() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        assert!(storage.store("../../../etc/passwd", b"evil").await.is_err());
        assert!(storage.read("../../../etc/passwd").await.is_err());
        assert!(storage.delete("../../sensitive").await.is_err());
        assert!(storage.exists("../outside").await.is_err());
        assert!(storage.rename("safe.txt", "../moved").await.is_err());

        assert!(storage.store("/etc/passwd", b"evil").await.is_err());
        assert!(storage.read("/etc/shadow").await.is_err());

        assert!(storage.store("safe/path/file.eml", b"ok").await.is_ok());
    }
}
