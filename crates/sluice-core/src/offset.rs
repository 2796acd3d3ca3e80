//! # Offset storage
//!
//! Durable cursor tracking for resumable sources.
//!
//! A source saves an [`Offset`] each time the consumer acknowledges a batch
//! and loads it again on start. The position itself is opaque JSON owned by
//! the source (consumed file set for the spooler, restart position for CDC).
//!
//! [`FileOffsetStore`] writes one JSON file per key with a temp-file + fsync +
//! rename sequence, so a crash leaves either the previous or the new offset
//! on disk, never a torn one.
//!
//! ```ignore
//! let store = FileOffsetStore::new("/var/lib/sluice/offsets").await?;
//! store.save(&Offset::new("spool-orders", &position)?).await?;
//! let restored = store.load("spool-orders").await?;
//! ```

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A persisted source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    /// Source key (file name of the offset file)
    pub key: String,
    /// Source-defined position
    pub position: serde_json::Value,
    /// When the offset was written
    pub updated_at: DateTime<Utc>,
    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Offset {
    /// Create an offset from any serializable position.
    pub fn new<P: Serialize>(key: impl Into<String>, position: &P) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            position: serde_json::to_value(position)?,
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        })
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Decode the position back into the source's type.
    pub fn position_as<P: DeserializeOwned>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.position.clone())?)
    }
}

/// Storage backend for offsets.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn save(&self, offset: &Offset) -> Result<()>;

    async fn load(&self, key: &str) -> Result<Option<Offset>>;

    /// Remove the offset for `key`; missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(CoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Offsets as JSON files in a directory.
pub struct FileOffsetStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Offset>>,
    fsync: bool,
}

impl FileOffsetStore {
    /// Create the store, creating `base_dir` if needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create the store with explicit fsync behaviour.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn save(&self, offset: &Offset) -> Result<()> {
        validate_key(&offset.key)?;

        let file_path = self.file_path(&offset.key);
        let temp_path = file_path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(offset)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path).await?;

        self.cache
            .write()
            .await
            .insert(offset.key.clone(), offset.clone());

        debug!("Saved offset for {}", offset.key);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Offset>> {
        validate_key(key)?;

        if let Some(offset) = self.cache.read().await.get(key) {
            return Ok(Some(offset.clone()));
        }

        let contents = match fs::read(self.file_path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let offset: Offset = serde_json::from_slice(&contents)?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), offset.clone());
        Ok(Some(offset))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(key);

        info!("Deleted offset for {}", key);
        Ok(())
    }
}

/// In-memory offsets, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: RwLock<HashMap<String, Offset>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn save(&self, offset: &Offset) -> Result<()> {
        validate_key(&offset.key)?;
        self.offsets
            .write()
            .await
            .insert(offset.key.clone(), offset.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Offset>> {
        Ok(self.offsets.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.offsets.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Position {
        file: String,
        offset: u64,
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileOffsetStore::new(dir.path()).await.unwrap();

        let position = Position {
            file: "a.txt".into(),
            offset: 42,
        };
        store
            .save(&Offset::new("spool", &position).unwrap())
            .await
            .unwrap();

        // Fresh store reads from disk, not the cache
        let reopened = FileOffsetStore::new(dir.path()).await.unwrap();
        let loaded = reopened.load("spool").await.unwrap().unwrap();
        assert_eq!(loaded.position_as::<Position>().unwrap(), position);
        assert!(!dir.path().join("spool.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileOffsetStore::with_options(dir.path(), false)
            .await
            .unwrap();
        assert!(store.load("nothing").await.unwrap().is_none());

        store
            .save(&Offset::new("cdc", &7u64).unwrap())
            .await
            .unwrap();
        store.delete("cdc").await.unwrap();
        store.delete("cdc").await.unwrap();
        assert!(store.load("cdc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let store = MemoryOffsetStore::new();
        for key in ["", "a/b", "..", "a\\b"] {
            let offset = Offset::new(key, &1u64).unwrap();
            assert!(matches!(
                store.save(&offset).await,
                Err(CoreError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryOffsetStore::new();
        let offset = Offset::new("k", &vec![1, 2, 3])
            .unwrap()
            .with_metadata("engine", "spool");
        store.save(&offset).await.unwrap();
        let loaded = store.load("k").await.unwrap().unwrap();
        assert_eq!(loaded.position_as::<Vec<i32>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(loaded.metadata.get("engine").map(String::as_str), Some("spool"));
    }
}
