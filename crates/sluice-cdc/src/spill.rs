//! On-disk buffering of open transactions
//!
//! With `buffer_locally: false` the pending changes of each open transaction
//! go to a JSON-lines file instead of memory. Rolling back to a savepoint
//! truncates the file. The file is removed when the transaction resolves or
//! the [`SpillFile`] is dropped.

use crate::error::Result;
use crate::transaction::PendingChange;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Creates spill files for one source instance.
#[derive(Debug, Clone)]
pub struct SpillStore {
    dir: PathBuf,
    instance: Uuid,
}

impl SpillStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            instance: Uuid::new_v4(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create(&self, txn_id: &str) -> Result<SpillFile> {
        let safe: String = txn_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{}-{}.jsonl", self.instance, safe));
        let file = File::create(&path)?;
        debug!("Spilling transaction {} to {}", txn_id, path.display());
        Ok(SpillFile {
            path,
            writer: BufWriter::new(file),
            line_starts: Vec::new(),
            written: 0,
        })
    }
}

/// Pending changes of one transaction on disk.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    writer: BufWriter<File>,
    line_starts: Vec<u64>,
    written: u64,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.line_starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_starts.is_empty()
    }

    pub fn push(&mut self, change: &PendingChange) -> Result<()> {
        let mut line = serde_json::to_vec(change)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.line_starts.push(self.written);
        self.written += line.len() as u64;
        Ok(())
    }

    /// Keep only the first `len` changes.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        let Some(&cut) = self.line_starts.get(len) else {
            return Ok(());
        };
        self.writer.flush()?;
        self.writer.get_ref().set_len(cut)?;
        self.writer.seek(SeekFrom::Start(cut))?;
        self.line_starts.truncate(len);
        self.written = cut;
        Ok(())
    }

    /// Read back every change in order.
    pub fn read_all(&mut self) -> Result<Vec<PendingChange>> {
        self.writer.flush()?;
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove spill file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnValue, Operation};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn change(id: i64) -> PendingChange {
        PendingChange {
            schema: "S".into(),
            table: "T".into(),
            operation: Operation::Insert,
            columns: vec![ColumnValue::new("ID", id)],
            position: id as u64,
        }
    }

    #[test]
    fn test_push_truncate_read() {
        let dir = TempDir::new().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let mut file = store.create("0a.1f:22").unwrap();
        for id in 1..=4 {
            file.push(&change(id)).unwrap();
        }
        file.truncate(2).unwrap();
        file.push(&change(9)).unwrap();

        let ids: Vec<u64> = file.read_all().unwrap().iter().map(|c| c.position).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert_eq!(file.len(), 3);
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = SpillStore::new(dir.path()).unwrap();
        let file = store.create("t1").unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
