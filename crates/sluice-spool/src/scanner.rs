//! Directory scanning
//!
//! A scan lists the files under the watched root whose *file name* matches the
//! configured pattern. Hidden entries (leading `.`) and the archive / error
//! directories are never listed, so a spool can archive into a subdirectory
//! of its own root without re-reading what it archived.

use crate::config::SpoolConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use sluice_core::PatternMatcher;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file eligible for spooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the root, `/`-separated
    pub relative: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl SpoolEntry {
    /// Build an entry from a path under `root`.
    pub fn from_path(root: &Path, path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Self {
            path: path.to_path_buf(),
            relative,
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }

    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }
}

/// Lists matching files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    root: PathBuf,
    matcher: PatternMatcher,
    recursive: bool,
    excluded: Vec<PathBuf>,
}

impl DirectoryScanner {
    pub fn new(root: impl Into<PathBuf>, matcher: PatternMatcher, recursive: bool) -> Self {
        Self {
            root: root.into(),
            matcher,
            recursive,
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &SpoolConfig) -> Result<Self> {
        let mut scanner = Self::new(
            &config.files_directory,
            config.matcher()?,
            config.process_subdirectories,
        );
        scanner.excluded = [&config.archive_directory, &config.error_directory]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        Ok(scanner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_exists(&self) -> bool {
        self.root.is_dir()
    }

    /// List matching files in no particular order.
    ///
    /// Fails only when the root itself cannot be listed; unreadable
    /// subdirectories and files that vanish during the scan are skipped.
    pub fn scan(&self) -> io::Result<Vec<SpoolEntry>> {
        let mut entries = Vec::new();
        let mut dirs = vec![self.root.clone()];
        let mut is_root = true;

        while let Some(dir) = dirs.pop() {
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if is_root => return Err(e),
                Err(e) => {
                    warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            is_root = false;

            for item in listing.filter_map(|item| item.ok()) {
                let path = item.path();
                let name = item.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                let Ok(file_type) = item.file_type() else {
                    continue;
                };

                if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
                    if self.recursive && !self.is_excluded(&path) {
                        dirs.push(path);
                    }
                    continue;
                }
                if !self.matcher.matches(&name) {
                    continue;
                }
                match SpoolEntry::from_path(&self.root, &path) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => debug!("File {} vanished during scan: {}", path.display(), e),
                }
            }
        }
        Ok(entries)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|excluded| excluded.as_path() == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn names(entries: &[SpoolEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries.iter().map(|e| e.relative.clone()).collect();
        names.sort();
        names
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.csv"), "b").unwrap();
        fs::write(dir.path().join(".hidden.txt"), "h").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), "c").unwrap();
        fs::write(dir.path().join("sub/deeper/d.txt"), "d").unwrap();
        fs::create_dir_all(dir.path().join("archive")).unwrap();
        fs::write(dir.path().join("archive/old.txt"), "old").unwrap();
        dir
    }

    #[test]
    fn test_flat_scan_matches_file_names() {
        let dir = setup();
        let scanner = DirectoryScanner::new(dir.path(), PatternMatcher::new("*.txt").unwrap(), false);
        assert_eq!(names(&scanner.scan().unwrap()), vec!["a.txt"]);
    }

    #[test]
    fn test_recursive_scan_skips_excluded() {
        let dir = setup();
        let mut scanner =
            DirectoryScanner::new(dir.path(), PatternMatcher::new("*.txt").unwrap(), true);
        scanner.excluded = vec![dir.path().join("archive")];
        assert_eq!(
            names(&scanner.scan().unwrap()),
            vec!["a.txt", "sub/c.txt", "sub/deeper/d.txt"]
        );
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = TempDir::new().unwrap();
        let scanner = DirectoryScanner::new(
            dir.path().join("missing"),
            PatternMatcher::new("*").unwrap(),
            false,
        );
        assert!(!scanner.root_exists());
        assert_eq!(scanner.scan().unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_entry_metadata() {
        let dir = setup();
        let entry = SpoolEntry::from_path(dir.path(), &dir.path().join("sub/c.txt")).unwrap();
        assert_eq!(entry.relative, "sub/c.txt");
        assert_eq!(entry.file_name(), "c.txt");
        assert_eq!(entry.size, 1);
    }
}
