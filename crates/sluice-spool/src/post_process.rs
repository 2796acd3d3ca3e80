//! Post-processing of consumed files
//!
//! - **NONE** leaves files in place (the spool remembers them as consumed).
//! - **ARCHIVE** moves files under the archive directory, keeping the path
//!   relative to the watched root. The moved file's modification time is set
//!   to the archive time so that retention counts from archiving.
//! - **DELETE** removes files.
//!
//! Files abandoned after a file-level decode failure are moved to the error
//! directory when one is configured, whatever the post-processing mode.
//!
//! [`ArchiveReaper`] purges archived files once they are older than the
//! configured retention.

use crate::assembler::{CompletedFile, FileOutcome};
use crate::config::{PostProcessing, SpoolConfig};
use crate::error::{Result, SpoolError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a completed file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Left in place
    Retained,
    Archived(PathBuf),
    Deleted,
    /// Moved to the error directory
    Quarantined(PathBuf),
}

impl Disposition {
    /// True when the file is no longer in the watched directory.
    pub fn removed(&self) -> bool {
        !matches!(self, Self::Retained)
    }
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    mode: PostProcessing,
    archive_directory: Option<PathBuf>,
    error_directory: Option<PathBuf>,
}

impl PostProcessor {
    pub fn new(config: &SpoolConfig) -> Self {
        Self {
            mode: config.file_post_processing,
            archive_directory: config.archive_directory.clone(),
            error_directory: config.error_directory.clone(),
        }
    }

    /// Create the destination directories.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.archive_directory, &self.error_directory].into_iter().flatten() {
            fs::create_dir_all(dir).map_err(|e| {
                SpoolError::config(format!("cannot create directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Apply the disposition for one completed file.
    pub fn finish(&self, file: &CompletedFile) -> Result<Disposition> {
        let entry = &file.entry;
        let fail = |e: io::Error| SpoolError::post_process(entry.path.display().to_string(), e.to_string());

        match (&file.outcome, &self.error_directory) {
            (FileOutcome::Failed { .. }, Some(dir)) => {
                let dest = move_under(&entry.path, dir, &entry.relative).map_err(fail)?;
                info!("Moved failed file {} to {}", entry.relative, dest.display());
                return Ok(Disposition::Quarantined(dest));
            }
            (FileOutcome::Failed { .. }, None) => return Ok(Disposition::Retained),
            (FileOutcome::Consumed, _) => {}
        }

        match (self.mode, &self.archive_directory) {
            (PostProcessing::None, _) => Ok(Disposition::Retained),
            (PostProcessing::Delete, _) => {
                fs::remove_file(&entry.path).map_err(fail)?;
                debug!("Deleted {}", entry.relative);
                Ok(Disposition::Deleted)
            }
            (PostProcessing::Archive, Some(dir)) => {
                let dest = move_under(&entry.path, dir, &entry.relative).map_err(fail)?;
                debug!("Archived {} to {}", entry.relative, dest.display());
                Ok(Disposition::Archived(dest))
            }
            (PostProcessing::Archive, None) => Err(SpoolError::post_process(
                entry.path.display().to_string(),
                "archive_directory is not set",
            )),
        }
    }
}

/// Move `src` to `root/relative`, creating parents, and stamp it with the current time.
fn move_under(src: &Path, root: &Path, relative: &str) -> io::Result<PathBuf> {
    let dest = relative.split('/').fold(root.to_path_buf(), |path, part| path.join(part));
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::rename(src, &dest) {
        // Cross-device moves cannot be renamed.
        debug!("Rename of {} failed ({}), copying", src.display(), e);
        fs::copy(src, &dest)?;
        fs::remove_file(src)?;
    }
    // The owner may set times through a read-only handle.
    if let Err(e) = fs::File::open(&dest).and_then(|f| f.set_modified(SystemTime::now())) {
        warn!(
            "Moved {} but could not stamp its archive time: {}",
            dest.display(),
            e
        );
    }
    Ok(dest)
}

/// Background purge of expired archived files.
#[derive(Debug, Clone)]
pub struct ArchiveReaper {
    directory: PathBuf,
    retention: Duration,
    interval: Duration,
}

impl ArchiveReaper {
    pub fn new(directory: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            directory: directory.into(),
            retention,
            interval: retention.clamp(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Remove archived files older than the retention. Returns how many were removed.
    pub fn purge_once(&self) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut dirs = vec![self.directory.clone()];

        while let Some(dir) = dirs.pop() {
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for item in listing.filter_map(|item| item.ok()) {
                let path = item.path();
                let Ok(metadata) = item.metadata() else {
                    continue;
                };
                if metadata.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age >= self.retention {
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!("Failed to purge {}: {}", path.display(), e),
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Run until `shutdown` turns true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Archive reaper started for {} (retention {:?})",
                self.directory.display(),
                self.retention
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                let reaper = self.clone();
                match tokio::task::spawn_blocking(move || reaper.purge_once()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!("Purged {} archived files", n),
                    Ok(Err(e)) => warn!("Archive purge failed: {}", e),
                    Err(e) => warn!("Archive purge task failed: {}", e),
                }
            }
            debug!("Archive reaper stopped");
        })
    }
}
