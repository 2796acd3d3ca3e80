//! Spool state: which files are pending, being read, and consumed.
//!
//! [`Spool`] is shared by all reader workers behind a mutex. Only the
//! acknowledged part of it, [`SpoolPosition`], is persisted.

use crate::assembler::SpoolCommit;
use crate::config::ReadOrder;
use crate::scanner::SpoolEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Durable cursor of a directory source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolPosition {
    /// Fully consumed files still present in the directory
    #[serde(default)]
    pub consumed: BTreeSet<String>,
    /// Restart offsets of partially consumed files
    #[serde(default)]
    pub offsets: BTreeMap<String, u64>,
    /// Greatest relative path handed out under LEXICOGRAPHICAL order
    #[serde(default)]
    pub last_claimed: Option<String>,
}

impl SpoolPosition {
    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty() && self.offsets.is_empty() && self.last_claimed.is_none()
    }
}

#[derive(Debug)]
pub struct Spool {
    order: ReadOrder,
    position: SpoolPosition,
    pending: VecDeque<SpoolEntry>,
    queued: HashSet<String>,
    /// Claimed by a worker and not yet acknowledged as complete
    active: HashSet<String>,
    watermark: Option<String>,
    last_scan: Option<Instant>,
}

impl Spool {
    pub fn new(order: ReadOrder, position: SpoolPosition) -> Self {
        let watermark = position.last_claimed.clone();
        Self {
            order,
            position,
            pending: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            watermark,
            last_scan: None,
        }
    }

    pub fn position(&self) -> &SpoolPosition {
        &self.position
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// A rescan is due when nothing is pending and `period` has elapsed.
    pub fn scan_due(&self, period: Duration) -> bool {
        self.pending.is_empty() && self.last_scan.map_or(true, |at| at.elapsed() >= period)
    }

    /// Queue newly scanned files in read order. Returns how many were added.
    pub fn refill(&mut self, mut entries: Vec<SpoolEntry>) -> usize {
        self.last_scan = Some(Instant::now());
        match self.order {
            ReadOrder::Lexicographical => entries.sort_by(|a, b| a.relative.cmp(&b.relative)),
            ReadOrder::Timestamp => entries.sort_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| a.relative.cmp(&b.relative))
            }),
        }

        let mut added = 0;
        for entry in entries {
            let name = entry.relative.as_str();
            if self.position.consumed.contains(name)
                || self.active.contains(name)
                || self.queued.contains(name)
            {
                continue;
            }
            if self.order == ReadOrder::Lexicographical
                && !self.position.offsets.contains_key(name)
                && self.watermark.as_deref().is_some_and(|mark| name <= mark)
            {
                debug!("Skipping {}: sorts before already spooled {:?}", name, self.watermark);
                continue;
            }
            self.queued.insert(entry.relative.clone());
            self.pending.push_back(entry);
            added += 1;
        }
        added
    }

    /// Hand the next file to a worker, with the offset to resume from.
    pub fn claim(&mut self) -> Option<(SpoolEntry, u64)> {
        let entry = self.pending.pop_front()?;
        self.queued.remove(&entry.relative);
        self.active.insert(entry.relative.clone());
        if self.order == ReadOrder::Lexicographical
            && self.watermark.as_deref().map_or(true, |mark| entry.relative.as_str() > mark)
        {
            self.watermark = Some(entry.relative.clone());
        }
        let offset = self.position.offsets.get(&entry.relative).copied().unwrap_or(0);
        Some((entry, offset))
    }

    /// Give back a file whose reading was abandoned without a commit.
    pub fn release(&mut self, relative: &str) {
        self.active.remove(relative);
    }

    /// Apply an acknowledged batch to the durable position.
    pub fn commit(&mut self, commit: &SpoolCommit) {
        for progress in &commit.progress {
            self.position
                .offsets
                .insert(progress.relative.clone(), progress.offset);
            self.advance_mark(&progress.relative);
        }
        for file in &commit.completed {
            let name = &file.entry.relative;
            self.position.offsets.remove(name);
            self.active.remove(name);
            self.position.consumed.insert(name.clone());
            self.advance_mark(name);
        }
    }

    /// Drop a file that no longer exists in the directory.
    pub fn forget(&mut self, relative: &str) {
        self.position.consumed.remove(relative);
        self.position.offsets.remove(relative);
    }

    /// Start over: everything still in the directory becomes eligible again.
    pub fn reset(&mut self) {
        self.position = SpoolPosition::default();
        self.pending.clear();
        self.queued.clear();
        self.watermark = None;
        self.last_scan = None;
    }

    fn advance_mark(&mut self, name: &str) {
        if self.order != ReadOrder::Lexicographical {
            return;
        }
        if self
            .position
            .last_claimed
            .as_deref()
            .map_or(true, |mark| name > mark)
        {
            self.position.last_claimed = Some(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{CompletedFile, FileOutcome, FileProgress};
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn entry(name: &str, age_secs: i64) -> SpoolEntry {
        SpoolEntry {
            path: PathBuf::from("/in").join(name),
            relative: name.to_string(),
            size: 1,
            modified: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    fn claim_all(spool: &mut Spool) -> Vec<String> {
        std::iter::from_fn(|| spool.claim().map(|(e, _)| e.relative)).collect()
    }

    fn completed(name: &str) -> SpoolCommit {
        SpoolCommit {
            records: 1,
            progress: Vec::new(),
            completed: vec![CompletedFile {
                entry: entry(name, 0),
                outcome: FileOutcome::Consumed,
            }],
        }
    }

    #[test]
    fn test_lexicographical_order() {
        let mut spool = Spool::new(ReadOrder::Lexicographical, SpoolPosition::default());
        spool.refill(vec![entry("b", 0), entry("c", 9), entry("a", 5)]);
        assert_eq!(claim_all(&mut spool), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_timestamp_order_with_name_tiebreak() {
        let mut spool = Spool::new(ReadOrder::Timestamp, SpoolPosition::default());
        let stamp = Utc::now() - ChronoDuration::seconds(30);
        let z = SpoolEntry {
            modified: stamp,
            ..entry("z", 0)
        };
        let y = SpoolEntry {
            modified: stamp,
            ..entry("y", 0)
        };
        spool.refill(vec![entry("a", 0), z, entry("m", 60), y]);
        assert_eq!(claim_all(&mut spool), vec!["m", "y", "z", "a"]);
    }

    #[test]
    fn test_lexicographical_watermark_skips_late_earlier_names() {
        let mut spool = Spool::new(ReadOrder::Lexicographical, SpoolPosition::default());
        spool.refill(vec![entry("file-2", 0)]);
        claim_all(&mut spool);
        assert_eq!(spool.refill(vec![entry("file-1", 0), entry("file-3", 0)]), 1);
        assert_eq!(claim_all(&mut spool), vec!["file-3"]);
    }

    #[test]
    fn test_timestamp_order_picks_up_late_files() {
        let mut spool = Spool::new(ReadOrder::Timestamp, SpoolPosition::default());
        spool.refill(vec![entry("file-2", 0)]);
        claim_all(&mut spool);
        assert_eq!(spool.refill(vec![entry("file-1", 10), entry("file-2", 0)]), 1);
    }

    #[test]
    fn test_commit_marks_consumed_and_skips_on_rescan() {
        let mut spool = Spool::new(ReadOrder::Timestamp, SpoolPosition::default());
        spool.refill(vec![entry("a", 0)]);
        claim_all(&mut spool);
        spool.commit(&completed("a"));
        assert!(spool.position().consumed.contains("a"));
        assert_eq!(spool.active_len(), 0);
        assert_eq!(spool.refill(vec![entry("a", 0)]), 0);

        spool.forget("a");
        assert_eq!(spool.refill(vec![entry("a", 0)]), 1);
    }

    #[test]
    fn test_partial_progress_resumes_at_offset() {
        let mut spool = Spool::new(ReadOrder::Lexicographical, SpoolPosition::default());
        spool.refill(vec![entry("a", 0)]);
        claim_all(&mut spool);
        spool.commit(&SpoolCommit {
            records: 2,
            progress: vec![FileProgress {
                relative: "a".into(),
                offset: 42,
            }],
            completed: Vec::new(),
        });

        let mut restarted = Spool::new(ReadOrder::Lexicographical, spool.position().clone());
        assert_eq!(restarted.refill(vec![entry("a", 0)]), 1);
        let (claimed, offset) = restarted.claim().unwrap();
        assert_eq!((claimed.relative.as_str(), offset), ("a", 42));
    }

    #[test]
    fn test_reset_makes_files_eligible_again() {
        let mut spool = Spool::new(ReadOrder::Lexicographical, SpoolPosition::default());
        spool.refill(vec![entry("a", 0)]);
        claim_all(&mut spool);
        spool.commit(&completed("a"));
        spool.reset();
        assert!(spool.position().is_empty());
        assert_eq!(spool.refill(vec![entry("a", 0)]), 1);
    }

    #[test]
    fn test_scan_due() {
        let mut spool = Spool::new(ReadOrder::Lexicographical, SpoolPosition::default());
        assert!(spool.scan_due(Duration::from_secs(60)));
        spool.refill(Vec::new());
        assert!(!spool.scan_due(Duration::from_secs(60)));
        assert!(spool.scan_due(Duration::ZERO));
    }
}
