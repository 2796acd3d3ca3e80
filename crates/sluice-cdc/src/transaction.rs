//! Open transaction tracking
//!
//! [`TransactionArena`] keeps the pending row changes of every transaction
//! that has started but not yet ended, keyed by transaction id. Changes stay
//! pending until the COMMIT record arrives; a ROLLBACK discards them and a
//! ROLLBACK TO SAVEPOINT discards the changes made after the savepoint.
//!
//! Pending changes live in memory or, with spilling enabled, in one file per
//! transaction (see [`crate::spill`]).

use crate::error::Result;
use crate::event::{ColumnValue, LogRecord, Operation};
use crate::spill::{SpillFile, SpillStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

/// A row change waiting for its transaction to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub columns: Vec<ColumnValue>,
    /// Position of the DML record
    pub position: u64,
}

#[derive(Debug)]
enum PendingEvents {
    Memory(Vec<PendingChange>),
    Spilled(SpillFile),
}

impl PendingEvents {
    fn len(&self) -> usize {
        match self {
            Self::Memory(changes) => changes.len(),
            Self::Spilled(file) => file.len(),
        }
    }

    fn push(&mut self, change: PendingChange) -> Result<()> {
        match self {
            Self::Memory(changes) => changes.push(change),
            Self::Spilled(file) => file.push(&change)?,
        }
        Ok(())
    }

    fn truncate(&mut self, len: usize) -> Result<()> {
        match self {
            Self::Memory(changes) => changes.truncate(len),
            Self::Spilled(file) => file.truncate(len)?,
        }
        Ok(())
    }

    fn into_changes(self) -> Result<Vec<PendingChange>> {
        match self {
            Self::Memory(changes) => Ok(changes),
            Self::Spilled(mut file) => file.read_all(),
        }
    }
}

/// A transaction that has started and not yet ended.
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    /// Log timestamp of the first record
    pub started_at: DateTime<Utc>,
    /// Log position of the first record
    pub start_position: u64,
    events: PendingEvents,
    /// Savepoint name and the number of changes made before it
    savepoints: Vec<(String, usize)>,
}

impl Transaction {
    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn savepoint_names(&self) -> impl Iterator<Item = &str> {
        self.savepoints.iter().map(|(name, _)| name.as_str())
    }
}

/// A transaction that ended with its changes to be emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTransaction {
    pub id: String,
    pub start_position: u64,
    /// Position of the COMMIT, or of the record that forced resolution
    pub commit_position: u64,
    pub commit_timestamp: DateTime<Utc>,
    pub changes: Vec<PendingChange>,
    /// Resolved by an overflow FLUSH
    pub forced: bool,
}

/// Open transactions keyed by id.
#[derive(Debug, Default)]
pub struct TransactionArena {
    open: HashMap<String, Transaction>,
    spill: Option<SpillStore>,
}

impl TransactionArena {
    /// Arena keeping pending changes in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Arena spilling pending changes to files.
    pub fn spilling(store: SpillStore) -> Self {
        Self {
            open: HashMap::new(),
            spill: Some(store),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn get(&self, txn_id: &str) -> Option<&Transaction> {
        self.open.get(txn_id)
    }

    pub fn is_open(&self, txn_id: &str) -> bool {
        self.open.contains_key(txn_id)
    }

    fn begin(&mut self, record: &LogRecord) -> Result<&mut Transaction> {
        match self.open.entry(record.txn_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let events = match &self.spill {
                    Some(store) => PendingEvents::Spilled(store.create(&record.txn_id)?),
                    None => PendingEvents::Memory(Vec::new()),
                };
                debug!(
                    "Transaction {} started at position {}",
                    record.txn_id, record.position
                );
                Ok(entry.insert(Transaction {
                    id: record.txn_id.clone(),
                    started_at: record.timestamp,
                    start_position: record.position,
                    events,
                    savepoints: Vec::new(),
                }))
            }
        }
    }

    /// Buffer a row change; returns the transaction's pending count.
    pub fn record_change(&mut self, record: &LogRecord, change: PendingChange) -> Result<usize> {
        let txn = self.begin(record)?;
        txn.events.push(change)?;
        Ok(txn.len())
    }

    /// Mark a savepoint. Reusing a name moves the savepoint.
    pub fn savepoint(&mut self, record: &LogRecord, name: &str) -> Result<()> {
        let txn = self.begin(record)?;
        txn.savepoints.retain(|(existing, _)| existing != name);
        let len = txn.len();
        txn.savepoints.push((name.to_string(), len));
        Ok(())
    }

    /// Discard changes made after the savepoint; later savepoints go with them.
    ///
    /// Returns `false` when the transaction or savepoint is unknown.
    pub fn rollback_to(&mut self, txn_id: &str, name: &str) -> Result<bool> {
        let Some(txn) = self.open.get_mut(txn_id) else {
            return Ok(false);
        };
        let Some(index) = txn.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Ok(false);
        };
        let len = txn.savepoints[index].1;
        txn.events.truncate(len)?;
        txn.savepoints.truncate(index + 1);
        Ok(true)
    }

    /// Close a transaction on COMMIT. Unknown ids resolve to `None`.
    pub fn commit(&mut self, record: &LogRecord) -> Result<Option<ResolvedTransaction>> {
        self.resolve(&record.txn_id, record, false)
    }

    /// Close a transaction on ROLLBACK; returns the discarded change count.
    pub fn rollback(&mut self, txn_id: &str) -> Option<usize> {
        self.open.remove(txn_id).map(|txn| txn.len())
    }

    /// Close a transaction that overflowed. `flush` keeps its changes as if
    /// committed at `at`; otherwise they are dropped and `None` is returned.
    pub fn force_resolve(
        &mut self,
        txn_id: &str,
        at: &LogRecord,
        flush: bool,
    ) -> Result<Option<ResolvedTransaction>> {
        if flush {
            self.resolve(txn_id, at, true)
        } else {
            self.open.remove(txn_id);
            Ok(None)
        }
    }

    fn resolve(
        &mut self,
        txn_id: &str,
        at: &LogRecord,
        forced: bool,
    ) -> Result<Option<ResolvedTransaction>> {
        let Some(txn) = self.open.remove(txn_id) else {
            return Ok(None);
        };
        Ok(Some(ResolvedTransaction {
            id: txn.id,
            start_position: txn.start_position,
            commit_position: at.position,
            commit_timestamp: at.timestamp,
            changes: txn.events.into_changes()?,
            forced,
        }))
    }

    /// Start position of the oldest open transaction.
    pub fn oldest_start_position(&self) -> Option<u64> {
        self.open.values().map(|t| t.start_position).min()
    }

    /// True when a transaction that started before `position` is still open.
    pub fn has_open_before(&self, position: u64) -> bool {
        self.open.values().any(|t| t.start_position < position)
    }

    /// Ids of transactions open for longer than `max_age` at log time `now`,
    /// oldest first.
    pub fn expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Vec<String> {
        let mut expired: Vec<&Transaction> = self
            .open
            .values()
            .filter(|t| now - t.started_at > max_age)
            .collect();
        expired.sort_by_key(|t| t.start_position);
        expired.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Drop every open transaction.
    pub fn clear(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogOp;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn marker(position: u64, txn_id: &str, op: LogOp) -> LogRecord {
        LogRecord {
            position,
            timestamp: Utc::now(),
            txn_id: txn_id.into(),
            op,
        }
    }

    fn change(position: u64, name: &str) -> PendingChange {
        PendingChange {
            schema: "S".into(),
            table: "T".into(),
            operation: Operation::Insert,
            columns: vec![ColumnValue::new("NAME", name)],
            position,
        }
    }

    fn names(resolved: &ResolvedTransaction) -> Vec<String> {
        resolved
            .changes
            .iter()
            .map(|c| c.columns[0].value.as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn savepoint_scenario(arena: &mut TransactionArena) -> ResolvedTransaction {
        let dml = |p| marker(p, "t1", LogOp::Commit);
        arena.record_change(&dml(1), change(1, "a")).unwrap();
        arena.savepoint(&marker(2, "t1", LogOp::savepoint("sp1")), "sp1").unwrap();
        arena.record_change(&dml(3), change(3, "b")).unwrap();
        arena.savepoint(&marker(4, "t1", LogOp::savepoint("sp2")), "sp2").unwrap();
        arena.record_change(&dml(5), change(5, "c")).unwrap();
        assert!(arena.rollback_to("t1", "sp1").unwrap());
        assert!(!arena.rollback_to("t1", "sp2").unwrap());
        arena.record_change(&dml(7), change(7, "d")).unwrap();
        arena.commit(&marker(8, "t1", LogOp::Commit)).unwrap().unwrap()
    }

    #[test]
    fn test_rollback_to_savepoint_in_memory() {
        let mut arena = TransactionArena::in_memory();
        let resolved = savepoint_scenario(&mut arena);
        assert_eq!(names(&resolved), vec!["a", "d"]);
        assert_eq!(resolved.start_position, 1);
        assert_eq!(resolved.commit_position, 8);
        assert_eq!(arena.open_count(), 0);
    }

    #[test]
    fn test_rollback_to_savepoint_spilled() {
        let dir = TempDir::new().unwrap();
        let mut arena = TransactionArena::spilling(SpillStore::new(dir.path()).unwrap());
        let resolved = savepoint_scenario(&mut arena);
        assert_eq!(names(&resolved), vec!["a", "d"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rollback_discards() {
        let mut arena = TransactionArena::in_memory();
        arena
            .record_change(&marker(1, "t1", LogOp::Commit), change(1, "a"))
            .unwrap();
        assert_eq!(arena.rollback("t1"), Some(1));
        assert!(arena.commit(&marker(3, "t1", LogOp::Commit)).unwrap().is_none());
    }

    #[test]
    fn test_low_water_and_expiry() {
        let mut arena = TransactionArena::in_memory();
        let base = Utc::now();
        let mut old = marker(3, "old", LogOp::Commit);
        old.timestamp = base - chrono::Duration::seconds(120);
        arena.record_change(&old, change(3, "a")).unwrap();
        arena
            .record_change(&marker(5, "new", LogOp::Commit), change(5, "b"))
            .unwrap();

        assert_eq!(arena.oldest_start_position(), Some(3));
        assert!(arena.has_open_before(4));
        assert!(!arena.has_open_before(3));
        assert_eq!(
            arena.expired(base, chrono::Duration::seconds(60)),
            vec!["old".to_string()]
        );
    }

    #[test]
    fn test_force_resolve() {
        let mut arena = TransactionArena::in_memory();
        arena
            .record_change(&marker(1, "t1", LogOp::Commit), change(1, "a"))
            .unwrap();
        arena
            .record_change(&marker(2, "t2", LogOp::Commit), change(2, "b"))
            .unwrap();

        let at = marker(9, "t3", LogOp::Commit);
        let flushed = arena.force_resolve("t1", &at, true).unwrap().unwrap();
        assert!(flushed.forced);
        assert_eq!(flushed.commit_position, 9);
        assert!(arena.force_resolve("t2", &at, false).unwrap().is_none());
        assert_eq!(arena.open_count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Change(u8),
        Savepoint(u8),
        RollbackTo(u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => (0u8..100).prop_map(Step::Change),
            1 => (0u8..3).prop_map(Step::Savepoint),
            1 => (0u8..3).prop_map(Step::RollbackTo),
        ]
    }

    fn replay(arena: &mut TransactionArena, steps: &[Step]) -> Vec<String> {
        let dml = |p| marker(p, "t1", LogOp::Commit);
        arena.record_change(&dml(1), change(1, "first")).unwrap();
        for (i, step) in steps.iter().enumerate() {
            let position = i as u64 + 2;
            match step {
                Step::Change(v) => {
                    arena
                        .record_change(&dml(position), change(position, &v.to_string()))
                        .unwrap();
                }
                Step::Savepoint(n) => {
                    let name = format!("sp{n}");
                    arena
                        .savepoint(&marker(position, "t1", LogOp::savepoint(&name)), &name)
                        .unwrap();
                }
                Step::RollbackTo(n) => {
                    arena.rollback_to("t1", &format!("sp{n}")).unwrap();
                }
            }
        }
        let end = steps.len() as u64 + 2;
        names(&arena.commit(&marker(end, "t1", LogOp::Commit)).unwrap().unwrap())
    }

    fn model(steps: &[Step]) -> Vec<String> {
        let mut changes = vec!["first".to_string()];
        let mut savepoints: Vec<(u8, usize)> = Vec::new();
        for step in steps {
            match step {
                Step::Change(v) => changes.push(v.to_string()),
                Step::Savepoint(n) => {
                    savepoints.retain(|(existing, _)| existing != n);
                    savepoints.push((*n, changes.len()));
                }
                Step::RollbackTo(n) => {
                    if let Some(index) = savepoints.iter().rposition(|(s, _)| s == n) {
                        changes.truncate(savepoints[index].1);
                        savepoints.truncate(index + 1);
                    }
                }
            }
        }
        changes
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_savepoints_match_model(steps in proptest::collection::vec(step(), 0..40)) {
            let expected = model(&steps);

            let mut memory = TransactionArena::in_memory();
            prop_assert_eq!(replay(&mut memory, &steps), expected.clone());

            let dir = TempDir::new().unwrap();
            let mut spilled = TransactionArena::spilling(SpillStore::new(dir.path()).unwrap());
            prop_assert_eq!(replay(&mut spilled, &steps), expected);
        }
    }
}
