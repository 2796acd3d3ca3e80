//! # sluice-cdc - Change-data-capture source
//!
//! Tails a database transaction log and emits one record per committed row
//! change, in commit order. Work that is rolled back, entirely or to a
//! savepoint, is never emitted.
//!
//! ## Architecture
//!
//! ```text
//! TransactionLog ──LogCursor──▶ Reconstructor ──Emitted──▶ Reader task ──Batch──▶ consumer
//!  (segments)                    │ TransactionArena                        ▲
//!                                │  open txns, savepoints                  │ acknowledge
//!                                │  memory or spill files                  │
//!                                └─ overflow: DISCARD | FLUSH      CdcPosition ─▶ OffsetStore
//! ```
//!
//! ## Emitted records
//!
//! The record root is a map of the columns present in the row image. Each
//! record carries `sdc.operation.type` (`1` insert, `2` delete, `3` update),
//! `cdc.operation`, `cdc.schema`, `cdc.table`, `cdc.txn.id`,
//! `cdc.commit.timestamp` and `cdc.position`. Events flushed by an overflow
//! also carry `cdc.forced: true`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), sluice_cdc::CdcError> {
//! use sluice_cdc::{CdcConfig, CdcSource, LogSourceConfig, TableSelector};
//! use sluice_core::BatchSource;
//! use std::time::Duration;
//!
//! let config = CdcConfig::new(
//!     vec![TableSelector::new("SALES", "%")],
//!     LogSourceConfig::Directory { path: "/var/lib/redo".into() },
//! );
//! let mut source = CdcSource::new("sales", config);
//! source.start().await?;
//! while let Some(batch) = source.poll_next_batch(Duration::from_secs(5)).await? {
//!     for record in &batch.records {
//!         println!("{record}");
//!     }
//!     source.acknowledge(batch.id).await?;
//! }
//! source.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod log;
pub mod reconstructor;
pub mod source;
pub mod spill;
pub mod transaction;

pub use config::{
    parse_start_date, CdcConfig, LogSourceConfig, OverflowPolicy, StartPosition, TableSelector,
};
pub use error::{CdcError, Result};
pub use event::{
    ChangeEvent, ColumnValue, DmlChange, EventKey, LogOp, LogRecord, Operation,
    HEADER_COMMIT_TIMESTAMP, HEADER_FORCED, HEADER_OPERATION, HEADER_POSITION, HEADER_SCHEMA,
    HEADER_SDC_OPERATION, HEADER_TABLE, HEADER_TXN_ID,
};
pub use filter::TableFilter;
pub use log::{DirectoryLog, LogCursor, LogStart, MemoryLog, TransactionLog};
pub use reconstructor::{
    CdcPosition, CdcStats, DiscardedTxn, Emitted, Reconstructor, ReconstructorOptions,
    ResolvedTxn,
};
pub use source::{CdcCommit, CdcSource};
pub use spill::{SpillFile, SpillStore};
pub use transaction::{PendingChange, ResolvedTransaction, Transaction, TransactionArena};
