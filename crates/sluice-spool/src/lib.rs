//! # sluice-spool - Directory spooling source
//!
//! Watches a directory tree, orders matching files, decodes them into records
//! and delivers the records in acknowledged batches. Fully consumed files are
//! left in place, archived or deleted once the batch that finished them is
//! acknowledged.
//!
//! ## Architecture
//!
//! ```text
//! files_directory/                       ┌──────────────┐
//!   a.csv  b.csv  sub/c.csv  ──scan────▶ │    Spool     │ pattern + read order
//!                                        └──────┬───────┘
//!                                               │ claim
//!                 ┌─────────────────────────────▼────────────────┐
//!  worker × N     │ BatchAssembler ─▶ FileCursor ─▶ Decoder enum │
//!                 └─────────────────────────────┬────────────────┘
//!                                               │ Batch + SpoolCommit
//!                                        ┌──────▼───────┐
//!                                        │ BatchReceiver│ ◀── poll / acknowledge
//!                                        └──────┬───────┘
//!                                               │ on acknowledge
//!                                 offset store + PostProcessor (archive/delete)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), sluice_spool::SpoolError> {
//! use sluice_core::BatchSource;
//! use sluice_spool::{DirectorySource, SpoolConfig};
//! use std::time::Duration;
//!
//! let config = SpoolConfig::new("/var/spool/incoming");
//! let mut source = DirectorySource::new("incoming", config);
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

pub mod assembler;
pub mod charset;
pub mod config;
pub mod cursor;
pub mod error;
pub mod format;
pub mod post_process;
pub mod scanner;
pub mod source;
pub mod spool;

pub use assembler::{
    Assembled, BatchAssembler, CompletedFile, FileOutcome, FileProgress, SpoolCommit,
};
pub use cursor::{CursorItem, FileCursor};
pub use config::{
    DataFormat, DelimitedConfig, DelimitedFormatType, FieldPathToGroup, HeaderLine, JsonConfig,
    JsonContent, LogConfig, LogFormat, PostProcessing, ReadOrder, SpoolConfig, TextConfig,
    XmlConfig,
};
pub use error::{Result, SpoolError};
pub use post_process::{ArchiveReaper, Disposition, PostProcessor};
pub use scanner::{DirectoryScanner, SpoolEntry};
pub use source::{DirectorySource, SpoolStats};
pub use spool::{Spool, SpoolPosition};
