//! # sluice-core - Shared building blocks for sluice sources
//!
//! Both sluice engines (the directory spooler and the change-data-capture
//! reconstructor) produce the same thing: batches of [`Record`]s handed to a
//! downstream consumer through a bounded queue, acknowledged one at a time,
//! with a durable cursor advanced on every acknowledgement.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐          ┌──────────────────┐
//! │ Directory Spooler│          │ CDC Reconstructor│
//! └────────┬─────────┘          └────────┬─────────┘
//!          │  Batch { records, errors }  │
//!          ▼                             ▼
//! ┌──────────────────────────────────────────────────┐
//! │    BatchSender ──(depth 1..2)──▶ BatchReceiver    │
//! └──────────────────────────────────────────────────┘
//!          │ poll_next_batch            ▲ acknowledge
//!          ▼                            │
//! ┌──────────────────────────────────────────────────┐
//! │                 downstream consumer               │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Acknowledging a batch hands its commit context back to the engine, which
//! persists the cursor through an [`OffsetStore`].

pub mod batch;
pub mod error;
pub mod offset;
pub mod pattern;
pub mod record;
pub mod source;

pub use batch::{channel, AckReport, Batch, BatchId, BatchReceiver, BatchSender, ErrorRecord};
pub use error::{CoreError, ErrorCategory, Result};
pub use offset::{FileOffsetStore, MemoryOffsetStore, Offset, OffsetStore};
pub use pattern::{MatchScope, PatternError, PatternMatcher, PatternSyntax};
pub use record::{Field, Header, Record, Value};
pub use source::BatchSource;
