//! sluice - runner for the spool and CDC sources
//!
//! Loads one configuration file, builds the configured source and drains it
//! into a JSON-lines sink, acknowledging each batch once it was written.
//!
//! ```text
//! ┌──────────────────────┐     ┌──────────┐     ┌──────────────┐
//! │ DirectorySource  or  │────▶│  runner  │────▶│ JSON lines   │
//! │ CdcSource            │◀────│  (ack)   │     │ (stdout)     │
//! └──────────────────────┘     └──────────┘     └──────────────┘
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Run until Ctrl+C
//! sluice -c sluice.yaml
//!
//! # Drain what is there and exit
//! sluice -c sluice.yaml run --until-idle
//!
//! # Validate configuration
//! sluice -c sluice.yaml validate
//!
//! # Forget the persisted position
//! sluice -c sluice.yaml reset
//! ```

pub mod config;
pub mod runner;
pub mod sink;

pub use config::{Engine, RunSettings, SluiceConfig};
pub use runner::{run_source, RunSummary};
pub use sink::{JsonLinesSink, OutputFormat, SinkConfig};
