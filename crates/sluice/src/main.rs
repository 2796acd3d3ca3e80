//! sluice - drain a spool directory or a transaction log to stdout
//!
//! # Usage
//!
//! ```bash
//! sluice -c sluice.yaml
//! sluice -c sluice.yaml run --until-idle
//! sluice -c sluice.yaml validate
//! sluice schema spool --format yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sluice::{run_source, Engine, JsonLinesSink, RunSettings, RunSummary, SluiceConfig};
use sluice_cdc::{CdcConfig, CdcSource};
use sluice_spool::{DirectorySource, SpoolConfig};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Batch delivery from spool directories and transaction logs")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sluice.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured source (default)
    Run {
        /// Exit once the source has nothing more to deliver
        #[arg(long)]
        until_idle: bool,
    },
    /// Validate configuration file
    Validate,
    /// Show the config schema
    Schema {
        #[arg(value_enum)]
        section: SchemaSection,
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Delete the persisted position so the next run starts over
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemaSection {
    Spool,
    Cdc,
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Commands that don't need config
    if let Some(Commands::Schema { section, format }) = &cli.command {
        return show_schema(*section, format);
    }

    let config = SluiceConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run { until_idle: false }) {
        Commands::Run { until_idle } => run(config, until_idle).await,
        Commands::Validate => validate_config(&config),
        Commands::Reset => reset(&config).await,
        Commands::Schema { .. } => unreachable!(), // handled above
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the records
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(config: SluiceConfig, until_idle: bool) -> Result<()> {
    info!("Starting sluice '{}'", config.name);

    let mut settings = config.run.clone();
    settings.stop_when_idle |= until_idle;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            let _ = shutdown_tx.send(true);
        }
        // A dropped sender reads as shutdown.
        std::future::pending::<()>().await;
    });

    let mut sink = JsonLinesSink::stdout(config.sink.clone());
    let summary = match config.engine()? {
        Engine::Spool(spool) => {
            let mut source = spool_source(&config.name, spool);
            run_source(&mut source, &mut sink, &settings, shutdown_rx).await?
        }
        Engine::Cdc(cdc) => {
            let mut source = cdc_source(&config.name, cdc);
            run_source(&mut source, &mut sink, &settings, shutdown_rx).await?
        }
    };

    report(&summary, &settings);
    Ok(())
}

fn spool_source(name: &str, config: SpoolConfig) -> DirectorySource {
    DirectorySource::new(name, config)
}

fn cdc_source(name: &str, config: CdcConfig) -> CdcSource {
    CdcSource::new(name, config)
}

fn report(summary: &RunSummary, settings: &RunSettings) {
    info!(
        "Delivered {} records and {} errors in {} batches",
        summary.records, summary.errors, summary.batches
    );
    if summary.post_process_failures > 0 {
        warn!(
            "{} post-processing failures, see log above",
            summary.post_process_failures
        );
    }
    if let Some(limit) = settings.max_batches {
        if summary.batches >= limit {
            info!("Stopped at batch limit {}", limit);
        }
    }
}

fn validate_config(config: &SluiceConfig) -> Result<()> {
    println!("✓ Configuration is valid");
    println!("  Name: {}", config.name);
    match config.engine()? {
        Engine::Spool(spool) => {
            println!("  Source: spool");
            println!("  Directory: {}", spool.files_directory.display());
            println!("  Pattern: {}", spool.file_name_pattern);
            println!("  Format: {}", spool.data_format.name());
            println!("  Threads: {}", spool.number_of_threads);
        }
        Engine::Cdc(cdc) => {
            println!("  Source: cdc");
            println!("  Tables: {}", cdc.tables.len());
            println!("  Batch size: {}", cdc.max_batch_size_in_records);
        }
    }
    Ok(())
}

async fn reset(config: &SluiceConfig) -> Result<()> {
    match config.engine()? {
        Engine::Spool(spool) => {
            if spool.offset_directory.is_none() {
                warn!("No offset_directory configured; nothing is persisted");
            }
            spool_source(&config.name, spool).reset().await?;
        }
        Engine::Cdc(cdc) => {
            if cdc.offset_directory.is_none() {
                warn!("No offset_directory configured; nothing is persisted");
            }
            cdc_source(&config.name, cdc).reset().await?;
        }
    }
    println!("✓ Position of '{}' reset", config.name);
    Ok(())
}

fn show_schema(section: SchemaSection, format: &str) -> Result<()> {
    use schemars::schema_for;

    let schema = match section {
        SchemaSection::Spool => serde_json::to_value(schema_for!(SpoolConfig))?,
        SchemaSection::Cdc => serde_json::to_value(schema_for!(CdcConfig))?,
        SchemaSection::Config => serde_json::to_value(schema_for!(SluiceConfig))?,
    };

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }

    Ok(())
}
