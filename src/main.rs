//! # slack-sync CLI
//!
//! Runs one incremental update cycle: fetch new Slack messages for every
//! configured channel, chunk them, embed and upsert the chunks, and record
//! progress in the tracking files. Meant to be invoked by a scheduler.
//!
//! ## Usage
//!
//! ```bash
//! slack-sync --config ./config/slack-sync.toml update
//! slack-sync update --dry-run
//! slack-sync update --channel general --channel creative
//! slack-sync --log-format json update --strict
//! ```
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | tracking saved (individual channels may have been skipped) |
//! | 1 | configuration error or tracking could not be saved |
//! | 2 | `--strict` and at least one channel was skipped |

mod chunk;
mod config;
mod embedding;
mod error;
mod index;
mod models;
mod progress;
mod publish;
mod slack;
mod tracking;
mod traits;
mod update;
mod updater;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::progress::ProgressMode;
use crate::publish::IndexingSink;
use crate::slack::SlackSource;
use crate::tracking::TrackingStore;
use crate::traits::{ChunkSink, DiscardSink};
use crate::update::{UpdateContext, UpdateOptions};

/// Incremental Slack → vector index ingestion.
#[derive(Parser)]
#[command(
    name = "slack-sync",
    about = "Incremental, idempotent ingestion of Slack channel history into a vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/slack-sync.toml")]
    config: PathBuf,

    /// Diagnostic log format on stderr. Filter with `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one incremental update cycle.
    ///
    /// Loads tracking state once, updates each channel independently,
    /// publishes new chunks, and saves tracking state once at the end.
    /// A failing channel is skipped and keeps its previous cursor.
    Update {
        /// Fetch and chunk only. Nothing is embedded, upserted, or saved.
        #[arg(long)]
        dry_run: bool,

        /// Only update these channels (repeatable). Defaults to all configured channels.
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Exit with code 2 if any channel was skipped.
        #[arg(long)]
        strict: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Human => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Update {
            dry_run,
            channels,
            strict,
        } => run_update_command(&cfg, dry_run, channels, strict, cli.log_format).await,
    }
}

async fn run_update_command(
    cfg: &config::Config,
    dry_run: bool,
    channels: Vec<String>,
    strict: bool,
    log_format: LogFormat,
) -> anyhow::Result<ExitCode> {
    let mut opts = UpdateOptions::from_config(cfg);
    opts.dry_run = dry_run;
    let (selected, covers_all) = update::select_channels(&opts.channels, &channels)?;
    opts.channels = selected;
    opts.covers_all_channels = covers_all;

    let source = SlackSource::from_config(&cfg.slack)?;
    let sink: Box<dyn ChunkSink> = if dry_run {
        Box::new(DiscardSink)
    } else {
        Box::new(IndexingSink::from_config(cfg).context("cannot publish chunks")?)
    };
    let progress = match log_format {
        LogFormat::Json => ProgressMode::Json,
        LogFormat::Human => ProgressMode::default_for_tty(),
    }
    .reporter();
    let store = TrackingStore::new(&cfg.tracking);

    let ctx = UpdateContext {
        store: &store,
        source: &source,
        sink: sink.as_ref(),
        progress: progress.as_ref(),
    };

    let report = update::run_update(&ctx, &opts)
        .await
        .context("update failed: tracking state was not saved")?;
    update::print_summary(&report, dry_run);

    let failed = report.failed_channels();
    if !failed.is_empty() {
        tracing::warn!(channels = ?failed, "some channels were skipped this run");
        if strict {
            return Ok(ExitCode::from(2));
        }
    }
    Ok(ExitCode::SUCCESS)
}
