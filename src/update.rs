//! Update run orchestration.
//!
//! One run is a single load → per-channel update → single save cycle:
//!
//! ```text
//!  load() ──▶ channel A ─┐
//!             channel B ─┼──▶ merge successes (sorted by name) ──▶ save()
//!             channel C ─┘
//! ```
//!
//! Every channel reads the same snapshot loaded at the start. A channel
//! that fails (fetch, chunk, publish, or timeout) contributes nothing to
//! the merge, so its cursor stays exactly as loaded while the others
//! advance. The legacy global timestamp is only written when every
//! configured channel succeeded.

use anyhow::bail;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::{ChunkingConfig, Config};
use crate::error::{ChannelUpdateError, PersistenceError};
use crate::models::UserDirectory;
use crate::progress::{format_number, UpdateProgressEvent, UpdateProgressReporter};
use crate::tracking::{ChannelCursor, CursorMap, TrackingState, TrackingStore};
use crate::traits::{ChunkSink, MessageSource};
use crate::updater::{update_channel, ChannelUpdate, UpdateInputs};

const SECS_PER_DAY: f64 = 86_400.0;

/// Options for one update run.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Channels to process, by name.
    pub channels: Vec<String>,
    pub chunking: ChunkingConfig,
    pub max_concurrent: usize,
    /// Deadline for one channel's fetch, chunk, and publish.
    pub channel_timeout: Duration,
    pub initial_lookback_days: Option<u32>,
    /// Fetch and chunk only; publish nothing and persist nothing.
    pub dry_run: bool,
    /// Whether this run covers every configured channel. The legacy
    /// timestamp is never written for a partial selection.
    pub covers_all_channels: bool,
}

impl UpdateOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channels: config.channels.normalized_names(),
            chunking: config.chunking.clone(),
            max_concurrent: config.channels.max_concurrent,
            channel_timeout: Duration::from_secs(config.channels.timeout_secs),
            initial_lookback_days: config.channels.initial_lookback_days,
            dry_run: false,
            covers_all_channels: true,
        }
    }
}

/// Restrict a run to the `requested` channels.
///
/// An empty request selects every configured channel. Names match with or
/// without a leading `#` and a repeated name counts once. Returns the
/// selection in configured order and whether it covers every configured
/// channel.
pub fn select_channels(
    configured: &[String],
    requested: &[String],
) -> anyhow::Result<(Vec<String>, bool)> {
    if requested.is_empty() {
        return Ok((configured.to_vec(), true));
    }

    let wanted: BTreeSet<String> = requested
        .iter()
        .map(|c| c.trim().trim_start_matches('#').to_string())
        .collect();
    if let Some(unknown) = wanted.iter().find(|c| !configured.contains(*c)) {
        bail!("channel '{}' is not listed in channels.names", unknown);
    }

    let selected: Vec<String> = configured
        .iter()
        .filter(|c| wanted.contains(c.as_str()))
        .cloned()
        .collect();
    let all: BTreeSet<&str> = configured.iter().map(String::as_str).collect();
    let covers_all = wanted.iter().map(String::as_str).collect::<BTreeSet<_>>() == all;
    Ok((selected, covers_all))
}

/// What happened to one channel.
#[derive(Debug, Clone)]
pub enum ChannelOutcome {
    Updated {
        messages: usize,
        duplicates: usize,
        chunks: usize,
        published: usize,
        cursor: Option<f64>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel: String,
    pub outcome: ChannelOutcome,
}

/// Summary of one run, one entry per channel sorted by name.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub channels: Vec<ChannelReport>,
    pub processed_ids: usize,
    pub processed_cap: usize,
    /// Readable time of the last run that covered every channel, as loaded.
    pub previous_full_run: Option<String>,
    pub saved: bool,
    pub legacy_updated: bool,
    /// Writing the legacy timestamp failed after cursors and ids were saved.
    pub legacy_error: Option<String>,
}

impl RunReport {
    pub fn failed_channels(&self) -> Vec<&str> {
        self.channels
            .iter()
            .filter(|r| matches!(r.outcome, ChannelOutcome::Failed { .. }))
            .map(|r| r.channel.as_str())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_channels().is_empty()
    }

    pub fn total_chunks(&self) -> usize {
        self.channels
            .iter()
            .map(|r| match r.outcome {
                ChannelOutcome::Updated { chunks, .. } => chunks,
                ChannelOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.channels
            .iter()
            .find(|r| r.channel == channel)
            .map(|r| &r.outcome)
    }
}

/// Collaborators for a run.
pub struct UpdateContext<'a> {
    pub store: &'a TrackingStore,
    pub source: &'a dyn MessageSource,
    pub sink: &'a dyn ChunkSink,
    pub progress: &'a dyn UpdateProgressReporter,
}

/// Run one full incremental update.
///
/// Channel failures are reported in the returned [`RunReport`]; only a
/// failure to persist tracking state is an error.
pub async fn run_update(
    ctx: &UpdateContext<'_>,
    opts: &UpdateOptions,
) -> Result<RunReport, PersistenceError> {
    run_update_at(ctx, opts, Utc::now()).await
}

pub async fn run_update_at(
    ctx: &UpdateContext<'_>,
    opts: &UpdateOptions,
    now: DateTime<Utc>,
) -> Result<RunReport, PersistenceError> {
    let run_start = now.timestamp_micros() as f64 / 1e6;
    let state = ctx.store.load();
    if let Some(legacy) = &state.legacy {
        tracing::debug!(previous = %legacy.last_update_readable, "last full run");
    }

    let users = load_users(ctx.source, opts.channel_timeout).await;
    let initial_since = opts
        .initial_lookback_days
        .map(|days| run_start - f64::from(days) * SECS_PER_DAY);
    let inputs = UpdateInputs {
        processed: &state.processed,
        users: &users,
        chunking: &opts.chunking,
        initial_since,
    };

    let total = opts.channels.len() as u64;
    let mut results: Vec<(String, Result<(ChannelUpdate, usize), ChannelUpdateError>)> =
        stream::iter(opts.channels.iter().enumerate())
            .map(|(i, name)| {
                let inputs = &inputs;
                let state = &state;
                async move {
                    ctx.progress.report(UpdateProgressEvent::Fetching {
                        channel: name.clone(),
                        n: i as u64 + 1,
                        total,
                    });
                    let result = process_channel(ctx, opts, name, state, inputs).await;
                    (name.clone(), result)
                }
            })
            .buffer_unordered(opts.max_concurrent.max(1))
            .collect()
            .await;

    results.sort_by(|a, b| a.0.cmp(&b.0));

    let mut cursors = state.cursors.clone();
    let mut processed = state.processed.clone();
    let mut reports = Vec::with_capacity(results.len());

    for (name, result) in results {
        match result {
            Ok((update, published)) => {
                merge_cursor(&mut cursors, &name, update.cursor, now);
                processed.extend(update.new_ids.iter().cloned());
                tracing::info!(
                    channel = %name,
                    messages = update.new_ids.len(),
                    duplicates = update.duplicates,
                    chunks = update.chunks.len(),
                    "channel updated"
                );
                reports.push(ChannelReport {
                    channel: name,
                    outcome: ChannelOutcome::Updated {
                        messages: update.new_ids.len(),
                        duplicates: update.duplicates,
                        chunks: update.chunks.len(),
                        published,
                        cursor: update.cursor,
                    },
                });
            }
            Err(e) => {
                tracing::warn!(channel = %name, error = %e, "channel skipped for this run");
                ctx.progress.report(UpdateProgressEvent::Failed {
                    channel: name.clone(),
                    error: format!("{:#}", e.cause),
                });
                reports.push(ChannelReport {
                    channel: name,
                    outcome: ChannelOutcome::Failed {
                        error: format!("{:#}", e.cause),
                    },
                });
            }
        }
    }

    let mut report = RunReport {
        started_at: now,
        channels: reports,
        processed_ids: processed.len(),
        processed_cap: processed.max_len(),
        previous_full_run: state.legacy.as_ref().map(|l| l.last_update_readable.clone()),
        saved: false,
        legacy_updated: false,
        legacy_error: None,
    };

    if opts.dry_run {
        return Ok(report);
    }

    ctx.store.save_at(&cursors, &processed, now)?;
    report.saved = true;

    // Cursors and ids are already committed; a legacy write failure only
    // leaves the old global timestamp in place.
    if opts.covers_all_channels && report.all_succeeded() {
        match ctx.store.save_legacy(run_start) {
            Ok(()) => report.legacy_updated = true,
            Err(e) => {
                tracing::warn!(error = %e, "could not write legacy timestamp");
                report.legacy_error = Some(e.to_string());
            }
        }
    }

    Ok(report)
}

async fn process_channel(
    ctx: &UpdateContext<'_>,
    opts: &UpdateOptions,
    name: &str,
    state: &TrackingState,
    inputs: &UpdateInputs<'_>,
) -> Result<(ChannelUpdate, usize), ChannelUpdateError> {
    let work = async {
        let update = update_channel(ctx.source, name, state.cursors.get(name), inputs).await?;
        ctx.progress.report(UpdateProgressEvent::Chunked {
            channel: name.to_string(),
            messages: update.new_ids.len() as u64,
            chunks: update.chunks.len() as u64,
        });

        let published = if update.chunks.is_empty() || opts.dry_run {
            0
        } else {
            ctx.sink
                .publish(&update.chunks)
                .await
                .map_err(|e| ChannelUpdateError::new(name, e))?
        };
        if published > 0 {
            ctx.progress.report(UpdateProgressEvent::Published {
                channel: name.to_string(),
                chunks: published as u64,
            });
        }
        Ok::<_, ChannelUpdateError>((update, published))
    };

    match tokio::time::timeout(opts.channel_timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(ChannelUpdateError::new(
            name,
            anyhow::anyhow!("timed out after {}s", opts.channel_timeout.as_secs_f64()),
        )),
    }
}

/// Load the user directory, degrading to raw user ids on failure.
async fn load_users(source: &dyn MessageSource, timeout: Duration) -> UserDirectory {
    match tokio::time::timeout(timeout, source.fetch_users()).await {
        Ok(Ok(users)) => {
            tracing::info!(users = users.len(), "loaded user directory");
            users
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %format!("{:#}", e), "could not load users; using raw ids");
            UserDirectory::new()
        }
        Err(_) => {
            tracing::warn!("timed out loading users; using raw ids");
            UserDirectory::new()
        }
    }
}

/// Advance a channel's cursor. An unchanged value leaves the stored entry untouched.
fn merge_cursor(cursors: &mut CursorMap, channel: &str, new: Option<f64>, now: DateTime<Utc>) {
    let Some(new) = new else {
        return;
    };
    match cursors.get(channel) {
        Some(old) if old.last_update >= new => {}
        _ => {
            cursors.insert(channel.to_string(), ChannelCursor::at(new, now));
        }
    }
}

/// Print the run summary on stdout.
pub fn print_summary(report: &RunReport, dry_run: bool) {
    if dry_run {
        println!("update (dry-run)");
    } else {
        println!("update");
    }
    for r in &report.channels {
        match &r.outcome {
            ChannelOutcome::Updated {
                messages,
                duplicates,
                chunks,
                ..
            } => println!(
                "  #{:<28} new messages: {:<6} duplicates skipped: {:<4} chunks: {}",
                r.channel,
                format_number(*messages as u64),
                duplicates,
                format_number(*chunks as u64)
            ),
            ChannelOutcome::Failed { error } => {
                println!("  #{:<28} FAILED (skipped): {}", r.channel, error)
            }
        }
    }
    println!("  total chunks: {}", format_number(report.total_chunks() as u64));
    println!(
        "  processed ids tracked: {} of {}",
        format_number(report.processed_ids as u64),
        format_number(report.processed_cap as u64)
    );
    if let Some(previous) = &report.previous_full_run {
        println!("  previous full run: {}", previous);
    }
    if !dry_run {
        println!("  tracking saved: {}", report.saved);
        match &report.legacy_error {
            Some(error) => println!("  legacy timestamp updated: false ({})", error),
            None => println!("  legacy timestamp updated: {}", report.legacy_updated),
        }
    }
    println!("ok");
}
