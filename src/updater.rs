//! Per-channel incremental update.
//!
//! [`update_channel`] turns one channel's cursor plus the processed-id set
//! into the work for this run: the messages newer than the cursor that
//! have never been processed, chunked, with the cursor they advance to.
//!
//! Nothing here writes tracking state. The caller decides whether the
//! returned cursor and ids are committed.

use std::collections::HashSet;

use crate::chunk::chunk_messages;
use crate::config::ChunkingConfig;
use crate::error::ChannelUpdateError;
use crate::models::{ChannelRef, Chunk, Message, UserDirectory};
use crate::tracking::{ChannelCursor, ProcessedIds};
use crate::traits::MessageSource;

/// Result of updating one channel.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub channel: ChannelRef,
    pub chunks: Vec<Chunk>,
    /// New cursor value; `None` only when the channel had no cursor and
    /// nothing new was processed.
    pub cursor: Option<f64>,
    /// Ids of the messages processed in this update, oldest first.
    pub new_ids: Vec<String>,
    /// Messages returned by the source after the strict cursor filter.
    pub fetched: usize,
    /// Messages dropped because their id was already processed.
    pub duplicates: usize,
}

/// Inputs shared by every channel in a run.
pub struct UpdateInputs<'a> {
    pub processed: &'a ProcessedIds,
    pub users: &'a UserDirectory,
    pub chunking: &'a ChunkingConfig,
    /// Lower bound used for channels that have no cursor yet. `None`
    /// fetches the full history.
    pub initial_since: Option<f64>,
}

pub async fn update_channel(
    source: &dyn MessageSource,
    name: &str,
    cursor: Option<&ChannelCursor>,
    inputs: &UpdateInputs<'_>,
) -> Result<ChannelUpdate, ChannelUpdateError> {
    let channel = source
        .resolve_channel(name)
        .await
        .map_err(|e| ChannelUpdateError::new(name, e))?;

    let old_cursor = cursor.map(|c| c.last_update);
    let since = old_cursor.or(inputs.initial_since);

    let fetched = source
        .fetch(&channel, since)
        .await
        .map_err(|e| ChannelUpdateError::new(name, e))?;

    Ok(select_and_chunk(channel, fetched, old_cursor, since, inputs))
}

/// Apply the strict cursor filter and id deduplication, then chunk what is left.
pub fn select_and_chunk(
    channel: ChannelRef,
    mut fetched: Vec<Message>,
    old_cursor: Option<f64>,
    since: Option<f64>,
    inputs: &UpdateInputs<'_>,
) -> ChannelUpdate {
    if let Some(since) = since {
        fetched.retain(|m| m.timestamp > since);
    }
    fetched.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    let fetched_count = fetched.len();

    let mut seen_this_run: HashSet<&str> = HashSet::new();
    let mut fresh: Vec<&Message> = Vec::with_capacity(fetched.len());
    for m in &fetched {
        if inputs.processed.contains(&m.id) || !seen_this_run.insert(m.id.as_str()) {
            continue;
        }
        fresh.push(m);
    }
    let duplicates = fetched_count - fresh.len();

    let fresh: Vec<Message> = fresh.into_iter().cloned().collect();
    let chunks = chunk_messages(&channel, &fresh, inputs.users, inputs.chunking);

    let latest = fresh.iter().map(|m| m.timestamp).reduce(f64::max);
    let cursor = match (old_cursor, latest) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    if duplicates > 0 {
        tracing::debug!(
            channel = %channel.name,
            duplicates,
            "skipped already-processed messages"
        );
    }

    ChannelUpdate {
        new_ids: fresh.into_iter().map(|m| m.id).collect(),
        channel,
        chunks,
        cursor,
        fetched: fetched_count,
        duplicates,
    }
}
