//! Sliding-window conversation chunker.
//!
//! Groups a channel's new messages into overlapping windows so each chunk
//! keeps some surrounding conversation. With `window_size = 5` and
//! `overlap = 2` the windows start at messages 0, 3, 6, ...
//!
//! Each window renders one line per message that has both an author and
//! text (`[<display name>]: <text>`); a window with no such lines yields
//! no chunk.
//!
//! Chunk ids are UUIDv5 values over the channel id and the member message
//! ids, so the same messages always produce the same chunk id and a
//! repeated upsert overwrites instead of duplicating.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{ChannelRef, Chunk, Message, UserDirectory};

pub fn chunk_messages(
    channel: &ChannelRef,
    messages: &[Message],
    users: &UserDirectory,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let window_size = config.window_size.max(1);
    let step = window_size.saturating_sub(config.overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < messages.len() {
        let end = (start + window_size).min(messages.len());
        let window = &messages[start..end];

        let lines: Vec<String> = window
            .iter()
            .filter_map(|m| match (&m.user, &m.text) {
                (Some(user), Some(text)) => Some(format!("[{}]: {}", users.resolve(user), text)),
                _ => None,
            })
            .collect();

        if !lines.is_empty() {
            chunks.push(make_chunk(channel, window, lines));
        }

        start += step;
    }

    let total = chunks.len();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_index = i + 1;
        chunk.total_chunks = total;
    }
    chunks
}

/// Deterministic chunk id for a window of messages in a channel.
pub fn chunk_id(channel_id: &str, message_ids: &[String]) -> String {
    let mut name = String::from(channel_id);
    for id in message_ids {
        name.push('\n');
        name.push_str(id);
    }
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn make_chunk(channel: &ChannelRef, window: &[Message], lines: Vec<String>) -> Chunk {
    let message_ids: Vec<String> = window.iter().map(|m| m.id.clone()).collect();
    let text = lines.join("\n");

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let mut thread_ts: Vec<String> = Vec::new();
    for ts in window.iter().filter_map(|m| m.thread_ts.as_ref()) {
        if !thread_ts.contains(ts) {
            thread_ts.push(ts.clone());
        }
    }

    Chunk {
        id: chunk_id(&channel.id, &message_ids),
        channel_id: channel.id.clone(),
        channel_name: channel.name.clone(),
        chunk_index: 0,
        total_chunks: 0,
        message_count: lines.len(),
        text,
        hash,
        timestamp: window[0].ts.clone(),
        thread_ts,
        reply_count: window.iter().map(|m| m.reply_count).sum(),
        message_ids,
    }
}
