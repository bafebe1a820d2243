//! Collaborator traits at the edges of the update pipeline.
//!
//! ```text
//!  ┌───────────────┐     ┌───────────────┐     ┌─────────────┐
//!  │ MessageSource │────▶│ update_channel│────▶│  ChunkSink  │
//!  │  (Slack API)  │     │ dedup + chunk │     │ embed+upsert│
//!  └───────────────┘     └───────────────┘     └─────────────┘
//! ```
//!
//! The built-in implementations are [`SlackSource`](crate::slack::SlackSource)
//! and [`IndexingSink`](crate::publish::IndexingSink). Tests and embedders
//! can supply their own.
//!
//! # Example
//!
//! ```rust
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use slack_sync::models::Chunk;
//! use slack_sync::traits::ChunkSink;
//!
//! pub struct CountingSink;
//!
//! #[async_trait]
//! impl ChunkSink for CountingSink {
//!     async fn publish(&self, chunks: &[Chunk]) -> Result<usize> {
//!         Ok(chunks.len())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChannelRef, Chunk, Message, UserDirectory};

/// A messaging platform that can list channel history incrementally.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Look up a channel by its configured name.
    async fn resolve_channel(&self, name: &str) -> Result<ChannelRef>;

    /// Return messages with a timestamp after `since` (all messages when
    /// `since` is `None`), oldest first.
    ///
    /// Implementations may return messages at exactly `since`; the caller
    /// applies the strict comparison.
    async fn fetch(&self, channel: &ChannelRef, since: Option<f64>) -> Result<Vec<Message>>;

    /// Load the user-id to display-name table.
    async fn fetch_users(&self) -> Result<UserDirectory>;
}

/// Destination for finished chunks.
///
/// Publishing a chunk whose id was already published must overwrite the
/// earlier copy, never duplicate it.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Publish chunks, returning how many were written.
    async fn publish(&self, chunks: &[Chunk]) -> Result<usize>;
}

/// Sink that discards everything. Used for `--dry-run`.
pub struct DiscardSink;

#[async_trait]
impl ChunkSink for DiscardSink {
    async fn publish(&self, _chunks: &[Chunk]) -> Result<usize> {
        Ok(0)
    }
}
