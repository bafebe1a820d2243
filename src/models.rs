//! Core data models used throughout the update pipeline.
//!
//! These types represent the channels, messages, and chunks that flow from
//! the message source through chunking to the vector index.

use std::collections::HashMap;

/// A resolved channel: the platform id plus the configured name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

/// Raw message produced by a [`MessageSource`](crate::traits::MessageSource).
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable identifier, unique across channels (e.g. `C024BE91L:1712345678.000200`).
    pub id: String,
    /// Platform timestamp string as delivered (`ts`).
    pub ts: String,
    /// `ts` as epoch seconds.
    pub timestamp: f64,
    pub user: Option<String>,
    pub text: Option<String>,
    /// Parent thread timestamp when the message belongs to a thread.
    pub thread_ts: Option<String>,
    pub reply_count: u32,
}

/// A unit of indexable text built from a window of messages.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Deterministic id derived from the channel and member message ids.
    pub id: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Position within this channel's chunks for the run (1-based).
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub message_ids: Vec<String>,
    /// Number of rendered lines in `text`.
    pub message_count: usize,
    /// `ts` of the first message in the window.
    pub timestamp: String,
    /// Distinct parent thread timestamps of the window's threaded messages.
    pub thread_ts: Vec<String>,
    /// Replies summed over the window's thread parents.
    pub reply_count: u32,
}

/// Maps user ids to display names. Unknown ids resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    names: HashMap<String, String>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: impl Into<String>, display_name: impl Into<String>) {
        self.names.insert(user_id.into(), display_name.into());
    }

    pub fn resolve<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.names
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(user_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(String, String)> for UserDirectory {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_directory_falls_back_to_id() {
        let mut users = UserDirectory::new();
        users.insert("U1", "ana");
        assert_eq!(users.resolve("U1"), "ana");
        assert_eq!(users.resolve("U404"), "U404");
        assert_eq!(users.len(), 1);
    }
}
