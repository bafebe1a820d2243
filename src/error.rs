//! Error taxonomy for an update run.
//!
//! Each variant maps to one recovery policy:
//!
//! | Error | Raised by | Policy |
//! |-------|-----------|--------|
//! | [`TrackingError`] | [`TrackingStore::try_load`](crate::tracking::TrackingStore::try_load) | fall back to empty state, warn |
//! | [`ChannelUpdateError`] | [`update_channel`](crate::updater::update_channel) | skip the channel for this run |
//! | [`PersistenceError`] | [`TrackingStore::save`](crate::tracking::TrackingStore::save) | fatal, previous files stay intact |

use std::path::PathBuf;
use thiserror::Error;

/// A tracking file exists but could not be turned into state.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking file {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("tracking file {path} could not be read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetching, chunking, or publishing one channel failed.
///
/// The channel's cursor and processed ids are left exactly as they were
/// loaded at the start of the run.
#[derive(Debug, Error)]
#[error("channel #{channel} failed: {cause:#}")]
pub struct ChannelUpdateError {
    pub channel: String,
    #[source]
    pub cause: anyhow::Error,
}

impl ChannelUpdateError {
    pub fn new(channel: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            channel: channel.into(),
            cause: cause.into(),
        }
    }
}

/// Writing tracking state back to disk failed.
#[derive(Debug, Error)]
#[error("failed to persist {path}: {source}")]
pub struct PersistenceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelUpdateError::new("general", anyhow::anyhow!("channel_not_found"));
        assert_eq!(
            err.to_string(),
            "channel #general failed: channel_not_found"
        );

        let err = PersistenceError {
            path: PathBuf::from("/data/channel_tracking.json"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(err.to_string().contains("channel_tracking.json"));
        assert!(err.to_string().contains("disk full"));

        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = TrackingError::Corrupted {
            path: PathBuf::from("processed_messages.json"),
            source,
        };
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn test_channel_error_keeps_context_chain() {
        let cause = anyhow::anyhow!("connection reset").context("conversations.history");
        let err = ChannelUpdateError::new("creative", cause);
        let msg = err.to_string();
        assert!(msg.contains("conversations.history"));
        assert!(msg.contains("connection reset"));
    }
}
