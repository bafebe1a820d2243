//! Persistent tracking state: per-channel cursors, the processed-id set,
//! and the legacy global timestamp.
//!
//! Three JSON files live in the tracking directory:
//!
//! ```text
//! channel_tracking.json    { "<channel>": { last_update, last_update_readable, last_updated_at } }
//! processed_messages.json  { processed_ids: [..], last_updated, total_count }
//! last_update.json         { last_update, last_update_readable }
//! ```
//!
//! Loading never aborts a run: a missing file yields empty state, and an
//! unreadable file is reported as a [`TrackingError`] by the `try_*`
//! loaders and replaced with empty state by [`TrackingStore::load`].
//!
//! Every write goes to a temporary file in the same directory which is
//! synced and then renamed over the target, so readers observe either
//! the previous or the new version of a file, never a partial one.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::config::TrackingConfig;
use crate::error::{PersistenceError, TrackingError};

const READABLE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format epoch seconds as a UTC `YYYY-MM-DD HH:MM:SS` string.
pub fn format_epoch(ts: f64) -> String {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos.min(999_999_999))
        .map(|dt| dt.format(READABLE_FORMAT).to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

fn format_now(now: DateTime<Utc>) -> String {
    now.format(READABLE_FORMAT).to_string()
}

// ============ Channel cursors ============

/// Watermark for one channel: the timestamp of the newest processed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelCursor {
    pub last_update: f64,
    pub last_update_readable: String,
    pub last_updated_at: String,
}

impl ChannelCursor {
    pub fn at(last_update: f64, now: DateTime<Utc>) -> Self {
        Self {
            last_update,
            last_update_readable: format_epoch(last_update),
            last_updated_at: format_now(now),
        }
    }
}

/// On-disk cursor entry. Older files stored a bare number per channel.
#[derive(Deserialize)]
#[serde(untagged)]
enum CursorEntry {
    Full {
        last_update: f64,
        #[serde(default)]
        last_update_readable: Option<String>,
        #[serde(default)]
        last_updated_at: Option<String>,
    },
    Bare(f64),
}

impl From<CursorEntry> for ChannelCursor {
    fn from(entry: CursorEntry) -> Self {
        match entry {
            CursorEntry::Full {
                last_update,
                last_update_readable,
                last_updated_at,
            } => Self {
                last_update,
                last_update_readable: last_update_readable
                    .unwrap_or_else(|| format_epoch(last_update)),
                last_updated_at: last_updated_at.unwrap_or_default(),
            },
            CursorEntry::Bare(last_update) => Self {
                last_update,
                last_update_readable: format_epoch(last_update),
                last_updated_at: String::new(),
            },
        }
    }
}

pub type CursorMap = BTreeMap<String, ChannelCursor>;

// ============ Processed-id set ============

/// Bounded, insertion-ordered set of processed message ids.
///
/// Membership is a hash lookup; when the set grows past `max_len` the
/// oldest ids are evicted first.
#[derive(Debug, Clone)]
pub struct ProcessedIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    max_len: usize,
}

impl ProcessedIds {
    pub fn new(max_len: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max_len: max_len.max(1),
        }
    }

    /// Build from ids in insertion order (oldest first), applying the cap.
    pub fn from_ids<I>(ids: I, max_len: usize) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = Self::new(max_len);
        set.extend(ids);
        set
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Insert an id. Returns `false` if it was already present, in which
    /// case its position is unchanged.
    pub fn insert(&mut self, id: String) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        self.evict();
        true
    }

    pub fn extend<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        for id in ids {
            self.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Ids oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn evict(&mut self) {
        while self.order.len() > self.max_len {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ProcessedFile {
    #[serde(default)]
    processed_ids: Vec<String>,
    #[serde(default)]
    last_updated: String,
    #[serde(default)]
    total_count: usize,
}

// ============ Legacy global timestamp ============

/// Single run-wide timestamp kept for consumers that predate per-channel cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTimestamp {
    pub last_update: f64,
    #[serde(default)]
    pub last_update_readable: String,
}

// ============ Store ============

/// Everything loaded at the start of a run.
#[derive(Debug, Clone)]
pub struct TrackingState {
    pub cursors: CursorMap,
    pub processed: ProcessedIds,
    pub legacy: Option<LegacyTimestamp>,
}

impl TrackingState {
    pub fn empty(max_processed_ids: usize) -> Self {
        Self {
            cursors: CursorMap::new(),
            processed: ProcessedIds::new(max_processed_ids),
            legacy: None,
        }
    }
}

/// File-backed tracking store rooted at one directory.
#[derive(Debug, Clone)]
pub struct TrackingStore {
    channel_path: PathBuf,
    processed_path: PathBuf,
    legacy_path: PathBuf,
    max_processed_ids: usize,
}

impl TrackingStore {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            channel_path: config.dir.join(&config.channel_file),
            processed_path: config.dir.join(&config.processed_file),
            legacy_path: config.dir.join(&config.legacy_file),
            max_processed_ids: config.max_processed_ids,
        }
    }

    pub fn channel_path(&self) -> &Path {
        &self.channel_path
    }

    pub fn processed_path(&self) -> &Path {
        &self.processed_path
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub fn max_processed_ids(&self) -> usize {
        self.max_processed_ids
    }

    /// Load all tracking state, replacing any unreadable file with its
    /// empty default.
    pub fn load(&self) -> TrackingState {
        let cursors = self.try_load_cursors().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "starting with empty channel cursors");
            CursorMap::new()
        });
        let processed = self.try_load_processed().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "starting with empty processed-id set");
            ProcessedIds::new(self.max_processed_ids)
        });
        let legacy = self.try_load_legacy().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring legacy timestamp");
            None
        });

        tracing::debug!(
            channels = cursors.len(),
            processed_ids = processed.len(),
            "loaded tracking state"
        );

        TrackingState {
            cursors,
            processed,
            legacy,
        }
    }

    /// Load all tracking state, failing on the first unreadable file.
    pub fn try_load(&self) -> Result<TrackingState, TrackingError> {
        Ok(TrackingState {
            cursors: self.try_load_cursors()?,
            processed: self.try_load_processed()?,
            legacy: self.try_load_legacy()?,
        })
    }

    pub fn try_load_cursors(&self) -> Result<CursorMap, TrackingError> {
        let entries: Option<BTreeMap<String, CursorEntry>> = read_json(&self.channel_path)?;
        Ok(entries
            .unwrap_or_default()
            .into_iter()
            .map(|(channel, entry)| (channel, ChannelCursor::from(entry)))
            .collect())
    }

    pub fn try_load_processed(&self) -> Result<ProcessedIds, TrackingError> {
        let file: Option<ProcessedFile> = read_json(&self.processed_path)?;
        let ids = file.map(|f| f.processed_ids).unwrap_or_default();
        Ok(ProcessedIds::from_ids(ids, self.max_processed_ids))
    }

    pub fn try_load_legacy(&self) -> Result<Option<LegacyTimestamp>, TrackingError> {
        read_json(&self.legacy_path)
    }

    /// Persist cursors and processed ids.
    ///
    /// The processed-id file is written before the cursor file: if the
    /// second write never happens, the stale cursors re-select messages
    /// that the id set already suppresses.
    pub fn save(&self, cursors: &CursorMap, processed: &ProcessedIds) -> Result<(), PersistenceError> {
        self.save_at(cursors, processed, Utc::now())
    }

    pub fn save_at(
        &self,
        cursors: &CursorMap,
        processed: &ProcessedIds,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let ids: Vec<String> = processed.iter().map(str::to_string).collect();
        let file = ProcessedFile {
            total_count: ids.len(),
            processed_ids: ids,
            last_updated: format_now(now),
        };
        write_json_atomic(&self.processed_path, &file)?;
        write_json_atomic(&self.channel_path, cursors)?;

        tracing::debug!(
            channels = cursors.len(),
            processed_ids = processed.len(),
            "saved tracking state"
        );
        Ok(())
    }

    pub fn save_legacy(&self, last_update: f64) -> Result<(), PersistenceError> {
        let legacy = LegacyTimestamp {
            last_update,
            last_update_readable: format_epoch(last_update),
        };
        write_json_atomic(&self.legacy_path, &legacy)
    }
}

/// Read and parse a JSON file. A missing file is `Ok(None)`.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, TrackingError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(TrackingError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| TrackingError::Corrupted {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `value` as pretty JSON via temp-file-then-rename.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let err = |source: std::io::Error| PersistenceError {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(err)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| err(e.into()))?;
    tmp.write_all(b"\n").map_err(err)?;
    tmp.as_file().sync_all().map_err(err)?;
    tmp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}
