//! End-to-end update runs against an in-memory message source and a
//! recording chunk sink, with tracking files in a temp directory.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use slack_sync::config::{ChunkingConfig, TrackingConfig};
use slack_sync::models::{ChannelRef, Chunk, Message, UserDirectory};
use slack_sync::progress::NoProgress;
use slack_sync::tracking::TrackingStore;
use slack_sync::traits::{ChunkSink, MessageSource};
use slack_sync::update::{run_update_at, ChannelOutcome, RunReport, UpdateContext, UpdateOptions};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

// ─── In-memory Slack ────────────────────────────────────────────────

#[derive(Default)]
struct FakeChannel {
    id: String,
    messages: Vec<Message>,
    failing: bool,
    delay: Option<Duration>,
}

#[derive(Default)]
struct FakeSlack {
    channels: Mutex<BTreeMap<String, FakeChannel>>,
}

impl FakeSlack {
    fn with_channels(names: &[&str]) -> Self {
        let slack = Self::default();
        {
            let mut channels = slack.channels.lock().unwrap();
            for (i, name) in names.iter().enumerate() {
                channels.insert(
                    name.to_string(),
                    FakeChannel {
                        id: format!("C{}", i + 1),
                        ..Default::default()
                    },
                );
            }
        }
        slack
    }

    /// Post a message and return its id.
    fn post(&self, channel: &str, ts: f64) -> String {
        let mut channels = self.channels.lock().unwrap();
        let ch = channels.get_mut(channel).unwrap();
        let id = format!("{}:{:.6}", ch.id, ts);
        ch.messages.push(message(&id, ts));
        id
    }

    /// Deliver a message whose id has been seen before, at a new timestamp.
    fn redeliver(&self, channel: &str, id: &str, ts: f64) {
        let mut channels = self.channels.lock().unwrap();
        channels
            .get_mut(channel)
            .unwrap()
            .messages
            .push(message(id, ts));
    }

    fn set_failing(&self, channel: &str, failing: bool) {
        self.channels.lock().unwrap().get_mut(channel).unwrap().failing = failing;
    }

    fn set_delay(&self, channel: &str, delay: Duration) {
        self.channels.lock().unwrap().get_mut(channel).unwrap().delay = Some(delay);
    }
}

fn message(id: &str, ts: f64) -> Message {
    Message {
        id: id.to_string(),
        ts: format!("{:.6}", ts),
        timestamp: ts,
        user: Some("U1".to_string()),
        text: Some(format!("message at {}", ts)),
        thread_ts: None,
        reply_count: 0,
    }
}

#[async_trait]
impl MessageSource for FakeSlack {
    async fn resolve_channel(&self, name: &str) -> Result<ChannelRef> {
        let channels = self.channels.lock().unwrap();
        match channels.get(name) {
            Some(ch) => Ok(ChannelRef {
                id: ch.id.clone(),
                name: name.to_string(),
            }),
            None => bail!("channel '{}' not found", name),
        }
    }

    async fn fetch(&self, channel: &ChannelRef, since: Option<f64>) -> Result<Vec<Message>> {
        let (failing, delay, messages) = {
            let channels = self.channels.lock().unwrap();
            let ch = &channels[&channel.name];
            // `oldest` is inclusive upstream, so the boundary message comes back.
            let messages: Vec<Message> = ch
                .messages
                .iter()
                .filter(|m| since.map_or(true, |s| m.timestamp >= s))
                .cloned()
                .collect();
            (ch.failing, ch.delay, messages)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            bail!("channel_not_found");
        }
        Ok(messages)
    }

    async fn fetch_users(&self) -> Result<UserDirectory> {
        let mut users = UserDirectory::new();
        users.insert("U1", "ana");
        Ok(users)
    }
}

// ─── Recording sink ─────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Chunk>>,
    failing_channel: Mutex<Option<String>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    fn message_ids(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .flat_map(|c| c.message_ids.clone())
            .collect()
    }

    fn fail_for(&self, channel: Option<&str>) {
        *self.failing_channel.lock().unwrap() = channel.map(str::to_string);
    }
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn publish(&self, chunks: &[Chunk]) -> Result<usize> {
        if let Some(bad) = self.failing_channel.lock().unwrap().as_deref() {
            if chunks.iter().any(|c| c.channel_name == bad) {
                bail!("index unavailable");
            }
        }
        self.published.lock().unwrap().extend_from_slice(chunks);
        Ok(chunks.len())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    store: TrackingStore,
    slack: FakeSlack,
    sink: RecordingSink,
    opts: UpdateOptions,
}

impl Harness {
    fn new(channels: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = TrackingStore::new(&TrackingConfig::in_dir(tmp.path().join("tracking")));
        Self::with_store(tmp, store, channels)
    }

    fn with_store(tmp: TempDir, store: TrackingStore, channels: &[&str]) -> Self {
        let opts = UpdateOptions {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            chunking: ChunkingConfig {
                window_size: 1,
                overlap: 0,
            },
            max_concurrent: 1,
            channel_timeout: Duration::from_secs(5),
            initial_lookback_days: None,
            dry_run: false,
            covers_all_channels: true,
        };
        Self {
            _tmp: tmp,
            store,
            slack: FakeSlack::with_channels(channels),
            sink: RecordingSink::default(),
            opts,
        }
    }

    async fn run_at(&self, now: DateTime<Utc>) -> RunReport {
        self.try_run_at(now).await.unwrap()
    }

    async fn try_run_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RunReport, slack_sync::error::PersistenceError> {
        let ctx = UpdateContext {
            store: &self.store,
            source: &self.slack,
            sink: &self.sink,
            progress: &NoProgress,
        };
        run_update_at(&ctx, &self.opts, now).await
    }

    async fn run(&self) -> RunReport {
        self.run_at(day(1)).await
    }

    fn cursor(&self, channel: &str) -> Option<f64> {
        self.store
            .try_load_cursors()
            .unwrap()
            .get(channel)
            .map(|c| c.last_update)
    }

    fn processed(&self) -> Vec<String> {
        self.store
            .try_load_processed()
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect()
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, d, 12, 0, 0).unwrap()
}

fn new_messages(report: &RunReport, channel: &str) -> usize {
    match report.outcome(channel) {
        Some(ChannelOutcome::Updated { messages, .. }) => *messages,
        other => panic!("channel {} not updated: {:?}", channel, other),
    }
}

fn chunks(report: &RunReport, channel: &str) -> usize {
    match report.outcome(channel) {
        Some(ChannelOutcome::Updated { chunks, .. }) => *chunks,
        other => panic!("channel {} not updated: {:?}", channel, other),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn first_run_then_rerun_is_idempotent() {
    let h = Harness::new(&["general"]);
    let ids: Vec<String> = [100.0, 200.0, 300.0]
        .iter()
        .map(|ts| h.slack.post("general", *ts))
        .collect();

    let report = h.run().await;
    assert_eq!(chunks(&report, "general"), 3);
    assert_eq!(h.sink.count(), 3);
    assert_eq!(h.cursor("general"), Some(300.0));
    assert_eq!(h.processed(), ids);
    assert!(report.saved);

    let cursor_file = fs::read_to_string(h.store.channel_path()).unwrap();
    let report = h.run_at(day(2)).await;
    assert_eq!(chunks(&report, "general"), 0);
    assert_eq!(new_messages(&report, "general"), 0);
    assert_eq!(h.sink.count(), 3);
    assert_eq!(h.processed(), ids);
    assert_eq!(fs::read_to_string(h.store.channel_path()).unwrap(), cursor_file);
}

#[tokio::test]
async fn redelivered_message_is_not_chunked_again() {
    let h = Harness::new(&["general"]);
    let first = h.slack.post("general", 100.0);
    h.slack.post("general", 200.0);
    h.slack.post("general", 300.0);
    h.run().await;

    // Re-delivery above the cursor passes the timestamp filter but not dedup.
    h.slack.redeliver("general", &first, 350.0);
    let report = h.run().await;
    assert_eq!(chunks(&report, "general"), 0);
    assert_eq!(h.cursor("general"), Some(300.0));

    // Cursor file lost: every message comes back, plus a re-delivery at 250.
    fs::remove_file(h.store.channel_path()).unwrap();
    h.slack.redeliver("general", &first, 250.0);
    let report = h.run().await;
    assert_eq!(chunks(&report, "general"), 0);
    assert_eq!(h.sink.count(), 3);

    let ids = h.sink.message_ids();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn failing_channel_keeps_its_cursor_while_others_advance() {
    let h = Harness::new(&["alpha", "beta"]);
    h.slack.post("alpha", 100.0);
    h.slack.post("beta", 100.0);
    h.run().await;

    let before = fs::read_to_string(h.store.channel_path()).unwrap();
    let alpha_before: serde_json::Value = serde_json::from_str(&before).unwrap();

    h.slack.set_failing("alpha", true);
    h.slack.post("alpha", 200.0);
    let beta_new = h.slack.post("beta", 200.0);
    let report = h.run_at(day(2)).await;

    assert_eq!(report.failed_channels(), vec!["alpha"]);
    assert!(report.saved);
    assert_eq!(h.cursor("beta"), Some(200.0));
    assert!(h.processed().contains(&beta_new));

    let after: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(h.store.channel_path()).unwrap()).unwrap();
    assert_eq!(after["alpha"], alpha_before["alpha"]);
    assert_eq!(
        serde_json::to_string(&after["alpha"]).unwrap(),
        serde_json::to_string(&alpha_before["alpha"]).unwrap()
    );

    // Recovery picks up exactly what was missed.
    h.slack.set_failing("alpha", false);
    let report = h.run_at(day(3)).await;
    assert_eq!(new_messages(&report, "alpha"), 1);
    assert_eq!(h.cursor("alpha"), Some(200.0));
}

#[tokio::test]
async fn unknown_channel_is_skipped_not_fatal() {
    let mut h = Harness::new(&["general"]);
    h.opts.channels.push("missing".to_string());
    h.slack.post("general", 100.0);

    let report = h.run().await;
    assert_eq!(report.failed_channels(), vec!["missing"]);
    assert_eq!(h.cursor("general"), Some(100.0));
    assert_eq!(h.cursor("missing"), None);
}

#[tokio::test]
async fn publish_failure_leaves_channel_uncommitted() {
    let h = Harness::new(&["alpha", "beta"]);
    h.slack.post("alpha", 100.0);
    h.slack.post("beta", 100.0);
    h.sink.fail_for(Some("alpha"));

    let report = h.run().await;
    assert_eq!(report.failed_channels(), vec!["alpha"]);
    assert_eq!(h.cursor("alpha"), None);
    assert_eq!(h.cursor("beta"), Some(100.0));
    assert_eq!(h.processed().len(), 1);

    h.sink.fail_for(None);
    let report = h.run_at(day(2)).await;
    assert_eq!(new_messages(&report, "alpha"), 1);
    assert_eq!(h.cursor("alpha"), Some(100.0));
}

#[tokio::test]
async fn slow_channel_times_out_and_is_skipped() {
    let mut h = Harness::new(&["fast", "slow"]);
    h.opts.channel_timeout = Duration::from_millis(50);
    h.slack.post("fast", 100.0);
    h.slack.post("slow", 100.0);
    h.slack.set_delay("slow", Duration::from_millis(500));

    let report = h.run().await;
    assert_eq!(report.failed_channels(), vec!["slow"]);
    match report.outcome("slow") {
        Some(ChannelOutcome::Failed { error }) => assert!(error.contains("timed out")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.cursor("fast"), Some(100.0));
    assert_eq!(h.cursor("slow"), None);
}

#[tokio::test]
async fn cursor_never_decreases_across_runs() {
    let h = Harness::new(&["general"]);
    let mut last = 0.0;
    for (run, ts) in [300.0, 100.0, 500.0, 200.0, 500.0].iter().enumerate() {
        h.slack.post("general", *ts);
        h.run_at(day(run as u32 + 1)).await;
        let cursor = h.cursor("general").unwrap();
        assert!(cursor >= last, "cursor moved back from {} to {}", last, cursor);
        last = cursor;
    }
    assert_eq!(last, 500.0);
}

#[tokio::test]
async fn processed_ids_are_capped_oldest_first() {
    let tmp = TempDir::new().unwrap();
    let mut config = TrackingConfig::in_dir(tmp.path().join("tracking"));
    config.max_processed_ids = 3;
    let store = TrackingStore::new(&config);
    let h = Harness::with_store(tmp, store, &["general"]);

    let first: Vec<String> = [1.0, 2.0, 3.0]
        .iter()
        .map(|ts| h.slack.post("general", *ts))
        .collect();
    h.run().await;
    assert_eq!(h.processed(), first);

    let second: Vec<String> = [4.0, 5.0]
        .iter()
        .map(|ts| h.slack.post("general", *ts))
        .collect();
    h.run_at(day(2)).await;

    let processed = h.processed();
    assert_eq!(processed.len(), 3);
    assert_eq!(processed, vec![first[2].clone(), second[0].clone(), second[1].clone()]);

    let raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(h.store.processed_path()).unwrap()).unwrap();
    assert_eq!(raw["total_count"], 3);
}

#[tokio::test]
async fn legacy_timestamp_only_written_when_every_channel_succeeds() {
    let mut h = Harness::new(&["alpha", "beta"]);
    h.slack.post("alpha", 100.0);
    h.slack.set_failing("beta", true);

    let report = h.run().await;
    assert!(!report.legacy_updated);
    assert!(!h.store.legacy_path().exists());

    h.slack.set_failing("beta", false);
    h.opts.covers_all_channels = false;
    let report = h.run_at(day(2)).await;
    assert!(report.all_succeeded());
    assert!(!report.legacy_updated);
    assert!(!h.store.legacy_path().exists());

    h.opts.covers_all_channels = true;
    let report = h.run_at(day(3)).await;
    assert!(report.legacy_updated);
    let legacy = h.store.try_load_legacy().unwrap().unwrap();
    assert_eq!(legacy.last_update, day(3).timestamp() as f64);
    assert_eq!(legacy.last_update_readable, "2024-04-03 12:00:00");
}

#[tokio::test]
async fn dry_run_publishes_and_saves_nothing() {
    let mut h = Harness::new(&["general"]);
    h.opts.dry_run = true;
    h.slack.post("general", 100.0);

    let report = h.run().await;
    assert_eq!(chunks(&report, "general"), 1);
    assert!(!report.saved);
    assert_eq!(h.sink.count(), 0);
    assert!(!h.store.channel_path().exists());
    assert!(!h.store.processed_path().exists());
    assert!(!h.store.legacy_path().exists());
}

#[tokio::test]
async fn corrupted_tracking_files_fall_back_to_empty_state() {
    let h = Harness::new(&["general"]);
    fs::create_dir_all(h.store.channel_path().parent().unwrap()).unwrap();
    fs::write(h.store.channel_path(), "{ not json").unwrap();
    fs::write(h.store.processed_path(), "[1, 2").unwrap();
    h.slack.post("general", 100.0);

    let report = h.run().await;
    assert_eq!(new_messages(&report, "general"), 1);
    assert_eq!(h.cursor("general"), Some(100.0));
    assert_eq!(h.processed().len(), 1);
}

#[tokio::test]
async fn failed_save_reports_persistence_error_and_keeps_prior_state() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("tracking");
    fs::write(&blocker, "not a directory").unwrap();
    let store = TrackingStore::new(&TrackingConfig::in_dir(&blocker));
    let h = Harness::with_store(tmp, store, &["general"]);
    h.slack.post("general", 100.0);

    let err = h.try_run_at(day(1)).await.unwrap_err();
    assert!(err.to_string().contains("tracking"), "{}", err);
    assert_eq!(fs::read_to_string(&blocker).unwrap(), "not a directory");
}

#[tokio::test]
async fn concurrent_channels_report_sorted_by_name() {
    let mut h = Harness::new(&["zeta", "alpha", "mid"]);
    h.opts.max_concurrent = 3;
    for name in ["zeta", "alpha", "mid"] {
        h.slack.post(name, 10.0);
    }
    h.slack.set_delay("alpha", Duration::from_millis(30));

    let report = h.run().await;
    let names: Vec<&str> = report.channels.iter().map(|r| r.channel.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    assert!(report.all_succeeded());
    assert_eq!(report.total_chunks(), 3);
}

#[tokio::test]
async fn legacy_write_failure_keeps_committed_tracking() {
    let h = Harness::new(&["general"]);
    fs::create_dir_all(h.store.legacy_path()).unwrap();
    h.slack.post("general", 100.0);

    let report = h.run().await;
    assert!(report.saved);
    assert!(report.all_succeeded());
    assert!(!report.legacy_updated);
    assert!(report.legacy_error.is_some());
    assert_eq!(h.cursor("general"), Some(100.0));
    assert_eq!(h.processed().len(), 1);
}

#[tokio::test]
async fn previous_full_run_is_reported() {
    let h = Harness::new(&["general"]);
    let report = h.run().await;
    assert!(report.legacy_updated);
    assert_eq!(report.previous_full_run, None);

    let report = h.run_at(day(2)).await;
    assert_eq!(report.previous_full_run.as_deref(), Some("2024-04-01 12:00:00"));
}
