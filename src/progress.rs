//! Update progress reporting.
//!
//! Reports per-channel progress during `slack-sync update` so an operator
//! can see which channel is being fetched and how much was published.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an update run.
#[derive(Clone, Debug)]
pub enum UpdateProgressEvent {
    /// Fetching channel `n` of `total`.
    Fetching { channel: String, n: u64, total: u64 },
    /// New messages were selected and chunked.
    Chunked {
        channel: String,
        messages: u64,
        chunks: u64,
    },
    /// Chunks were embedded and upserted.
    Published { channel: String, chunks: u64 },
    /// The channel was skipped for this run.
    Failed { channel: String, error: String },
}

/// Reports update progress. Implementations write to stderr (human or JSON).
pub trait UpdateProgressReporter: Send + Sync {
    fn report(&self, event: UpdateProgressEvent);
}

/// Human-friendly progress on stderr: "update #general  [2/8]  fetching...".
pub struct StderrProgress;

impl UpdateProgressReporter for StderrProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let line = match &event {
            UpdateProgressEvent::Fetching { channel, n, total } => {
                format!("update #{}  [{}/{}]  fetching...\n", channel, n, total)
            }
            UpdateProgressEvent::Chunked {
                channel,
                messages,
                chunks,
            } => format!(
                "update #{}  {} new messages  {} chunks\n",
                channel,
                format_number(*messages),
                format_number(*chunks)
            ),
            UpdateProgressEvent::Published { channel, chunks } => {
                format!(
                    "update #{}  published {} chunks\n",
                    channel,
                    format_number(*chunks)
                )
            }
            UpdateProgressEvent::Failed { channel, error } => {
                format!("update #{}  failed: {}\n", channel, error)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl UpdateProgressReporter for JsonProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &UpdateProgressEvent) -> serde_json::Value {
    match event {
        UpdateProgressEvent::Fetching { channel, n, total } => serde_json::json!({
            "event": "progress",
            "channel": channel,
            "phase": "fetching",
            "n": n,
            "total": total
        }),
        UpdateProgressEvent::Chunked {
            channel,
            messages,
            chunks,
        } => serde_json::json!({
            "event": "progress",
            "channel": channel,
            "phase": "chunked",
            "messages": messages,
            "chunks": chunks
        }),
        UpdateProgressEvent::Published { channel, chunks } => serde_json::json!({
            "event": "progress",
            "channel": channel,
            "phase": "published",
            "chunks": chunks
        }),
        UpdateProgressEvent::Failed { channel, error } => serde_json::json!({
            "event": "progress",
            "channel": channel,
            "phase": "failed",
            "error": error
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl UpdateProgressReporter for NoProgress {
    fn report(&self, _event: UpdateProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub(crate) fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn UpdateProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
