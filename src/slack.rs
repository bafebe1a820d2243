//! Slack Web API message source.
//!
//! Implements [`MessageSource`] over three Web API methods:
//!
//! | Method | Used for |
//! |--------|----------|
//! | `conversations.list` | resolve a channel name to its id (public + private) |
//! | `conversations.history` | incremental fetch with `oldest` and cursor pagination |
//! | `users.list` | user id → display name table |
//!
//! # Configuration
//!
//! ```toml
//! [slack]
//! token_env = "SLACK_BOT_TOKEN"
//! page_size = 100
//! page_delay_ms = 1000
//! timeout_secs = 30
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 → wait for `Retry-After` seconds (default 30), then retry
//! - HTTP 5xx and network errors → exponential backoff, then retry
//! - Other HTTP errors and `"ok": false` bodies → fail immediately

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::SlackConfig;
use crate::models::{ChannelRef, Message, UserDirectory};
use crate::traits::MessageSource;

/// Default wait when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

pub struct SlackSource {
    client: reqwest::Client,
    token: String,
    config: SlackConfig,
}

impl SlackSource {
    /// Create a source, reading the bot token from `config.token_env`.
    pub fn from_config(config: &SlackConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;
        Self::new(config, token)
    }

    pub fn new(config: &SlackConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            token,
            config: config.clone(),
        })
    }

    /// Call a Web API method and return the body of a successful (`ok: true`) response.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), method);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(params)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 {
                        let wait = retry_after_secs(response.headers());
                        tracing::warn!(method, wait_secs = wait, "rate limited by Slack");
                        last_err = Some(anyhow::anyhow!("{}: rate limited", method));
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }

                    if status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "{}: Slack API error {}: {}",
                            method,
                            status,
                            body_text
                        ));
                        backoff(attempt).await;
                        continue;
                    }

                    if !status.is_success() {
                        let body_text = response.text().await.unwrap_or_default();
                        bail!("{}: Slack API error {}: {}", method, status, body_text);
                    }

                    let json: serde_json::Value = response
                        .json()
                        .await
                        .with_context(|| format!("{}: invalid JSON response", method))?;
                    check_ok(method, &json)?;
                    return Ok(json);
                }
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context(method.to_string()));
                    backoff(attempt).await;
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{}: failed after retries", method)))
    }

    async fn page_delay(&self) {
        if self.config.page_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
        }
    }
}

#[async_trait]
impl MessageSource for SlackSource {
    async fn resolve_channel(&self, name: &str) -> Result<ChannelRef> {
        let wanted = name.trim_start_matches('#');
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "true".to_string()),
                ("limit", "200".to_string()),
            ];
            if let Some(ref c) = cursor {
                params.push(("cursor", c.clone()));
            }

            let json = self.call("conversations.list", &params).await?;
            let page: ChannelListPage = serde_json::from_value(json)?;

            if let Some(found) = page.channels.into_iter().find(|c| c.name == wanted) {
                return Ok(ChannelRef {
                    id: found.id,
                    name: wanted.to_string(),
                });
            }

            match page.response_metadata.and_then(|m| m.next_cursor_opt()) {
                Some(next) => cursor = Some(next),
                None => bail!("channel #{} not found", wanted),
            }
        }
    }

    async fn fetch(&self, channel: &ChannelRef, since: Option<f64>) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut params = vec![
                ("channel", channel.id.clone()),
                ("limit", self.config.page_size.to_string()),
            ];
            if let Some(ts) = since {
                params.push(("oldest", format!("{:.6}", ts)));
            }
            if let Some(ref c) = cursor {
                params.push(("cursor", c.clone()));
            }

            let json = self.call("conversations.history", &params).await?;
            let page = parse_history_page(&channel.id, json)?;
            pages += 1;
            tracing::debug!(
                channel = %channel.name,
                page = pages,
                messages = page.messages.len(),
                "fetched history page"
            );
            messages.extend(page.messages);

            match page.next_cursor {
                Some(next) if page.has_more => {
                    cursor = Some(next);
                    self.page_delay().await;
                }
                _ => break,
            }
        }

        sort_oldest_first(&mut messages);
        Ok(messages)
    }

    async fn fetch_users(&self) -> Result<UserDirectory> {
        let mut users = UserDirectory::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("limit", "200".to_string())];
            if let Some(ref c) = cursor {
                params.push(("cursor", c.clone()));
            }

            let json = self.call("users.list", &params).await?;
            let page: UserListPage = serde_json::from_value(json)?;
            for member in page.members {
                let name = member.display_name().to_string();
                users.insert(member.id, name);
            }

            match page.response_metadata.and_then(|m| m.next_cursor_opt()) {
                Some(next) => {
                    cursor = Some(next);
                    self.page_delay().await;
                }
                None => break,
            }
        }

        Ok(users)
    }
}

async fn backoff(attempt: u32) {
    // 1s, 2s, 4s, ... capped at 32s
    let delay = Duration::from_secs(1 << attempt.min(5));
    tokio::time::sleep(delay).await;
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn check_ok(method: &str, json: &serde_json::Value) -> Result<()> {
    if json.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(());
    }
    let error = json
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("unknown_error");
    bail!("{}: {}", method, error)
}

fn sort_oldest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
}

// ============ Response shapes ============

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

impl ResponseMetadata {
    fn next_cursor_opt(self) -> Option<String> {
        self.next_cursor.filter(|c| !c.is_empty())
    }
}

#[derive(Deserialize)]
struct ChannelListPage {
    #[serde(default)]
    channels: Vec<RawChannel>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct RawChannel {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct UserListPage {
    #[serde(default)]
    members: Vec<RawUser>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile: RawProfile,
}

#[derive(Deserialize, Default)]
struct RawProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

impl RawUser {
    /// Display name, then real name, then the login name.
    fn display_name(&self) -> &str {
        [&self.profile.display_name, &self.profile.real_name]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Deserialize)]
struct RawHistory {
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct RawMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    reply_count: u32,
}

struct HistoryPage {
    messages: Vec<Message>,
    has_more: bool,
    next_cursor: Option<String>,
}

fn parse_history_page(channel_id: &str, json: serde_json::Value) -> Result<HistoryPage> {
    let raw: RawHistory =
        serde_json::from_value(json).context("conversations.history: unexpected response shape")?;

    let mut messages = Vec::with_capacity(raw.messages.len());
    for m in raw.messages {
        let timestamp: f64 = m
            .ts
            .parse()
            .with_context(|| format!("invalid message ts '{}'", m.ts))?;
        messages.push(Message {
            id: format!("{}:{}", channel_id, m.ts),
            ts: m.ts,
            timestamp,
            user: m.user,
            text: m.text,
            thread_ts: m.thread_ts,
            reply_count: m.reply_count,
        });
    }

    Ok(HistoryPage {
        messages,
        has_more: raw.has_more,
        next_cursor: raw.response_metadata.and_then(|m| m.next_cursor_opt()),
    })
}
