//! Vector index abstraction and the Pinecone implementation.
//!
//! Records are keyed by chunk id; upserting an existing id replaces the
//! stored vector and metadata.
//!
//! # Configuration
//!
//! ```toml
//! [index]
//! provider = "pinecone"
//! host = "https://slack-abc123.svc.us-east-1.pinecone.io"
//! namespace = "slack"
//! api_key_env = "PINECONE_API_KEY"
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::IndexConfig;

/// One vector plus its metadata, ready for upsert.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize>;
}

pub struct PineconeIndex {
    client: reqwest::Client,
    upsert_url: String,
    namespace: Option<String>,
    api_key: String,
    max_retries: u32,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("index.host required for Pinecone"))?;
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            upsert_url: upsert_url(host),
            namespace: config.namespace.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

fn upsert_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/vectors/upsert", host)
    } else {
        format!("https://{}/vectors/upsert", host)
    }
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: &'a [IndexRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let body = UpsertRequest {
            vectors: &records,
            namespace: self.namespace.as_deref(),
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.upsert_url)
                .header("Api-Key", &self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let count = json
                            .get("upsertedCount")
                            .and_then(|c| c.as_u64())
                            .map(|c| c as usize)
                            .unwrap_or(records.len());
                        return Ok(count);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Pinecone upsert error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Pinecone upsert error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Pinecone upsert failed after retries")))
    }
}

pub fn create_index(config: &IndexConfig) -> Result<Box<dyn VectorIndex>> {
    match config.provider.as_str() {
        "pinecone" => Ok(Box::new(PineconeIndex::new(config)?)),
        "disabled" => bail!("Vector index is disabled. Set [index] provider in config."),
        other => bail!("Unknown index provider: {}", other),
    }
}
