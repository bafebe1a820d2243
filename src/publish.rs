//! Embedding + upsert sink.
//!
//! [`IndexingSink`] embeds chunks in batches of `embedding.batch_size` and
//! upserts each batch into the vector index. Any failure fails the whole
//! publish call; since chunk ids are deterministic, retrying a channel in
//! a later run overwrites whatever part of the batch already landed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::index::{self, IndexRecord, VectorIndex};
use crate::models::Chunk;
use crate::traits::ChunkSink;

pub struct IndexingSink {
    provider: Box<dyn EmbeddingProvider>,
    index: Box<dyn VectorIndex>,
    batch_size: usize,
}

impl IndexingSink {
    pub fn new(
        provider: Box<dyn EmbeddingProvider>,
        index: Box<dyn VectorIndex>,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            index,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        if !config.embedding.is_enabled() {
            anyhow::bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }
        let provider = embedding::create_provider(&config.embedding)?;
        let index = index::create_index(&config.index)?;
        Ok(Self::new(provider, index, config.embedding.batch_size))
    }
}

#[async_trait]
impl ChunkSink for IndexingSink {
    async fn publish(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut written = 0;

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .provider
                .embed(&texts)
                .await
                .with_context(|| format!("embedding {} chunks", batch.len()))?;
            let dims = self.provider.dims();
            if vectors.len() != batch.len() || vectors.iter().any(|v| v.len() != dims) {
                bail!(
                    "{} returned vectors that do not match {} chunks of {} dimensions",
                    self.provider.model_name(),
                    batch.len(),
                    dims
                );
            }

            let records: Vec<IndexRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, values)| IndexRecord {
                    id: chunk.id.clone(),
                    values,
                    metadata: chunk_metadata(chunk),
                })
                .collect();

            written += self
                .index
                .upsert(records)
                .await
                .with_context(|| format!("upserting {} vectors", batch.len()))?;
        }

        tracing::debug!(
            written,
            model = self.provider.model_name(),
            "published chunks"
        );
        Ok(written)
    }
}

/// Metadata stored alongside each vector.
pub fn chunk_metadata(chunk: &Chunk) -> serde_json::Value {
    serde_json::json!({
        "text": chunk.text,
        "channel_name": chunk.channel_name,
        "channel_id": chunk.channel_id,
        "chunk_index": chunk.chunk_index,
        "total_chunks": chunk.total_chunks,
        "message_count": chunk.message_count,
        "timestamp": chunk.timestamp,
        "hash": chunk.hash,
        "thread_ts": chunk.thread_ts,
        "reply_count": chunk.reply_count,
        "update_type": "incremental",
    })
}
