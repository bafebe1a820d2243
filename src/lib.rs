//! # Slack Sync
//!
//! Incremental, idempotent ingestion of Slack channel history into a
//! vector index.
//!
//! Each run fetches only messages newer than a per-channel cursor, skips
//! messages already processed, chunks the rest with a sliding window,
//! embeds and upserts the chunks, and then records the new cursors and
//! processed ids on disk. A failing channel never blocks the others and
//! never moves its own cursor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Slack API   │──▶│  Channel     │──▶│  Embed +     │
//! │ (source)    │   │  Updater     │   │  Upsert      │
//! └─────────────┘   └──────┬───────┘   └──────────────┘
//!                          │
//!                   ┌──────▼───────┐   ┌──────────────┐
//!                   │  Update      │──▶│  Tracking    │
//!                   │  Orchestrator│   │  Store (JSON)│
//!                   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export SLACK_BOT_TOKEN=xoxb-...
//! export OPENAI_API_KEY=sk-...
//! export PINECONE_API_KEY=...
//! slack-sync --config ./config/slack-sync.toml update --dry-run
//! slack-sync --config ./config/slack-sync.toml update
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors for tracking, channel updates, and persistence |
//! | [`models`] | Channels, messages, chunks, user directory |
//! | [`tracking`] | Cursor and processed-id persistence |
//! | [`traits`] | Message source and chunk sink seams |
//! | [`slack`] | Slack Web API message source |
//! | [`chunk`] | Sliding-window message chunking |
//! | [`updater`] | Per-channel incremental update |
//! | [`update`] | Multi-channel orchestration and commit |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index abstraction (Pinecone) |
//! | [`publish`] | Embed-and-upsert chunk sink |
//! | [`progress`] | Update progress reporting |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod progress;
pub mod publish;
pub mod slack;
pub mod tracking;
pub mod traits;
pub mod update;
pub mod updater;
