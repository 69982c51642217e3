//! # Scripture Canon
//!
//! An offline batch pipeline that canonicalizes scripture verses and
//! deduplicates question/answer records across heterogeneous sources.
//!
//! Six verse sources (K1, K2, HF2, HF3, GH2, GH3) are merged into one
//! canonical record per verse with a persistent author registry. Two Q&A
//! sources (HF1, K3) get stable `qid`s and are clustered per verse by
//! embedding similarity. Reruns over the same inputs produce the same
//! bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐   ┌──────────┐
//! │  Sources    │──▶│   Adapters   │──▶│ Merge / Cluster │──▶│  JSONL   │
//! │ JSONL/JSON  │   │ (per source) │   │ (core crate)    │   │ outputs  │
//! └─────────────┘   └──────────────┘   └────────┬────────┘   └──────────┘
//!                                               │
//!                                      ┌────────▼────────┐
//!                                      │   Embedders     │
//!                                      │ hash/openai/... │
//!                                      └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`sources`] | Source discovery and raw-record reading |
//! | [`adapters`] | Per-source conversion to verse units and Q&A drafts |
//! | [`embedding`] | Embedding backends and bounded retry |
//! | [`pipeline`] | `canon build` orchestration |
//! | [`writer`] | Atomic JSONL writing, packaging, verification |
//! | [`stats`] | Output directory summary |
//! | [`progress`] | Build progress on stderr |
//!
//! The pure logic (normalizer, registry, merger, ids, clusterer) lives in
//! the `scripture-canon-core` crate.

pub mod adapters;
pub mod config;
pub mod embedding;
pub mod pipeline;
pub mod progress;
pub mod sources;
pub mod stats;
pub mod writer;
