//! Error kinds and the rejection report.
//!
//! Every failure the pipeline can hit on a single record maps to one of
//! four [`CanonError`] kinds. Only [`CanonError::AuthorAliasConflict`] is
//! fatal; the rest are recorded as [`Rejection`]s and the run continues.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Domain errors raised by the core pipeline stages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CanonError {
    /// Unreadable or malformed raw record.
    #[error("parse failure: {reason}")]
    ParseFailure { reason: String },

    /// Chapter/verse could not be resolved to a single integer pair.
    #[error("ambiguous verse identity '{expr}': {reason}")]
    VerseIdentityAmbiguous { expr: String, reason: String },

    /// A name normalizes to two distinct registry entries.
    #[error("author alias conflict for '{name}': matches author {first} and author {second}")]
    AuthorAliasConflict {
        name: String,
        first: u32,
        second: u32,
    },

    /// The embedding dependency failed or timed out after all retries.
    #[error("embedding unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },
}

impl CanonError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            reason: reason.into(),
        }
    }

    pub fn ambiguous(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VerseIdentityAmbiguous {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    pub fn embedding(reason: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    /// Fatal errors abort the run; everything else becomes a rejection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthorAliasConflict { .. })
    }

    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::ParseFailure { .. } => RejectionKind::ParseFailure,
            Self::VerseIdentityAmbiguous { .. } => RejectionKind::VerseIdentityAmbiguous,
            Self::AuthorAliasConflict { .. } => RejectionKind::AuthorAliasConflict,
            Self::EmbeddingUnavailable { .. } => RejectionKind::EmbeddingUnavailable,
        }
    }
}

/// Discriminant of [`CanonError`], as written in `rejections.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RejectionKind {
    ParseFailure,
    VerseIdentityAmbiguous,
    AuthorAliasConflict,
    EmbeddingUnavailable,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ParseFailure => "ParseFailure",
            Self::VerseIdentityAmbiguous => "VerseIdentityAmbiguous",
            Self::AuthorAliasConflict => "AuthorAliasConflict",
            Self::EmbeddingUnavailable => "EmbeddingUnavailable",
        };
        f.write_str(name)
    }
}

/// One skipped record (or bucket) with the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub source: String,
    pub location: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl Rejection {
    pub fn new(
        error: &CanonError,
        source: impl Into<String>,
        location: impl Into<String>,
        raw: Option<Value>,
    ) -> Self {
        Self {
            kind: error.kind(),
            source: source.into(),
            location: location.into(),
            reason: error.to_string(),
            raw,
        }
    }
}

/// Accumulates non-fatal rejections over a whole run.
#[derive(Debug, Clone, Default)]
pub struct RejectionReport {
    entries: Vec<Rejection>,
}

impl RejectionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rejection: Rejection) {
        self.entries.push(rejection);
    }

    pub fn extend(&mut self, rejections: impl IntoIterator<Item = Rejection>) {
        self.entries.extend(rejections);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Rejection] {
        &self.entries
    }

    pub fn counts_by_kind(&self) -> BTreeMap<RejectionKind, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.entries {
            *counts.entry(r.kind).or_insert(0) += 1;
        }
        counts
    }
}
