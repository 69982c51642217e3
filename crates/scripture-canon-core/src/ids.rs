//! Stable external identifiers and the precedence order behind them.
//!
//! | Identifier  | Format                                   | Assigned by |
//! |-------------|------------------------------------------|-------------|
//! | `verse_id`  | `<chapter>.<verse>`                      | [`verse_id`] |
//! | `qid`       | `<SOURCE>-<lang>-<verse_id>-<seq:03>`    | [`assign_qids`] |
//! | `cluster_id`| integer counting up from 1               | [`ClusterIdAllocator`] |
//! | `author_id` | integer, persisted across runs           | [`crate::registry`] |
//!
//! Every choice that would otherwise depend on input order goes through
//! [`PrecedenceKey`], a total ordering over source, language, verse and
//! position in the source.

use std::collections::HashMap;

use crate::models::{QaDraft, QaRecord};
use crate::normalize::normalize_identifier;

pub fn verse_id(chapter: u32, verse: u32) -> String {
    format!("{}.{}", chapter, verse)
}

pub fn qid(source: &str, language: &str, verse_id: &str, seq: usize) -> String {
    format!("{}-{}-{}-{:03}", source, language, verse_id, seq)
}

/// Fixed source and language ranking for Q&A records.
///
/// Sources or languages missing from the lists rank after every listed
/// one and then compare by name, so the order stays total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecedenceOrder {
    pub source_order: Vec<String>,
    pub language_order: Vec<String>,
}

/// `(source_rank, source, language_rank, language, chapter, verse, ordinal)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PrecedenceKey(usize, String, usize, String, u32, u32, usize);

impl Default for PrecedenceOrder {
    fn default() -> Self {
        Self::new(["HF1", "K3"], ["en", "hi", "sa"])
    }
}

impl PrecedenceOrder {
    pub fn new<S, L>(sources: S, languages: L) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            source_order: sources.into_iter().map(Into::into).collect(),
            language_order: languages.into_iter().map(Into::into).collect(),
        }
    }

    fn rank(list: &[String], value: &str) -> usize {
        list.iter().position(|v| v == value).unwrap_or(list.len())
    }

    pub fn key(
        &self,
        source: &str,
        language: &str,
        chapter: u32,
        verse: u32,
        ordinal: usize,
    ) -> PrecedenceKey {
        PrecedenceKey(
            Self::rank(&self.source_order, source),
            source.to_string(),
            Self::rank(&self.language_order, language),
            language.to_string(),
            chapter,
            verse,
            ordinal,
        )
    }

    pub fn record_key(&self, record: &QaRecord) -> PrecedenceKey {
        self.key(
            &record.source,
            &record.language,
            record.chapter,
            record.verse,
            record.ordinal,
        )
    }

    fn draft_key(&self, draft: &QaDraft, language: &str) -> PrecedenceKey {
        self.key(&draft.source, language, draft.chapter, draft.verse, draft.ordinal)
    }
}

/// Assign `qid`s and return the records in precedence order.
///
/// Sequence numbers start at 1 and restart for each
/// `(source, language, verse_id)` group. Because they follow precedence
/// rather than arrival order, shuffling the drafts does not change any id.
pub fn assign_qids(drafts: Vec<QaDraft>, order: &PrecedenceOrder) -> Vec<QaRecord> {
    let mut keyed: Vec<(PrecedenceKey, String, QaDraft)> = drafts
        .into_iter()
        .map(|d| {
            let language = normalize_identifier(&d.language);
            (order.draft_key(&d, &language), language, d)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut sequences: HashMap<(String, String, String), usize> = HashMap::new();
    keyed
        .into_iter()
        .map(|(_, language, d)| {
            let vid = verse_id(d.chapter, d.verse);
            let seq = sequences
                .entry((d.source.clone(), language.clone(), vid.clone()))
                .or_insert(0);
            *seq += 1;
            QaRecord {
                qid: qid(&d.source, &language, &vid, *seq),
                source: d.source,
                chapter: d.chapter,
                verse: d.verse,
                verse_id: vid,
                question: d.question,
                answer: d.answer,
                language,
                orig_id: d.orig_id,
                authority: d.authority,
                metadata: d.metadata,
                ordinal: d.ordinal,
            }
        })
        .collect()
}

/// Hands out `cluster_id`s in the order clusters are produced.
#[derive(Debug, Clone)]
pub struct ClusterIdAllocator {
    next: u64,
}

impl Default for ClusterIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl ClusterIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
