//! Verse merger: many per-source [`VerseUnit`]s in, one
//! [`MasterVerseRecord`] per `(scripture, chapter, verse)` out.
//!
//! # Algorithm
//!
//! 1. Reject units with a zero chapter or verse (`VerseIdentityAmbiguous`)
//!    or an empty scripture (`ParseFailure`). Rejected units never reach
//!    a group.
//! 2. Sort the rest by `(source priority rank, source tag, ordinal)`. This
//!    fold order makes the result independent of how adapters were
//!    scheduled.
//! 3. Group by [`VerseKey`].
//! 4. Per group:
//!    - `sanskrit` / `transliteration`: first non-empty value in fold
//!      order. Prioritized sources come first, so the fallback to "any
//!      non-empty value" falls out of the same scan. Every distinct
//!      normalized value is also kept in `*_variants` with its source.
//!    - `word_meanings`: appended per source, exact repeats dropped.
//!    - translations and commentaries: every tuple is appended. Author
//!      names are resolved through the [`AuthorRegistry`]. An exact
//!      `(author_id, language, text)` repeat is collapsed into the first
//!      entry, whose `also_sources` records the other source tags.
//!    - `sources`: union of every contributing unit's tag.
//!
//! Only [`CanonError::AuthorAliasConflict`] aborts a merge.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::{CanonError, Rejection};
use crate::models::{
    AuthorId, AuthorRole, ChapterSummary, CommentaryEntry, MasterVerseRecord, TextVariant,
    TranslationEntry, VerseKey, VerseUnit, WordMeaning,
};
use crate::normalize::{normalize, normalize_language};
use crate::registry::AuthorRegistry;

/// Explicit source precedence for verse fields.
///
/// Dedicated scripture sources come before Q&A-oriented ones. Tags not in
/// the list rank after all listed tags, alphabetically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority {
    order: Vec<String>,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self::new(["GH3", "GH2", "HF2", "K2", "K1", "HF3"])
    }
}

impl SourcePriority {
    pub fn new<I>(order: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }

    pub fn rank(&self, tag: &str) -> usize {
        self.order.iter().position(|t| t == tag).unwrap_or(self.order.len())
    }

    pub fn tags(&self) -> &[String] {
        &self.order
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub verses: BTreeMap<VerseKey, MasterVerseRecord>,
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Clone, Default)]
pub struct VerseMerger {
    priority: SourcePriority,
}

type DedupKey = (Option<AuthorId>, String, String);

impl VerseMerger {
    pub fn new(priority: SourcePriority) -> Self {
        Self { priority }
    }

    pub fn merge(
        &self,
        units: Vec<VerseUnit>,
        registry: &mut AuthorRegistry,
    ) -> Result<MergeOutcome, CanonError> {
        let mut outcome = MergeOutcome::default();

        let mut accepted = Vec::with_capacity(units.len());
        for unit in units {
            match validate(&unit) {
                Ok(()) => accepted.push(unit),
                Err(err) => {
                    debug!(source = %unit.source_tag, location = %unit.location, "verse unit rejected: {}", err);
                    let raw = json!({
                        "scripture": unit.scripture,
                        "chapter": unit.chapter,
                        "verse": unit.verse,
                    });
                    outcome
                        .rejections
                        .push(Rejection::new(&err, &unit.source_tag, &unit.location, Some(raw)));
                }
            }
        }

        accepted.sort_by(|a, b| {
            (self.priority.rank(&a.source_tag), &a.source_tag, a.ordinal).cmp(&(
                self.priority.rank(&b.source_tag),
                &b.source_tag,
                b.ordinal,
            ))
        });

        let mut groups: BTreeMap<VerseKey, Vec<VerseUnit>> = BTreeMap::new();
        for unit in accepted {
            groups.entry(unit.key()).or_default().push(unit);
        }

        for (key, group) in groups {
            let record = merge_group(&key, group, registry, &mut outcome.rejections)?;
            outcome.verses.insert(key, record);
        }
        Ok(outcome)
    }
}

fn validate(unit: &VerseUnit) -> Result<(), CanonError> {
    if unit.scripture.trim().is_empty() {
        return Err(CanonError::parse("missing scripture name"));
    }
    if unit.chapter == 0 || unit.verse == 0 {
        return Err(CanonError::ambiguous(
            format!("{}.{}", unit.chapter, unit.verse),
            "chapter and verse must be positive",
        ));
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(normalize).filter(|s| !s.is_empty())
}

/// Appends `text` unless an identical variant is already present.
fn push_variant(variants: &mut Vec<TextVariant>, text: String, source: &str) {
    if !variants.iter().any(|v| v.text == text) {
        variants.push(TextVariant {
            text,
            source: source.to_string(),
        });
    }
}

fn resolve_author(
    registry: &mut AuthorRegistry,
    name: Option<&str>,
    unit: &VerseUnit,
    rejections: &mut Vec<Rejection>,
) -> Result<Option<AuthorId>, CanonError> {
    let Some(name) = name else {
        return Ok(None);
    };
    match registry.resolve(name) {
        Ok(id) => Ok(Some(id)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            // unusable name: keep the text, drop the attribution
            rejections.push(Rejection::new(&err, &unit.source_tag, &unit.location, None));
            Ok(None)
        }
    }
}

fn merge_group(
    key: &VerseKey,
    group: Vec<VerseUnit>,
    registry: &mut AuthorRegistry,
    rejections: &mut Vec<Rejection>,
) -> Result<MasterVerseRecord, CanonError> {
    let mut record = MasterVerseRecord {
        verse_id: key.verse_id(),
        scripture: key.scripture.clone(),
        chapter: key.chapter,
        verse: key.verse,
        sanskrit: None,
        transliteration: None,
        translations: Vec::new(),
        commentaries: Vec::new(),
        sanskrit_variants: Vec::new(),
        transliteration_variants: Vec::new(),
        word_meanings: Vec::new(),
        sources: BTreeSet::new(),
    };
    let mut seen_translations: HashMap<DedupKey, usize> = HashMap::new();
    let mut seen_commentaries: HashMap<DedupKey, usize> = HashMap::new();

    for unit in &group {
        record.sources.insert(unit.source_tag.clone());
        if let Some(text) = non_empty(&unit.sanskrit) {
            push_variant(&mut record.sanskrit_variants, text, &unit.source_tag);
        }
        if let Some(text) = non_empty(&unit.transliteration) {
            push_variant(&mut record.transliteration_variants, text, &unit.source_tag);
        }
        for value in &unit.word_meanings {
            if !record.word_meanings.iter().any(|w| &w.value == value) {
                record.word_meanings.push(WordMeaning {
                    source: unit.source_tag.clone(),
                    value: value.clone(),
                });
            }
        }

        for t in &unit.translations {
            let text = normalize(&t.text);
            if text.is_empty() {
                continue;
            }
            let language = normalize_language(&t.language);
            let author_id = resolve_author(registry, t.author_name.as_deref(), unit, rejections)?;
            if let Some(id) = author_id {
                registry.record_usage(id, &language, AuthorRole::Translation, &unit.source_tag);
            }
            let dedup = (author_id, language.clone(), text.clone());
            match seen_translations.get(&dedup) {
                Some(&i) => {
                    let entry = &mut record.translations[i];
                    note_also_source(&entry.source, &mut entry.also_sources, &unit.source_tag);
                }
                None => {
                    seen_translations.insert(dedup, record.translations.len());
                    record.translations.push(TranslationEntry {
                        language,
                        author_id,
                        text,
                        source: unit.source_tag.clone(),
                        also_sources: Vec::new(),
                    });
                }
            }
        }

        for c in &unit.commentaries {
            let text = normalize(&c.text);
            if text.is_empty() {
                continue;
            }
            let language = normalize_language(&c.language);
            let author_id = resolve_author(registry, c.author_name.as_deref(), unit, rejections)?;
            if let Some(id) = author_id {
                registry.record_usage(id, &language, AuthorRole::Commentary, &unit.source_tag);
            }
            let dedup = (author_id, language.clone(), text.clone());
            match seen_commentaries.get(&dedup) {
                Some(&i) => {
                    let entry = &mut record.commentaries[i];
                    note_also_source(&entry.source, &mut entry.also_sources, &unit.source_tag);
                }
                None => {
                    seen_commentaries.insert(dedup, record.commentaries.len());
                    record.commentaries.push(CommentaryEntry {
                        author_id,
                        language,
                        text,
                        source: unit.source_tag.clone(),
                        also_sources: Vec::new(),
                    });
                }
            }
        }
    }

    record.sanskrit = record.sanskrit_variants.first().map(|v| v.text.clone());
    record.transliteration = record.transliteration_variants.first().map(|v| v.text.clone());
    Ok(record)
}

fn note_also_source(primary: &str, also: &mut Vec<String>, tag: &str) {
    if primary == tag {
        return;
    }
    if let Err(pos) = also.binary_search_by(|s| s.as_str().cmp(tag)) {
        also.insert(pos, tag.to_string());
    }
}

/// Verse counts per `(scripture, chapter)`, in key order.
pub fn chapter_summaries(verses: &BTreeMap<VerseKey, MasterVerseRecord>) -> Vec<ChapterSummary> {
    let mut counts: BTreeMap<(String, u32), usize> = BTreeMap::new();
    for key in verses.keys() {
        *counts.entry((key.scripture.clone(), key.chapter)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|((scripture, chapter), master_verse_count)| ChapterSummary {
            scripture,
            chapter,
            master_verse_count,
        })
        .collect()
}
