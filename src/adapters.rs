//! Source adapters: raw records to intermediate units.
//!
//! Every configured source gets one adapter. A verse adapter turns a raw
//! record into zero or more [`VerseUnit`]s (a range record expands to one
//! unit per verse); a Q&A adapter turns it into [`QaDraft`]s. Adapters
//! never see the merger or the registry, and a record they cannot handle
//! comes back as a [`Rejection`] carrying the raw JSON.
//!
//! # Field lookup
//!
//! Sources spell the same field many ways (`chapter`, `chapter_no`,
//! `Chapter`, ...). Each logical field has a list of candidate names
//! tried in order. A `[sources.fields]` override maps a logical field to
//! the exact raw name and is tried before the candidates:
//!
//! ```toml
//! [[sources]]
//! tag = "K2"
//! kind = "verses"
//! path = "./data/k2"
//! fields = { sanskrit = "Shloka", chapter = "Chapter" }
//! ```
//!
//! # Translation shapes
//!
//! | Shape | Example |
//! |-------|---------|
//! | list of objects | `[{"language": "en", "author": "Sivananda", "text": "..."}]` |
//! | language map | `{"en": "...", "hi": "..."}` |
//! | nested map | `{"en": [{"author": "Sivananda", "text": "..."}]}` |
//! | flat columns | `translation_in_english`, `translation_in_hindi` |
//!
//! Commentaries accept the same shapes. Placeholder values such as
//! `"not available"` or `"nan"` are dropped.
//!
//! # Q&A provenance
//!
//! A Q&A draft keeps the source's own id (`qid` or `id`) as `orig_id`
//! and an `authority` label taken from the record, else the source's
//! `authority` setting, else the built-in default for HF1 and K3. Every
//! field the adapter did not read is kept in `metadata`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use scripture_canon_core::models::{
    CommentaryUnit, QaDraft, RawRecord, TranslationUnit, VerseUnit,
};
use scripture_canon_core::normalize::{
    is_placeholder_text, normalize, normalize_language, parse_chapter, parse_chapter_verse,
    parse_verse_ref, split_range_text, VerseRef,
};
use scripture_canon_core::{CanonError, Rejection};

use crate::config::{Config, SourceConfig, SourceKind};

const VERSE_REF_FIELDS: &[&str] = &["verse_id", "verse_ref", "reference", "ref"];
const CHAPTER_FIELDS: &[&str] = &[
    "chapter",
    "chapter_no",
    "chapter_number",
    "chapterNumber",
    "chapter_id",
    "Chapter",
    "ch",
];
const VERSE_FIELDS: &[&str] = &[
    "verse",
    "verse_no",
    "verse_number",
    "verseNumber",
    "Verse",
    "slok_number",
    "verse_source",
];
const SANSKRIT_FIELDS: &[&str] = &[
    "sanskrit",
    "verse_in_sanskrit",
    "Shloka",
    "slok",
    "original_text",
];
const TRANSLITERATION_FIELDS: &[&str] = &[
    "transliteration",
    "sanskrit_verse_transliteration",
    "transliteration_text",
    "Transliteration",
];
const WORD_MEANINGS_FIELDS: &[&str] = &["word_meanings", "word_meaning", "wordMeanings"];
const TRANSLATIONS_FIELDS: &[&str] = &["translations", "translation"];
const COMMENTARIES_FIELDS: &[&str] = &["commentaries", "commentary"];
const LANGUAGE_FIELDS: &[&str] = &["language", "lang", "language_id"];
const AUTHOR_FIELDS: &[&str] = &["author", "author_name", "authorName", "translator", "name"];
const TEXT_FIELDS: &[&str] = &["text", "description", "translation", "commentary", "content"];
const QUESTION_FIELDS: &[&str] = &["question", "Question", "generated_question", "prompt"];
const ANSWER_FIELDS: &[&str] = &[
    "answer",
    "Answer",
    "generated_answer",
    "generated_explanation",
];
const ORIG_ID_FIELDS: &[&str] = &["qid", "id"];
const AUTHORITY_FIELDS: &[&str] = &["authority", "cred"];
/// Keys that describe the record's origin and are replaced by the run's
/// own values rather than kept as metadata.
const QA_ENVELOPE_FIELDS: &[&str] = &["source"];

/// Authority for Q&A sources that neither the record nor the config labels.
const DEFAULT_AUTHORITIES: &[(&str, &str)] = &[("HF1", "secondary"), ("K3", "generated")];

/// Single-language translation columns found in flat spreadsheet exports.
const FLAT_TRANSLATIONS: &[(&str, &str)] = &[
    ("translation_in_english", "en"),
    ("english_translation", "en"),
    ("english", "en"),
    ("translation_in_hindi", "hi"),
    ("hindi_translation", "hi"),
    ("hindi", "hi"),
];

/// Single-language commentary columns.
const FLAT_COMMENTARIES: &[(&str, &str)] = &[
    ("meaning_in_english", "en"),
    ("english_commentary", "en"),
    ("meaning_in_hindi", "hi"),
    ("hindi_commentary", "hi"),
];

const FALLBACK_LANGUAGE: &str = "en";

/// What an adapter produced from one raw record.
#[derive(Debug, Clone)]
pub enum Adapted {
    Verses(Vec<VerseUnit>),
    Qa(Vec<QaDraft>),
}

impl Adapted {
    pub fn len(&self) -> usize {
        match self {
            Adapted::Verses(units) => units.len(),
            Adapted::Qa(drafts) => drafts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps a source's raw records into the common intermediate shape.
///
/// Implementations must be pure per record so the pipeline can adapt
/// records in parallel and still get the same output.
pub trait SourceAdapter: Send + Sync {
    /// Source tag (e.g. `"K1"`), copied into every unit produced.
    fn tag(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn adapt(&self, raw: &RawRecord) -> Result<Adapted, Rejection>;
}

/// Field-name overrides for one source.
#[derive(Debug, Clone, Default)]
struct FieldMap {
    overrides: BTreeMap<String, String>,
}

impl FieldMap {
    fn get<'a>(&self, raw: &'a RawRecord, logical: &str, candidates: &[&str]) -> Option<&'a Value> {
        if let Some(name) = self.overrides.get(logical) {
            if let Some(v) = raw.fields.get(name).filter(|v| !v.is_null()) {
                return Some(v);
            }
        }
        raw.get_any(candidates)
    }

    fn text(&self, raw: &RawRecord, logical: &str, candidates: &[&str]) -> Option<String> {
        self.get(raw, logical, candidates).and_then(scalar_text)
    }
}

/// Adapter for scripture verse sources (K1, K2, HF2, HF3, GH2, GH3).
#[derive(Debug, Clone)]
pub struct VerseAdapter {
    tag: String,
    scripture: String,
    language: String,
    range_delimiter: Option<String>,
    fields: FieldMap,
}

impl VerseAdapter {
    pub fn new(source: &SourceConfig, scripture: &str) -> Self {
        Self {
            tag: source.tag.clone(),
            scripture: scripture.to_string(),
            language: source
                .language
                .as_deref()
                .map(normalize_language)
                .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string()),
            range_delimiter: source.range_delimiter.clone(),
            fields: FieldMap {
                overrides: source.fields.clone(),
            },
        }
    }

    fn translations(&self, raw: &RawRecord) -> Vec<TranslationUnit> {
        let mut out = Vec::new();
        if let Some(value) = self.fields.get(raw, "translations", TRANSLATIONS_FIELDS) {
            for (language, author_name, text) in texts_from_value(value, &self.language) {
                out.push(TranslationUnit {
                    language,
                    author_name,
                    text,
                });
            }
        }
        let author = self.fields.text(raw, "translation_author", &["translator"]);
        for (column, language) in FLAT_TRANSLATIONS {
            if let Some(text) = raw.fields.get(*column).and_then(scalar_text) {
                out.push(TranslationUnit {
                    language: language.to_string(),
                    author_name: author.clone(),
                    text,
                });
            }
        }
        out
    }

    fn commentaries(&self, raw: &RawRecord) -> Vec<CommentaryUnit> {
        let mut out = Vec::new();
        if let Some(value) = self.fields.get(raw, "commentaries", COMMENTARIES_FIELDS) {
            for (language, author_name, text) in texts_from_value(value, &self.language) {
                out.push(CommentaryUnit {
                    author_name,
                    language,
                    text,
                });
            }
        }
        let author = self.fields.text(raw, "commentary_author", &["commentator"]);
        for (column, language) in FLAT_COMMENTARIES {
            if let Some(text) = raw.fields.get(*column).and_then(scalar_text) {
                out.push(CommentaryUnit {
                    author_name: author.clone(),
                    language: language.to_string(),
                    text,
                });
            }
        }
        out
    }

    fn word_meanings(&self, raw: &RawRecord) -> Vec<Value> {
        let keep = |v: &Value| match v {
            Value::String(_) => scalar_text(v).map(|s| Value::String(normalize(&s))),
            Value::Null => None,
            other => Some(other.clone()),
        };
        match self.fields.get(raw, "word_meanings", WORD_MEANINGS_FIELDS) {
            Some(Value::Array(items)) => items.iter().filter_map(keep).collect(),
            Some(other) => keep(other).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn split(&self, text: &str, count: usize) -> Vec<String> {
        split_range_text(text, count, self.range_delimiter.as_deref())
    }
}

impl SourceAdapter for VerseAdapter {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Verses
    }

    fn adapt(&self, raw: &RawRecord) -> Result<Adapted, Rejection> {
        let refs = resolve_verse_refs(&self.fields, raw).map_err(|e| reject(&self.tag, raw, e))?;
        let count = refs.len();

        let sanskrit = self.fields.text(raw, "sanskrit", SANSKRIT_FIELDS);
        let transliteration = self
            .fields
            .text(raw, "transliteration", TRANSLITERATION_FIELDS);
        let translations = self.translations(raw);
        let commentaries = self.commentaries(raw);
        let word_meanings = self.word_meanings(raw);

        if sanskrit.is_none()
            && transliteration.is_none()
            && translations.is_empty()
            && commentaries.is_empty()
        {
            return Err(reject(
                &self.tag,
                raw,
                CanonError::parse("record carries no verse text"),
            ));
        }

        let sanskrit_parts = sanskrit.map(|s| self.split(&s, count));
        let translit_parts = transliteration.map(|s| self.split(&s, count));
        let translation_parts: Vec<Vec<String>> = translations
            .iter()
            .map(|t| self.split(&t.text, count))
            .collect();
        let commentary_parts: Vec<Vec<String>> = commentaries
            .iter()
            .map(|c| self.split(&c.text, count))
            .collect();

        let units = refs
            .iter()
            .enumerate()
            .map(|(i, r)| VerseUnit {
                scripture: self.scripture.clone(),
                chapter: r.chapter,
                verse: r.verse,
                sanskrit: sanskrit_parts.as_ref().map(|p| p[i].clone()),
                transliteration: translit_parts.as_ref().map(|p| p[i].clone()),
                translations: translations
                    .iter()
                    .zip(&translation_parts)
                    .map(|(t, parts)| TranslationUnit {
                        text: parts[i].clone(),
                        ..t.clone()
                    })
                    .collect(),
                commentaries: commentaries
                    .iter()
                    .zip(&commentary_parts)
                    .map(|(c, parts)| CommentaryUnit {
                        text: parts[i].clone(),
                        ..c.clone()
                    })
                    .collect(),
                // glosses cannot be split per verse; each verse of a range gets all of them
                word_meanings: word_meanings.clone(),
                source_tag: self.tag.clone(),
                ordinal: raw.ordinal,
                location: raw.location.clone(),
            })
            .collect();

        Ok(Adapted::Verses(units))
    }
}

/// Adapter for question/answer sources (HF1, K3).
#[derive(Debug, Clone)]
pub struct QaAdapter {
    tag: String,
    language: String,
    authority: Option<String>,
    fields: FieldMap,
}

impl QaAdapter {
    pub fn new(source: &SourceConfig) -> Self {
        Self {
            tag: source.tag.clone(),
            language: source
                .language
                .as_deref()
                .map(normalize_language)
                .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string()),
            authority: source.authority.clone().or_else(|| {
                DEFAULT_AUTHORITIES
                    .iter()
                    .find(|(tag, _)| *tag == source.tag)
                    .map(|(_, a)| a.to_string())
            }),
            fields: FieldMap {
                overrides: source.fields.clone(),
            },
        }
    }

    /// Fields no lookup in [`QaAdapter::adapt`] reads, minus nulls.
    fn metadata(&self, raw: &RawRecord) -> Map<String, Value> {
        let consumed = |key: &str| {
            [
                QUESTION_FIELDS,
                ANSWER_FIELDS,
                VERSE_REF_FIELDS,
                CHAPTER_FIELDS,
                VERSE_FIELDS,
                LANGUAGE_FIELDS,
                ORIG_ID_FIELDS,
                AUTHORITY_FIELDS,
                QA_ENVELOPE_FIELDS,
            ]
            .iter()
            .any(|list| list.contains(&key))
                || self.fields.overrides.values().any(|raw_key| raw_key == key)
        };
        raw.fields
            .iter()
            .filter(|(k, v)| !v.is_null() && !consumed(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl SourceAdapter for QaAdapter {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Qa
    }

    fn adapt(&self, raw: &RawRecord) -> Result<Adapted, Rejection> {
        let question = self
            .fields
            .text(raw, "question", QUESTION_FIELDS)
            .map(|q| normalize(&q))
            .ok_or_else(|| reject(&self.tag, raw, CanonError::parse("missing question")))?;
        let answer = self
            .fields
            .text(raw, "answer", ANSWER_FIELDS)
            .map(|a| normalize(&a))
            .ok_or_else(|| reject(&self.tag, raw, CanonError::parse("missing answer")))?;

        let refs = resolve_verse_refs(&self.fields, raw).map_err(|e| reject(&self.tag, raw, e))?;
        // A question is about one verse; a range cannot be pinned to a bucket.
        let verse_ref = match refs.as_slice() {
            [single] => *single,
            _ => {
                let expr = format!(
                    "{}-{}",
                    refs.first().map(|r| r.verse_id()).unwrap_or_default(),
                    refs.last().map(|r| r.verse).unwrap_or_default()
                );
                return Err(reject(
                    &self.tag,
                    raw,
                    CanonError::ambiguous(expr, "question refers to a verse range"),
                ));
            }
        };

        let language = self
            .fields
            .text(raw, "language", LANGUAGE_FIELDS)
            .map(|l| normalize_language(&l))
            .unwrap_or_else(|| self.language.clone());

        Ok(Adapted::Qa(vec![QaDraft {
            source: self.tag.clone(),
            language,
            chapter: verse_ref.chapter,
            verse: verse_ref.verse,
            question,
            answer,
            orig_id: self.fields.text(raw, "orig_id", ORIG_ID_FIELDS),
            authority: self
                .fields
                .text(raw, "authority", AUTHORITY_FIELDS)
                .or_else(|| self.authority.clone()),
            metadata: self.metadata(raw),
            ordinal: raw.ordinal,
            location: raw.location.clone(),
        }]))
    }
}

/// All adapters for a run, one per configured source.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Build the built-in adapter for every `[[sources]]` entry.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for source in &config.sources {
            match source.kind {
                SourceKind::Verses => registry.register(Box::new(VerseAdapter::new(
                    source,
                    &config.merge.scripture,
                ))),
                SourceKind::Qa => registry.register(Box::new(QaAdapter::new(source))),
            }
        }
        registry
    }

    /// Register an adapter. A later adapter with the same tag shadows an
    /// earlier one.
    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.retain(|a| a.tag() != adapter.tag());
        self.adapters.push(adapter);
    }

    pub fn find(&self, tag: &str) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.tag() == tag)
            .map(|a| a.as_ref())
    }

    pub fn adapters(&self) -> &[Box<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn reject(tag: &str, raw: &RawRecord, error: CanonError) -> Rejection {
    Rejection::new(&error, tag, raw.location.clone(), Some(raw.to_value()))
}

/// Resolve the verse(s) a record refers to.
///
/// A combined reference field wins; otherwise split chapter/verse fields
/// are used, and a verse field alone is read as a combined expression.
fn resolve_verse_refs(fields: &FieldMap, raw: &RawRecord) -> Result<Vec<VerseRef>, CanonError> {
    if let Some(expr) = fields.text(raw, "verse_ref", VERSE_REF_FIELDS) {
        return parse_verse_ref(&expr);
    }
    let chapter = fields.text(raw, "chapter", CHAPTER_FIELDS);
    let verse = fields.text(raw, "verse", VERSE_FIELDS);
    match (chapter, verse) {
        (Some(c), Some(v)) if looks_combined(&v) => {
            let refs = parse_verse_ref(&v)?;
            let chapter = parse_chapter(&c)?;
            if refs.iter().any(|r| r.chapter != chapter) {
                return Err(CanonError::ambiguous(
                    format!("{} / {}", c, v),
                    "chapter field disagrees with verse reference",
                ));
            }
            Ok(refs)
        }
        (Some(c), Some(v)) => parse_chapter_verse(&c, &v),
        (None, Some(v)) => parse_verse_ref(&v),
        (Some(_), None) | (None, None) => Err(CanonError::parse("missing chapter/verse reference")),
    }
}

/// `"2.47"`, `"2:47"` or `"BG 2.47"` in a verse field, as opposed to `"47"`
/// or a spreadsheet float such as `"47.0"`.
fn looks_combined(verse: &str) -> bool {
    let v = verse.trim();
    if v.contains(':') || v.chars().any(|c| c.is_alphabetic()) {
        return true;
    }
    match v.split_once('.') {
        Some((_, frac)) => !frac.chars().all(|c| c == '0'),
        None => false,
    }
}

/// String or number form of a scalar field; placeholders become `None`.
fn scalar_text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if is_placeholder_text(&s) {
        None
    } else {
        Some(s)
    }
}

/// Flatten any supported translation/commentary shape into
/// `(language, author, text)` triples.
fn texts_from_value(value: &Value, default_language: &str) -> Vec<(String, Option<String>, String)> {
    let mut out = Vec::new();
    match value {
        Value::String(_) => {
            if let Some(text) = scalar_text(value) {
                out.push((default_language.to_string(), None, text));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_item(item, default_language, &mut out);
            }
        }
        Value::Object(map) if looks_like_entry(map) => {
            collect_item(value, default_language, &mut out);
        }
        Value::Object(map) => {
            for (language, inner) in map {
                let language = normalize_language(language);
                match inner {
                    Value::Array(items) => {
                        for item in items {
                            collect_item(item, &language, &mut out);
                        }
                    }
                    other => collect_item(other, &language, &mut out),
                }
            }
        }
        _ => {}
    }
    out
}

fn looks_like_entry(map: &Map<String, Value>) -> bool {
    TEXT_FIELDS.iter().any(|k| map.get(*k).is_some_and(Value::is_string))
}

fn collect_item(item: &Value, language: &str, out: &mut Vec<(String, Option<String>, String)>) {
    match item {
        Value::String(_) => {
            if let Some(text) = scalar_text(item) {
                out.push((language.to_string(), None, text));
            }
        }
        Value::Object(map) => {
            let text = TEXT_FIELDS
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(scalar_text);
            let Some(text) = text else {
                return;
            };
            let language = LANGUAGE_FIELDS
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(scalar_text)
                .map(|l| normalize_language(&l))
                .unwrap_or_else(|| language.to_string());
            let author = AUTHOR_FIELDS
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(scalar_text);
            out.push((language, author, text));
        }
        _ => {}
    }
}
