//! Core data models used throughout scripture-canon.
//!
//! These types represent the records that flow through the pipeline:
//! raw source records, the per-source intermediate shapes produced by
//! adapters, and the canonical records written to disk.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Stable numeric identity of an author. Never reassigned once emitted.
pub type AuthorId = u32;

/// Raw item produced by reading a source snapshot, before adaptation.
///
/// Never persisted; only its JSON form survives, inside a rejection
/// entry, when the record cannot be adapted.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Source tag of the snapshot this record came from (e.g. `K1`).
    pub source: String,
    /// Human-readable position, `<file>:<line>`.
    pub location: String,
    /// Position of the record within its source, used for precedence.
    pub ordinal: usize,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    /// Returns the first present, non-null field among `keys`.
    pub fn get_any(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|k| self.fields.get(*k))
            .find(|v| !v.is_null())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Join key for verse merging: `(scripture, chapter, verse)`.
///
/// Ordering is by scripture, then chapter, then verse number, which is
/// also the order canonical verses are written in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerseKey {
    pub scripture: String,
    pub chapter: u32,
    pub verse: u32,
}

impl VerseKey {
    pub fn new(scripture: impl Into<String>, chapter: u32, verse: u32) -> Self {
        Self {
            scripture: scripture.into(),
            chapter,
            verse,
        }
    }

    pub fn verse_id(&self) -> String {
        crate::ids::verse_id(self.chapter, self.verse)
    }
}

/// One translation as supplied by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    pub language: String,
    /// Translator name exactly as the source spells it, if any.
    pub author_name: Option<String>,
    pub text: String,
}

/// One commentary as supplied by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentaryUnit {
    pub author_name: Option<String>,
    pub language: String,
    pub text: String,
}

/// Per-source, per-verse intermediate record produced by a verse adapter.
#[derive(Debug, Clone)]
pub struct VerseUnit {
    pub scripture: String,
    pub chapter: u32,
    pub verse: u32,
    pub sanskrit: Option<String>,
    pub transliteration: Option<String>,
    pub translations: Vec<TranslationUnit>,
    pub commentaries: Vec<CommentaryUnit>,
    /// Word-by-word glosses, kept in whatever shape the source uses.
    pub word_meanings: Vec<Value>,
    pub source_tag: String,
    /// Position within the source; ties in source priority are broken by it.
    pub ordinal: usize,
    pub location: String,
}

impl VerseUnit {
    pub fn key(&self) -> VerseKey {
        VerseKey::new(self.scripture.clone(), self.chapter, self.verse)
    }
}

/// A translation attached to a canonical verse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationEntry {
    pub language: String,
    pub author_id: Option<AuthorId>,
    pub text: String,
    pub source: String,
    /// Other sources that supplied this exact `(author, language, text)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_sources: Vec<String>,
}

/// A commentary attached to a canonical verse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentaryEntry {
    pub author_id: Option<AuthorId>,
    pub language: String,
    pub text: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_sources: Vec<String>,
}

/// One source's spelling of the verse text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextVariant {
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordMeaning {
    pub source: String,
    pub value: Value,
}

/// Canonical merged verse. Exactly one exists per [`VerseKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterVerseRecord {
    pub verse_id: String,
    pub scripture: String,
    pub chapter: u32,
    pub verse: u32,
    pub sanskrit: Option<String>,
    pub transliteration: Option<String>,
    pub translations: Vec<TranslationEntry>,
    pub commentaries: Vec<CommentaryEntry>,
    /// Every distinct normalized Sanskrit text, in source precedence
    /// order. The first entry is the one chosen for `sanskrit`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sanskrit_variants: Vec<TextVariant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transliteration_variants: Vec<TextVariant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub word_meanings: Vec<WordMeaning>,
    /// Serialized as a sorted list.
    pub sources: BTreeSet<String>,
}

/// Role an author plays for a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    Translation,
    Commentary,
}

/// Persistent author registry entry, one per line in `authors.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorEntry {
    pub author_id: AuthorId,
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<AuthorRole>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
}

/// Question/answer pair as produced by a Q&A adapter, before a `qid`
/// has been assigned.
#[derive(Debug, Clone)]
pub struct QaDraft {
    pub source: String,
    pub language: String,
    pub chapter: u32,
    pub verse: u32,
    pub question: String,
    pub answer: String,
    /// The source's own id for the record (`qid` or `id`), if it has one.
    pub orig_id: Option<String>,
    pub authority: Option<String>,
    /// Source fields the adapter did not consume.
    pub metadata: Map<String, Value>,
    pub ordinal: usize,
    pub location: String,
}

/// Canonical Q&A record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRecord {
    pub qid: String,
    pub source: String,
    pub chapter: u32,
    pub verse: u32,
    pub verse_id: String,
    pub question: String,
    pub answer: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    pub ordinal: usize,
}

/// One group of near-duplicate questions within a single verse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: u64,
    /// In precedence order; the first member is the representative.
    pub member_qids: Vec<String>,
    #[serde(default)]
    pub member_count: usize,
    pub representative_qid: String,
    pub representative_question: String,
    pub representative_answer: String,
    pub chapter: u32,
    pub verse_id: String,
    pub sources: BTreeSet<String>,
    /// Set when the bucket could not be embedded and passed through as
    /// singletons.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unclustered: bool,
}

/// Per-chapter summary derived from the master verse set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub scripture: String,
    pub chapter: u32,
    pub master_verse_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sources_serialize_sorted() {
        let record = MasterVerseRecord {
            verse_id: "1.1".to_string(),
            scripture: "bhagavad_gita".to_string(),
            chapter: 1,
            verse: 1,
            sanskrit: None,
            transliteration: None,
            translations: vec![],
            commentaries: vec![],
            sanskrit_variants: vec![],
            transliteration_variants: vec![],
            word_meanings: vec![],
            sources: ["K1", "GH3", "HF2"].iter().map(|s| s.to_string()).collect(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["sources"], json!(["GH3", "HF2", "K1"]));
        assert!(v.get("sanskrit_variants").is_none());
        assert!(v.get("word_meanings").is_none());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let entry = CommentaryEntry {
            author_id: None,
            language: "en".to_string(),
            text: "x".to_string(),
            source: "K1".to_string(),
            also_sources: vec![],
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert!(v.get("also_sources").is_none());
        assert_eq!(v["author_id"], Value::Null);

        let cluster = ClusterRecord {
            cluster_id: 1,
            member_qids: vec!["HF1-en-2.47-001".to_string()],
            member_count: 1,
            representative_qid: "HF1-en-2.47-001".to_string(),
            representative_question: "q".to_string(),
            representative_answer: "a".to_string(),
            chapter: 2,
            verse_id: "2.47".to_string(),
            sources: BTreeSet::from(["HF1".to_string()]),
            unclustered: false,
        };
        let v = serde_json::to_value(&cluster).unwrap();
        assert!(v.get("unclustered").is_none());
        assert_eq!(v["member_count"], 1);
    }

    #[test]
    fn test_qa_record_provenance_fields() {
        let bare: QaRecord = serde_json::from_value(json!({
            "qid": "K3-en-2.47-001", "source": "K3", "chapter": 2, "verse": 47,
            "verse_id": "2.47", "question": "q", "answer": "a", "language": "en"
        }))
        .unwrap();
        assert_eq!(bare.orig_id, None);
        assert!(bare.metadata.is_empty());
        let v = serde_json::to_value(&bare).unwrap();
        assert!(v.get("orig_id").is_none());
        assert!(v.get("authority").is_none());
        assert!(v.get("metadata").is_none());

        let mut full = bare.clone();
        full.orig_id = Some("q-17".to_string());
        full.authority = Some("generated".to_string());
        full.metadata.insert("difficulty".to_string(), json!("easy"));
        let v = serde_json::to_value(&full).unwrap();
        assert_eq!(v["orig_id"], "q-17");
        assert_eq!(v["authority"], "generated");
        assert_eq!(v["metadata"], json!({"difficulty": "easy"}));
    }

    #[test]
    fn test_raw_record_get_any_skips_null() {
        let mut fields = Map::new();
        fields.insert("question".to_string(), Value::Null);
        fields.insert("prompt".to_string(), json!("Why act?"));
        let raw = RawRecord {
            source: "HF1".to_string(),
            location: "hf1.jsonl:1".to_string(),
            ordinal: 0,
            fields,
        };
        assert_eq!(
            raw.get_any(&["question", "prompt"]),
            Some(&json!("Why act?"))
        );
    }
}
