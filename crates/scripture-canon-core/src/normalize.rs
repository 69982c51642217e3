//! Text normalizer and verse-reference parser.
//!
//! [`normalize`] is a pure, total, idempotent cleaner applied to every
//! text field before it is merged or embedded. It never fails: bytes that
//! are not valid UTF-8 and stray control characters become a visible
//! replacement character (U+FFFD) instead of raising.
//!
//! # Algorithm
//!
//! 1. Remove zero-width characters (ZWSP, ZWNJ, ZWJ, word joiner, BOM).
//! 2. Replace markup fragments (`<br>`, `<br/>`, `&nbsp;`, `&#160;`) with a
//!    space, repeating until none remain.
//! 3. Replace non-whitespace control characters with U+FFFD.
//! 4. Collapse whitespace runs to a single space and trim both ends.
//! 5. Apply Unicode canonical decomposition + recomposition (NFC).
//!
//! Steps 1–2 run before the whitespace pass and NFC runs last, so a single
//! pass already reaches a fixed point: removing a zero-width character can
//! neither form a new markup token nor leave an uncomposed sequence behind.
//!
//! Case is preserved: Sanskrit transliteration diacritics are
//! case-sensitive. Only [`normalize_identifier`] folds case.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::CanonError;

/// Visible stand-in for undecodable bytes and control characters.
pub const PLACEHOLDER: char = '\u{FFFD}';

const ZERO_WIDTH: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// Longest verse range a single reference may expand to.
const MAX_RANGE_SPAN: u32 = 100;

fn markup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*br\s*/?\s*>|&nbsp;|&#160;|&#x0*a0;").expect("markup regex is valid")
    })
}

fn chapter_verse_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*chapter\s+(\d+)\s*,?\s*verses?\s+(\d+)(?:\s*[-–]\s*(?:(\d+)\s*[.:]\s*)?(\d+))?\s*$",
        )
        .expect("chapter/verse regex is valid")
    })
}

fn dotted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:[A-Za-z]+\.?\s*)?(\d+)\s*[.:]\s*(\d+)(?:\s*[-–]\s*(?:(\d+)\s*[.:]\s*)?(\d+))?\s*$",
        )
        .expect("dotted verse regex is valid")
    })
}

fn verse_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)(?:\.0+)?(?:\s*[-–]\s*(\d+)(?:\.0+)?)?\s*$")
            .expect("verse regex is valid")
    })
}

/// Clean a text field. See the module docs for the exact steps.
pub fn normalize(text: &str) -> String {
    let mut cleaned: String = text.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();

    loop {
        match markup_re().replace_all(&cleaned, " ") {
            Cow::Borrowed(_) => break,
            Cow::Owned(next) => cleaned = next,
        }
    }

    let mut out = String::with_capacity(cleaned.len());
    let mut pending_space = false;
    for c in cleaned.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(if c.is_control() { PLACEHOLDER } else { c });
    }

    out.nfc().collect()
}

/// Decode bytes lossily (invalid sequences become U+FFFD), then [`normalize`].
pub fn normalize_bytes(bytes: &[u8]) -> String {
    normalize(&String::from_utf8_lossy(bytes))
}

/// [`normalize`] plus case folding, for internally generated identifiers.
pub fn normalize_identifier(text: &str) -> String {
    normalize(text).to_lowercase().nfc().collect()
}

/// Case- and diacritic-insensitive key used for alias matching.
///
/// `"Śrī Rāmānuja"` and `"sri ramanuja"` fold to the same key; nothing
/// else (punctuation, honorifics, spelling) is forgiven.
pub fn fold_key(text: &str) -> String {
    normalize(text)
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Map language names to short codes (`english` → `en`).
pub fn normalize_language(lang: &str) -> String {
    let l = normalize(lang).to_lowercase();
    match l.as_str() {
        "english" | "en" | "eng" => "en".to_string(),
        "hindi" | "hi" | "hin" => "hi".to_string(),
        "sanskrit" | "sa" | "san" | "sanskrit (devanagari)" => "sa".to_string(),
        _ => l,
    }
}

/// Whether a source value is a stand-in for "no text".
pub fn is_placeholder_text(text: &str) -> bool {
    let l = text.trim().to_lowercase();
    matches!(l.as_str(), "" | "not available" | "na" | "n/a" | "none" | "nan" | "null")
}

/// A single resolved `(chapter, verse)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerseRef {
    pub chapter: u32,
    pub verse: u32,
}

impl VerseRef {
    pub fn verse_id(&self) -> String {
        crate::ids::verse_id(self.chapter, self.verse)
    }
}

/// Parse a combined verse expression into one [`VerseRef`] per verse.
///
/// Accepted forms: `"1.1"`, `"1:1"`, `"1.10-12"`, `"BG 2.47"`,
/// `"Chapter 1, Verse 4-6"`. A range expands to every verse in it.
///
/// # Errors
///
/// [`CanonError::VerseIdentityAmbiguous`] for unparsable input, zero
/// chapter/verse numbers, reversed ranges, and ranges crossing chapters.
pub fn parse_verse_ref(expr: &str) -> Result<Vec<VerseRef>, CanonError> {
    let caps = chapter_verse_re()
        .captures(expr)
        .or_else(|| dotted_re().captures(expr))
        .ok_or_else(|| CanonError::ambiguous(expr, "unrecognized verse reference"))?;

    let chapter = parse_number(expr, caps.get(1).map(|m| m.as_str()))?;
    let start = parse_number(expr, caps.get(2).map(|m| m.as_str()))?;
    if let Some(end_chapter) = caps.get(3) {
        let end_chapter = parse_number(expr, Some(end_chapter.as_str()))?;
        if end_chapter != chapter {
            return Err(CanonError::ambiguous(expr, "range crosses chapters"));
        }
    }
    let end = match caps.get(4) {
        Some(m) => parse_number(expr, Some(m.as_str()))?,
        None => start,
    };

    expand_range(expr, chapter, start, end)
}

/// Parse split chapter and verse fields. The verse may be a range
/// (`"4-6"`); spreadsheet-style floats (`"2.0"`) are accepted.
pub fn parse_chapter_verse(chapter: &str, verse: &str) -> Result<Vec<VerseRef>, CanonError> {
    let expr = format!("{}.{}", chapter.trim(), verse.trim());
    let chapter = parse_chapter_in(&expr, chapter)?;

    let verse_caps = verse_only_re()
        .captures(verse)
        .ok_or_else(|| CanonError::ambiguous(&expr, "verse is not an integer or range"))?;
    let start = parse_number(&expr, verse_caps.get(1).map(|m| m.as_str()))?;
    let end = match verse_caps.get(2) {
        Some(m) => parse_number(&expr, Some(m.as_str()))?,
        None => start,
    };

    expand_range(&expr, chapter, start, end)
}

/// Parse a standalone chapter field (`"2"`, `"2.0"`).
pub fn parse_chapter(chapter: &str) -> Result<u32, CanonError> {
    parse_chapter_in(chapter.trim(), chapter)
}

fn parse_chapter_in(expr: &str, chapter: &str) -> Result<u32, CanonError> {
    let caps = verse_only_re()
        .captures(chapter)
        .filter(|c| c.get(2).is_none())
        .ok_or_else(|| CanonError::ambiguous(expr, "chapter is not a single integer"))?;
    parse_number(expr, caps.get(1).map(|m| m.as_str()))
}

fn parse_number(expr: &str, digits: Option<&str>) -> Result<u32, CanonError> {
    digits
        .ok_or_else(|| CanonError::ambiguous(expr, "missing number"))?
        .parse::<u32>()
        .map_err(|e| CanonError::ambiguous(expr, e.to_string()))
}

fn expand_range(expr: &str, chapter: u32, start: u32, end: u32) -> Result<Vec<VerseRef>, CanonError> {
    if chapter == 0 {
        return Err(CanonError::ambiguous(expr, "chapter is zero"));
    }
    if start == 0 {
        return Err(CanonError::ambiguous(expr, "verse is zero"));
    }
    if end < start {
        return Err(CanonError::ambiguous(expr, "range end precedes start"));
    }
    if end - start >= MAX_RANGE_SPAN {
        return Err(CanonError::ambiguous(expr, "range is implausibly long"));
    }
    Ok((start..=end).map(|verse| VerseRef { chapter, verse }).collect())
}

/// Distribute a range's shared text across `count` verses.
///
/// When the source declares a delimiter and the text splits into exactly
/// `count` parts, each verse gets its own part. Otherwise every verse
/// receives the whole text.
pub fn split_range_text(text: &str, count: usize, delimiter: Option<&str>) -> Vec<String> {
    if count <= 1 {
        return vec![text.to_string()];
    }
    if let Some(d) = delimiter.filter(|d| !d.is_empty()) {
        let parts: Vec<String> = text.split(d).map(normalize).collect();
        if parts.len() == count {
            return parts;
        }
    }
    vec![text.to_string(); count]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collapses_and_trims_whitespace() {
        assert_eq!(normalize("  karmaṇy   evādhikāras\n\tte  "), "karmaṇy evādhikāras te");
    }

    #[test]
    fn test_strips_markup() {
        assert_eq!(normalize("line one<br/>line two&nbsp;end"), "line one line two end");
        assert_eq!(normalize("a <BR > b"), "a b");
        assert_eq!(normalize("<br<br>>"), "");
    }

    #[test]
    fn test_removes_zero_width() {
        assert_eq!(normalize("\u{200B}dharma\u{200D}kṣetre\u{FEFF}"), "dharmakṣetre");
    }

    #[test]
    fn test_composes_canonically() {
        // "e" + combining acute → "é"
        assert_eq!(normalize("e\u{0301}"), "\u{00E9}");
        // a zero-width char between base and mark must not block composition
        assert_eq!(normalize("e\u{200B}\u{0301}"), "\u{00E9}");
    }

    #[test]
    fn test_preserves_case() {
        assert_eq!(normalize("Śrī Kṛṣṇa"), "Śrī Kṛṣṇa");
        assert_eq!(normalize_identifier("Śrī Kṛṣṇa"), "śrī kṛṣṇa");
    }

    #[test]
    fn test_invalid_bytes_become_placeholder() {
        let s = normalize_bytes(b"ok \xff\xfe done");
        assert!(s.contains(PLACEHOLDER));
        assert!(s.starts_with("ok "));
        assert_eq!(normalize("a\u{0007}b"), "a\u{FFFD}b");
    }

    #[test]
    fn test_fold_key_ignores_case_and_diacritics() {
        assert_eq!(fold_key("Śrī Rāmānuja"), fold_key("sri  RAMANUJA"));
        assert_ne!(fold_key("Sri Ramanuja"), fold_key("Ramanuja"));
    }

    #[test]
    fn test_language_codes() {
        assert_eq!(normalize_language("English"), "en");
        assert_eq!(normalize_language(" hindi "), "hi");
        assert_eq!(normalize_language("Sanskrit (Devanagari)"), "sa");
        assert_eq!(normalize_language("Telugu"), "telugu");
    }

    #[test]
    fn test_placeholder_text() {
        assert!(is_placeholder_text("Not available"));
        assert!(is_placeholder_text("  "));
        assert!(!is_placeholder_text("Not available in the original"));
    }

    #[test]
    fn test_parse_single_refs() {
        let one = vec![VerseRef { chapter: 1, verse: 1 }];
        assert_eq!(parse_verse_ref("1.1").unwrap(), one);
        assert_eq!(parse_verse_ref("1:1").unwrap(), one);
        assert_eq!(parse_verse_ref("BG 1.1").unwrap(), one);
        assert_eq!(parse_verse_ref("Chapter 1, Verse 1").unwrap(), one);
    }

    #[test]
    fn test_parse_ranges() {
        let refs = parse_verse_ref("1.10-12").unwrap();
        let ids: Vec<String> = refs.iter().map(|r| r.verse_id()).collect();
        assert_eq!(ids, vec!["1.10", "1.11", "1.12"]);

        let refs = parse_verse_ref("Chapter 1, Verse 4-6").unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2], VerseRef { chapter: 1, verse: 6 });

        assert_eq!(parse_verse_ref("2.3-2.4").unwrap().len(), 2);
    }

    #[test]
    fn test_parse_rejects_ambiguous() {
        for bad in ["", "1", "1.x", "0.1", "1.0", "1.12-10", "1.47-2.1", "1.1-500", "one.two"] {
            let err = parse_verse_ref(bad).unwrap_err();
            assert!(
                matches!(err, CanonError::VerseIdentityAmbiguous { .. }),
                "expected ambiguity for {:?}, got {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_parse_split_fields() {
        assert_eq!(
            parse_chapter_verse("2", "47").unwrap(),
            vec![VerseRef { chapter: 2, verse: 47 }]
        );
        assert_eq!(parse_chapter_verse("2.0", "47.0").unwrap()[0].verse, 47);
        assert_eq!(parse_chapter_verse("1", "4-6").unwrap().len(), 3);
        assert!(parse_chapter_verse("1-2", "4").is_err());
        assert!(parse_chapter_verse("", "4").is_err());
        assert_eq!(parse_chapter("2.0").unwrap(), 2);
        assert_eq!(parse_chapter(" 18 ").unwrap(), 18);
        assert!(parse_chapter("one").is_err());
    }

    #[test]
    fn test_split_range_text() {
        assert_eq!(
            split_range_text("first || second || third", 3, Some("||")),
            vec!["first", "second", "third"]
        );
        // wrong part count falls back to duplication
        assert_eq!(split_range_text("a || b", 3, Some("||")), vec!["a || b"; 3]);
        assert_eq!(split_range_text("shared", 2, None), vec!["shared", "shared"]);
        assert_eq!(split_range_text("solo", 1, Some("||")), vec!["solo"]);
    }

    fn messy_text() -> impl Strategy<Value = String> {
        let piece = prop_oneof![
            Just("<br>".to_string()),
            Just("<br/>".to_string()),
            Just("&nbsp;".to_string()),
            Just("&#160;".to_string()),
            Just("\u{200B}".to_string()),
            Just("\u{200D}".to_string()),
            Just("\u{FEFF}".to_string()),
            Just("\u{0301}".to_string()),
            Just("  \t\n".to_string()),
            Just("<".to_string()),
            Just("&nb".to_string()),
            Just("sp;".to_string()),
            "[a-zA-Z ]{0,6}",
            "[\u{0900}-\u{097F}]{0,4}",
            any::<char>().prop_map(|c| c.to_string()),
        ];
        prop::collection::vec(piece, 0..24).prop_map(|v| v.concat())
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(s in messy_text()) {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn prop_normalize_has_no_outer_or_double_spaces(s in messy_text()) {
            let n = normalize(&s);
            prop_assert_eq!(n.trim(), n.as_str());
            prop_assert!(!n.contains("  "));
            prop_assert!(!n.contains('\u{200B}'), "zero-width character survived");
        }
    }
}
