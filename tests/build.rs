use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use scripture_canon::config::{Config, SourceConfig, SourceKind};
use scripture_canon::embedding::{DisabledProvider, Embedder, HashProvider};
use scripture_canon::pipeline::run_build_with;
use scripture_canon::progress::NoProgress;
use scripture_canon::writer::read_jsonl;
use scripture_canon_core::RejectionKind;

const K1_LINES: &[&str] = &[
    r#"{"chapter": 1, "verse": 1, "verse_in_sanskrit": "धर्मक्षेत्रे कुरुक्षेत्रे", "translation_in_english": "On the field of dharma, the field of the Kurus.", "translation_in_hindi": "not available"}"#,
    r#"{"chapter": 1, "verse": 2, "verse_in_sanskrit": "दृष्ट्वा तु पाण्डवानीकं", "translation_in_english": "Seeing the army of the Pandavas."}"#,
    r#"{"chapter": "one", "verse": 3, "verse_in_sanskrit": "x"}"#,
    "not json at all",
];

const GH3_JSON: &str = r#"[
  {
    "chapter": 1,
    "verse": 1,
    "sanskrit": "धर्मक्षेत्रे  कुरुक्षेत्रे<br/>समवेता युयुत्सवः",
    "transliteration": "dharmakṣetre kurukṣetre",
    "translations": [
      {"language": "english", "author": "Swami Sivananda", "text": "Dhritarashtra said: What did my people do?"}
    ],
    "commentaries": [
      {"author": "Sri Ramanuja", "language": "sa", "text": "The king asks."}
    ]
  }
]"#;

const GH2_LINES: &[&str] = &[
    r#"{"verse_id": "1.1", "translations": {"en": [{"author": "Sivananda", "text": "Dhritarashtra said: What did my people do?"}]}}"#,
];

const HF1_LINES: &[&str] = &[
    r#"{"chapter_no": 2, "verse_no": 47, "question": "What is my duty according to this verse?", "answer": "To act without attachment."}"#,
    r#"{"chapter_no": 2, "verse_no": 47, "question": "Who is speaking in this verse?", "answer": "Krishna."}"#,
    r#"{"chapter_no": 2, "verse_no": 47, "question": "what is my duty according to this verse", "answer": "Act."}"#,
    r#"{"chapter_no": 1, "verse_no": "10-12", "question": "What do these verses say?", "answer": "..."}"#,
    r#"{"chapter_no": 2, "verse_no": 48, "question": "What is yoga?", "answer": "Evenness of mind."}"#,
];

const K3_LINES: &[&str] = &[
    r#"{"verse_source": "BG 2.47", "generated_question": "What is my duty according to this verse?", "generated_explanation": "Perform your duty."}"#,
    r#"{"verse_source": "BG 2.47", "generated_question": "", "generated_explanation": "orphan answer"}"#,
];

fn write_lines(path: &Path, lines: &[&str]) {
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

fn source(tag: &str, kind: SourceKind, path: PathBuf) -> SourceConfig {
    SourceConfig {
        tag: tag.to_string(),
        kind,
        path,
        include_globs: vec!["**/*.jsonl".to_string(), "**/*.json".to_string()],
        exclude_globs: vec![],
        language: None,
        range_delimiter: None,
        authority: None,
        fields: BTreeMap::new(),
    }
}

fn setup(tmp: &TempDir, k1: &[&str], hf1: &[&str]) -> Config {
    let raw = tmp.path().join("raw");
    fs::create_dir_all(&raw).unwrap();
    write_lines(&raw.join("k1.jsonl"), k1);
    fs::write(raw.join("gh3.json"), GH3_JSON).unwrap();
    write_lines(&raw.join("gh2.jsonl"), GH2_LINES);
    write_lines(&raw.join("hf1.jsonl"), hf1);
    write_lines(&raw.join("k3.jsonl"), K3_LINES);

    let aliases = tmp.path().join("aliases.toml");
    fs::write(
        &aliases,
        "[[authors]]\ncanonical = \"Swami Sivananda\"\naliases = [\"Sivananda\"]\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.output.dir = tmp.path().join("out");
    config.registry.aliases = Some(aliases);
    config.sources = vec![
        source("K1", SourceKind::Verses, raw.join("k1.jsonl")),
        source("GH3", SourceKind::Verses, raw.join("gh3.json")),
        source("GH2", SourceKind::Verses, raw.join("gh2.jsonl")),
        source("HF1", SourceKind::Qa, raw.join("hf1.jsonl")),
        source("K3", SourceKind::Qa, raw.join("k3.jsonl")),
    ];
    config
}

fn hash() -> Arc<dyn Embedder> {
    Arc::new(HashProvider::new(&Config::default().embedding))
}

fn read(config: &Config, file: &str) -> Vec<Value> {
    read_jsonl(&config.output.path(file)).unwrap()
}

#[tokio::test]
async fn test_verse_merge_across_sources() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let verses = read(&config, &config.output.master_verses);
    assert_eq!(verses.len(), 2);
    let v = &verses[0];
    assert_eq!(v["verse_id"], "1.1");
    assert_eq!(v["scripture"], "bhagavad_gita");
    // GH3 outranks K1 for the Sanskrit text; markup and spacing are cleaned
    assert_eq!(v["sanskrit"], "धर्मक्षेत्रे कुरुक्षेत्रे समवेता युयुत्सवः");
    assert_eq!(v["sources"], serde_json::json!(["GH2", "GH3", "K1"]));
    // K1's shorter Sanskrit text survives as a variant
    assert_eq!(
        v["sanskrit_variants"],
        serde_json::json!([
            {"text": "धर्मक्षेत्रे कुरुक्षेत्रे समवेता युयुत्सवः", "source": "GH3"},
            {"text": "धर्मक्षेत्रे कुरुक्षेत्रे", "source": "K1"},
        ])
    );
    assert_eq!(v["transliteration_variants"][0]["source"], "GH3");
    assert!(v.get("word_meanings").is_none());

    let translations = v["translations"].as_array().unwrap();
    assert_eq!(translations.len(), 2);
    // GH3 and GH2 carry the same Sivananda translation; it is kept once
    let sivananda = translations.iter().find(|t| t["source"] == "GH3").unwrap();
    assert_eq!(sivananda["also_sources"], serde_json::json!(["GH2"]));
    assert!(sivananda["author_id"].is_u64());
    let anonymous = translations.iter().find(|t| t["source"] == "K1").unwrap();
    assert!(anonymous["author_id"].is_null());
    assert!(anonymous.get("also_sources").is_none());

    let chapters = read(&config, &config.output.chapters);
    assert_eq!(chapters.len(), 1);
    assert_eq!(chapters[0]["master_verse_count"], 2);
}

#[tokio::test]
async fn test_author_registry_is_stable_and_enriched() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let authors = read(&config, &config.output.authors);
    assert_eq!(authors.len(), 2);
    let sivananda = authors
        .iter()
        .find(|a| a["canonical_name"] == "Swami Sivananda")
        .unwrap();
    assert_eq!(sivananda["roles"], serde_json::json!(["translation"]));
    assert_eq!(sivananda["sources"], serde_json::json!(["GH2", "GH3"]));
    let aliases = sivananda["aliases"].as_array().unwrap();
    assert!(aliases.iter().any(|a| a == "Sivananda"));

    let ids: Vec<u64> = authors.iter().map(|a| a["author_id"].as_u64().unwrap()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn test_rejections_are_reported_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    let summary = run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let rejections = read(&config, &config.output.rejections);
    let kinds: Vec<&str> = rejections.iter().map(|r| r["kind"].as_str().unwrap()).collect();
    // bad JSON line, missing K3 question
    assert_eq!(kinds.iter().filter(|k| **k == "ParseFailure").count(), 2);
    // "one" as a chapter, HF1 verse range
    assert_eq!(kinds.iter().filter(|k| **k == "VerseIdentityAmbiguous").count(), 2);
    assert_eq!(summary.total_rejections(), 4);
    assert!(rejections.iter().all(|r| !r["location"].as_str().unwrap().is_empty()));
}

#[tokio::test]
async fn test_qa_ids_and_clusters() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let records = read(&config, &config.output.qa_records);
    let qids: Vec<&str> = records.iter().map(|r| r["qid"].as_str().unwrap()).collect();
    assert_eq!(
        qids,
        vec![
            "HF1-en-2.47-001",
            "HF1-en-2.47-002",
            "HF1-en-2.47-003",
            "K3-en-2.47-001",
            "HF1-en-2.48-001",
        ]
    );

    let clusters = read(&config, &config.output.clusters);
    assert_eq!(clusters.len(), 3);
    let dup = &clusters[0];
    assert_eq!(dup["cluster_id"], 1);
    assert_eq!(
        dup["member_qids"],
        serde_json::json!(["HF1-en-2.47-001", "HF1-en-2.47-003", "K3-en-2.47-001"])
    );
    assert_eq!(dup["representative_qid"], "HF1-en-2.47-001");
    assert_eq!(dup["sources"], serde_json::json!(["HF1", "K3"]));
    assert_eq!(dup["member_count"], 3);
    assert_eq!(clusters[1]["member_count"], 1);
    assert_eq!(clusters[1]["member_qids"], serde_json::json!(["HF1-en-2.47-002"]));
    assert_eq!(clusters[2]["verse_id"], "2.48");

    // every record lands in exactly one cluster
    let mut members: Vec<String> = clusters
        .iter()
        .flat_map(|c| c["member_qids"].as_array().unwrap().clone())
        .map(|q| q.as_str().unwrap().to_string())
        .collect();
    members.sort();
    let mut all: Vec<String> = qids.iter().map(|q| q.to_string()).collect();
    all.sort();
    assert_eq!(members, all);
}

#[tokio::test]
async fn test_qa_records_keep_source_provenance() {
    let tmp = TempDir::new().unwrap();
    let hf1 = [
        r#"{"id": "hf-9", "chapter_no": 2, "verse_no": 47, "question": "Why act?", "answer": "Duty.", "topic": "karma"}"#,
    ];
    let mut config = setup(&tmp, K1_LINES, &hf1);
    if let Some(k3) = config.sources.iter_mut().find(|s| s.tag == "K3") {
        k3.authority = Some("synthetic".to_string());
    }
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let records = read(&config, &config.output.qa_records);
    let hf = records.iter().find(|r| r["source"] == "HF1").unwrap();
    assert_eq!(hf["orig_id"], "hf-9");
    assert_eq!(hf["authority"], "secondary");
    assert_eq!(hf["metadata"], serde_json::json!({"topic": "karma"}));
    let k3 = records.iter().find(|r| r["source"] == "K3").unwrap();
    assert_eq!(k3["authority"], "synthetic");
    assert!(k3.get("orig_id").is_none());
    assert!(k3.get("metadata").is_none());
}

#[tokio::test]
async fn test_failed_write_leaves_previous_outputs() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();
    let out = &config.output;
    let before: Vec<Vec<u8>> = out.files().iter().map(|f| fs::read(out.path(f)).unwrap()).collect();

    // a changed input, and a clusters temp path that cannot be created
    let config = setup(&tmp, &K1_LINES[..1], &HF1_LINES[..2]);
    let out = &config.output;
    fs::create_dir_all(out.path(&format!("{}.tmp", out.clusters))).unwrap();

    let err = run_build_with(&config, hash(), &NoProgress, false)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains(out.clusters.as_str()));

    for (file, old) in out.files().iter().zip(&before) {
        let now = fs::read(out.path(file)).unwrap();
        assert_eq!(&now, old, "{} was replaced by a failed build", file);
        assert!(!out.path(&format!("{}.prev", file)).exists());
    }
    assert!(!out.path(&format!("{}.tmp", out.master_verses)).exists());
    assert!(!out.path(&format!("{}.tmp", out.qa_records)).exists());
}

#[tokio::test]
async fn test_rerun_is_byte_identical_and_keeps_previous() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();
    let first: Vec<Vec<u8>> = config
        .output
        .files()
        .iter()
        .map(|f| fs::read(config.output.path(f)).unwrap())
        .collect();

    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();
    for (file, before) in config.output.files().iter().zip(&first) {
        let after = fs::read(config.output.path(file)).unwrap();
        assert_eq!(&after, before, "{} changed between runs", file);
        let prev = fs::read(config.output.path(&format!("{}.prev", file))).unwrap();
        assert_eq!(&prev, before);
    }
}

#[tokio::test]
async fn test_source_listing_order_does_not_change_outputs() {
    let a = TempDir::new().unwrap();
    let config_a = setup(&a, K1_LINES, HF1_LINES);
    run_build_with(&config_a, hash(), &NoProgress, false).await.unwrap();

    let b = TempDir::new().unwrap();
    let mut config_b = setup(&b, K1_LINES, HF1_LINES);
    config_b.sources.reverse();
    run_build_with(&config_b, hash(), &NoProgress, false).await.unwrap();

    let out_a = &config_a.output;
    let out_b = &config_b.output;
    for file in [
        &out_a.master_verses,
        &out_a.authors,
        &out_a.qa_records,
        &out_a.clusters,
        &out_a.chapters,
    ] {
        let left = fs::read(out_a.path(file)).unwrap();
        let right = fs::read(out_b.path(file)).unwrap();
        assert_eq!(left, right, "{} depends on source order", file);
    }
}

#[tokio::test]
async fn test_qid_sequence_follows_record_order() {
    let tmp = TempDir::new().unwrap();
    let hf1 = [HF1_LINES[1], HF1_LINES[0], HF1_LINES[2]];
    let config = setup(&tmp, K1_LINES, &hf1);
    run_build_with(&config, hash(), &NoProgress, false).await.unwrap();

    let records = read(&config, &config.output.qa_records);
    let first = records.iter().find(|r| r["qid"] == "HF1-en-2.47-001").unwrap();
    assert_eq!(first["question"], "Who is speaking in this verse?");
    let clusters = read(&config, &config.output.clusters);
    // the duplicate cluster now starts at the second record
    assert_eq!(clusters[0]["member_qids"], serde_json::json!(["HF1-en-2.47-001"]));
    assert_eq!(
        clusters[1]["member_qids"],
        serde_json::json!(["HF1-en-2.47-002", "HF1-en-2.47-003", "K3-en-2.47-001"])
    );
}

#[tokio::test]
async fn test_embedding_outage_degrades_to_singletons() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    let summary = run_build_with(&config, Arc::new(DisabledProvider), &NoProgress, false)
        .await
        .unwrap();
    assert_eq!(summary.unclustered_buckets, 1);
    assert_eq!(
        summary.rejections.get(&RejectionKind::EmbeddingUnavailable),
        Some(&1)
    );

    let clusters = read(&config, &config.output.clusters);
    assert_eq!(clusters.len(), 5);
    let unclustered: Vec<&Value> = clusters.iter().filter(|c| c["unclustered"] == true).collect();
    assert_eq!(unclustered.len(), 4);
    // the single-question bucket never needed embedding
    assert!(clusters[4].get("unclustered").is_none());

    let rejections = read(&config, &config.output.rejections);
    let outage = rejections
        .iter()
        .find(|r| r["kind"] == "EmbeddingUnavailable")
        .unwrap();
    assert_eq!(outage["location"], "verse 2.47");
    assert_eq!(outage["source"], "HF1,K3");
}

#[tokio::test]
async fn test_alias_conflict_aborts_without_writing() {
    let tmp = TempDir::new().unwrap();
    let config = setup(&tmp, K1_LINES, HF1_LINES);
    fs::create_dir_all(&config.output.dir).unwrap();
    fs::write(
        config.output.path(&config.output.authors),
        concat!(
            r#"{"author_id": 1, "canonical_name": "Swami Sivananda"}"#,
            "\n",
            r#"{"author_id": 2, "canonical_name": "Sivananda"}"#,
            "\n"
        ),
    )
    .unwrap();

    let err = run_build_with(&config, hash(), &NoProgress, false)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("alias conflict"));
    assert!(!config.output.path(&config.output.master_verses).exists());
}
