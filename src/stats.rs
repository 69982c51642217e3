//! Output statistics.
//!
//! Reads the canonical files from the output directory and prints what a
//! build produced: verse, author, Q&A and cluster counts, and rejections
//! by kind. Used by `canon stats` to check a build before packaging.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use scripture_canon_core::models::{AuthorEntry, ClusterRecord, MasterVerseRecord, QaRecord};
use scripture_canon_core::{Rejection, RejectionKind};

use crate::config::Config;
use crate::writer::read_jsonl;

/// Counts derived from one output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub verses: usize,
    pub chapters: usize,
    pub authors: usize,
    pub qa_records: usize,
    pub qa_by_source: BTreeMap<String, usize>,
    pub clusters: usize,
    pub multi_member_clusters: usize,
    pub unclustered_clusters: usize,
    pub rejections: BTreeMap<RejectionKind, usize>,
    pub total_bytes: u64,
    pub last_built: Option<i64>,
}

/// Collect stats from the configured output directory. Missing files
/// count as empty.
pub fn collect_stats(config: &Config) -> Result<OutputStats> {
    let out = &config.output;
    let mut stats = OutputStats::default();

    let verses: Vec<MasterVerseRecord> = read_optional(&out.path(&out.master_verses))?;
    stats.verses = verses.len();
    stats.chapters = verses
        .iter()
        .map(|v| (v.scripture.as_str(), v.chapter))
        .collect::<std::collections::BTreeSet<_>>()
        .len();

    let authors: Vec<AuthorEntry> = read_optional(&out.path(&out.authors))?;
    stats.authors = authors.len();

    let records: Vec<QaRecord> = read_optional(&out.path(&out.qa_records))?;
    stats.qa_records = records.len();
    for r in &records {
        *stats.qa_by_source.entry(r.source.clone()).or_insert(0) += 1;
    }

    let clusters: Vec<ClusterRecord> = read_optional(&out.path(&out.clusters))?;
    stats.clusters = clusters.len();
    stats.multi_member_clusters = clusters.iter().filter(|c| c.member_qids.len() > 1).count();
    stats.unclustered_clusters = clusters.iter().filter(|c| c.unclustered).count();

    let rejections: Vec<Rejection> = read_optional(&out.path(&out.rejections))?;
    for r in &rejections {
        *stats.rejections.entry(r.kind).or_insert(0) += 1;
    }

    for file in out.files() {
        if let Ok(meta) = std::fs::metadata(out.path(file)) {
            stats.total_bytes += meta.len();
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            stats.last_built = stats.last_built.max(modified);
        }
    }

    Ok(stats)
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_jsonl(path)
    } else {
        Ok(Vec::new())
    }
}

/// Run the stats command: read the outputs and print a summary.
pub fn run_stats(config: &Config) -> Result<()> {
    let stats = collect_stats(config)?;

    println!("Scripture Canon: Output Stats");
    println!("==============================");
    println!();
    println!("  Output:      {}", config.output.dir.display());
    println!("  Size:        {}", format_bytes(stats.total_bytes));
    println!(
        "  Last build:  {}",
        stats
            .last_built
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Verses:      {} in {} chapters", stats.verses, stats.chapters);
    println!("  Authors:     {}", stats.authors);
    println!("  Q&A:         {}", stats.qa_records);
    println!(
        "  Clusters:    {} ({} with duplicates, {} unclustered)",
        stats.clusters, stats.multi_member_clusters, stats.unclustered_clusters
    );

    if !stats.qa_by_source.is_empty() {
        println!();
        println!("  Q&A by source:");
        for (source, count) in &stats.qa_by_source {
            println!("  {:<12} {:>8}", source, count);
        }
    }

    println!();
    let total: usize = stats.rejections.values().sum();
    println!("  Rejections:  {}", total);
    for (kind, count) in &stats.rejections {
        println!("  {:<24} {:>6}", kind.to_string(), count);
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }

    #[test]
    fn test_stats_on_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.output.dir = tmp.path().to_path_buf();
        let stats = collect_stats(&config).unwrap();
        assert_eq!(stats, OutputStats::default());
    }

    #[test]
    fn test_stats_counts_clusters_and_rejections() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.output.dir = tmp.path().to_path_buf();
        std::fs::write(
            config.output.path(&config.output.clusters),
            concat!(
                r#"{"cluster_id":1,"member_qids":["HF1-en-2.47-001","K3-en-2.47-001"],"representative_qid":"HF1-en-2.47-001","representative_question":"q","representative_answer":"a","chapter":2,"verse_id":"2.47","sources":["HF1","K3"]}"#,
                "\n",
                r#"{"cluster_id":2,"member_qids":["HF1-en-2.48-001"],"representative_qid":"HF1-en-2.48-001","representative_question":"q","representative_answer":"a","chapter":2,"verse_id":"2.48","sources":["HF1"],"unclustered":true}"#,
                "\n"
            ),
        )
        .unwrap();
        std::fs::write(
            config.output.path(&config.output.rejections),
            r#"{"kind":"ParseFailure","source":"K1","location":"k1.jsonl:3","reason":"parse failure: bad"}"#,
        )
        .unwrap();

        let stats = collect_stats(&config).unwrap();
        assert_eq!(stats.clusters, 2);
        assert_eq!(stats.multi_member_clusters, 1);
        assert_eq!(stats.unclustered_clusters, 1);
        assert_eq!(stats.rejections.get(&RejectionKind::ParseFailure), Some(&1));
        assert!(stats.last_built.is_some());
    }
}
