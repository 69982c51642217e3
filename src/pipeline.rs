//! Build pipeline orchestration.
//!
//! Coordinates the full `canon build` flow:
//!
//! ```text
//! registry load → read sources → adapt (rayon) ─┬─ verses → merge ───────────────┐
//!                                                └─ Q&A → qids → embed → cluster ─┴→ write
//! ```
//!
//! Adapters run in parallel per source, but their results are collected
//! in record order, and the merger and ID assigner sort by explicit
//! precedence, so the output does not depend on scheduling. Bucket
//! embedding runs on bounded-concurrency tokio tasks; results are put
//! back in bucket order before cluster ids are allocated.
//!
//! Only an author alias conflict (or a config/I/O failure) aborts the
//! run. Everything else ends up in `rejections.jsonl`.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use scripture_canon_core::cluster::{bucketize, cluster_embedded, embedding_rejection, Bucket, BucketEmbeddings};
use scripture_canon_core::ids::assign_qids;
use scripture_canon_core::merge::{chapter_summaries, VerseMerger};
use scripture_canon_core::models::{AuthorEntry, QaDraft, QaRecord, VerseUnit};
use scripture_canon_core::registry::AliasGroup;
use scripture_canon_core::{AuthorRegistry, CanonError, RejectionKind, RejectionReport};

use crate::adapters::{Adapted, AdapterRegistry};
use crate::config::Config;
use crate::embedding::{create_provider, embed_batched, DisabledProvider, Embedder, RetryPolicy};
use crate::progress::{BuildProgressEvent, ProgressMode, ProgressReporter};
use crate::sources::read_source;
use crate::writer::{read_jsonl, OutputBatch};

/// Options for `canon build`.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub dry_run: bool,
    pub progress: ProgressMode,
}

/// Counts reported at the end of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub sources: usize,
    pub files: usize,
    pub raw_records: usize,
    pub verse_units: usize,
    pub master_verses: usize,
    pub chapters: usize,
    pub authors: usize,
    pub qa_records: usize,
    pub buckets: usize,
    pub clusters: usize,
    pub multi_member_clusters: usize,
    pub unclustered_buckets: usize,
    pub rejections: BTreeMap<RejectionKind, usize>,
    pub dry_run: bool,
}

impl BuildSummary {
    pub fn total_rejections(&self) -> usize {
        self.rejections.values().sum()
    }
}

/// Reviewed alias list file: `[[authors]] canonical = "..." aliases = [...]`.
#[derive(Debug, Default, Deserialize)]
struct AliasFile {
    #[serde(default)]
    authors: Vec<AliasGroup>,
}

/// Run `canon build` with the configured embedding provider and print
/// the summary.
pub async fn run_build(config: &Config, options: &BuildOptions) -> Result<BuildSummary> {
    let embedder: Arc<dyn Embedder> = match create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                "could not create embedding provider, Q&A buckets will pass through unclustered: {}",
                e
            );
            Arc::new(DisabledProvider)
        }
    };
    let reporter = options.progress.reporter();
    let summary = run_build_with(config, embedder, reporter.as_ref(), options.dry_run).await?;
    print_summary(&summary);
    Ok(summary)
}

/// The build itself, with the embedder and progress sink injected.
pub async fn run_build_with(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    reporter: &dyn ProgressReporter,
    dry_run: bool,
) -> Result<BuildSummary> {
    let mut summary = BuildSummary {
        dry_run,
        sources: config.sources.len(),
        ..BuildSummary::default()
    };
    let mut report = RejectionReport::new();
    let mut registry = load_registry(config)?;

    // Read and adapt every source
    let adapters = AdapterRegistry::from_config(config);
    let mut units: Vec<VerseUnit> = Vec::new();
    let mut drafts: Vec<QaDraft> = Vec::new();
    for source in &config.sources {
        reporter.report(BuildProgressEvent::Reading {
            source: source.tag.clone(),
        });
        let read = read_source(source)
            .with_context(|| format!("Failed to read source '{}'", source.tag))?;
        summary.files += read.files.len();
        summary.raw_records += read.records.len();
        let read_rejections = read.rejections.len();
        report.extend(read.rejections);

        let adapter = adapters
            .find(&source.tag)
            .ok_or_else(|| anyhow::anyhow!("No adapter registered for source '{}'", source.tag))?;
        let results: Vec<_> = read.records.par_iter().map(|r| adapter.adapt(r)).collect();

        let total = results.len() as u64;
        let mut adapted = 0usize;
        let mut rejected = 0usize;
        for result in results {
            match result {
                Ok(Adapted::Verses(v)) => {
                    adapted += v.len();
                    units.extend(v);
                }
                Ok(Adapted::Qa(q)) => {
                    adapted += q.len();
                    drafts.extend(q);
                }
                Err(rejection) => {
                    debug!(source = %source.tag, location = %rejection.location, "{}", rejection.reason);
                    rejected += 1;
                    report.push(rejection);
                }
            }
        }
        reporter.report(BuildProgressEvent::Adapting {
            source: source.tag.clone(),
            n: total,
            total,
        });
        info!(
            source = %source.tag,
            files = read.files.len(),
            records = total,
            adapted,
            rejected = rejected + read_rejections,
            "source adapted"
        );
    }
    summary.verse_units = units.len();

    // Verse path
    let merger = VerseMerger::new(config.merge.priority());
    let merged = merger
        .merge(units, &mut registry)
        .context("Verse merge aborted; correct the author alias list and rerun")?;
    report.extend(merged.rejections);
    let chapters = chapter_summaries(&merged.verses);
    let verses: Vec<_> = merged.verses.into_values().collect();
    summary.master_verses = verses.len();
    summary.chapters = chapters.len();
    summary.authors = registry.len();

    // Q&A path
    let order = config.clustering.precedence();
    let buckets = bucketize(assign_qids(drafts, &order), &order);
    let embeddings = embed_buckets(&buckets, embedder, config, reporter, &mut report).await?;
    let clusters = cluster_embedded(&buckets, &embeddings, config.clustering.threshold);
    summary.buckets = buckets.len();
    summary.clusters = clusters.len();
    summary.multi_member_clusters = clusters.iter().filter(|c| c.member_qids.len() > 1).count();
    summary.unclustered_buckets = embeddings
        .iter()
        .filter(|e| matches!(e, BucketEmbeddings::Unavailable))
        .count();
    let records: Vec<QaRecord> = buckets.into_iter().flat_map(|b| b.records).collect();
    summary.qa_records = records.len();
    summary.rejections = report.counts_by_kind();

    if dry_run {
        return Ok(summary);
    }

    // Write outputs: stage every file, then swap them all into place
    let out = &config.output;
    let authors: Vec<&AuthorEntry> = registry.entries().collect();
    let mut batch = OutputBatch::new(out.keep_previous);
    stage_output(reporter, &mut batch, &out.path(&out.master_verses), &verses)?;
    stage_output(reporter, &mut batch, &out.path(&out.authors), &authors)?;
    stage_output(reporter, &mut batch, &out.path(&out.qa_records), &records)?;
    stage_output(reporter, &mut batch, &out.path(&out.clusters), &clusters)?;
    stage_output(reporter, &mut batch, &out.path(&out.chapters), &chapters)?;
    stage_output(reporter, &mut batch, &out.path(&out.rejections), report.entries())?;

    let registry_path = config.registry.resolved_path(out);
    if registry_path != out.path(&out.authors) {
        stage_output(reporter, &mut batch, &registry_path, &authors)?;
    }

    for (path, n) in batch.commit().context("Failed to move outputs into place")? {
        debug!(file = %path.display(), records = n, "output written");
    }

    Ok(summary)
}

fn stage_output<T: serde::Serialize>(
    reporter: &dyn ProgressReporter,
    batch: &mut OutputBatch,
    path: &Path,
    records: &[T],
) -> Result<()> {
    reporter.report(BuildProgressEvent::Writing {
        file: path.display().to_string(),
    });
    batch
        .stage(path, records)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Load the persisted registry and apply the reviewed alias list.
///
/// Ids already on disk are kept; new authors continue from the highest
/// persisted id.
pub fn load_registry(config: &Config) -> Result<AuthorRegistry> {
    let path = config.registry.resolved_path(&config.output);
    let mut registry = if path.exists() {
        let entries: Vec<AuthorEntry> = read_jsonl(&path)?;
        AuthorRegistry::from_entries(entries)
            .with_context(|| format!("Invalid author registry: {}", path.display()))?
    } else {
        AuthorRegistry::new()
    };

    if let Some(alias_path) = &config.registry.aliases {
        let content = std::fs::read_to_string(alias_path)
            .with_context(|| format!("Failed to read alias list: {}", alias_path.display()))?;
        let aliases: AliasFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse alias list: {}", alias_path.display()))?;
        registry
            .apply_alias_list(&aliases.authors)
            .with_context(|| format!("Alias list conflicts with registry: {}", alias_path.display()))?;
    }

    info!(authors = registry.len(), next_id = registry.next_id(), "author registry loaded");
    Ok(registry)
}

/// Embed every bucket that has more than one question.
///
/// At most `clustering.max_concurrency` buckets are in flight. A bucket
/// whose embedding fails after retries becomes
/// [`BucketEmbeddings::Unavailable`] and gets one rejection entry.
async fn embed_buckets(
    buckets: &[Bucket],
    embedder: Arc<dyn Embedder>,
    config: &Config,
    reporter: &dyn ProgressReporter,
    report: &mut RejectionReport,
) -> Result<Vec<BucketEmbeddings>> {
    let mut results = vec![BucketEmbeddings::Vectors(Vec::new()); buckets.len()];
    let pending: Vec<usize> = (0..buckets.len())
        .filter(|&i| buckets[i].needs_embedding())
        .collect();
    let total = pending.len() as u64;
    if pending.is_empty() {
        return Ok(results);
    }

    let policy = RetryPolicy::from_config(&config.embedding);
    let batch_size = config.embedding.batch_size;
    let semaphore = Arc::new(Semaphore::new(config.clustering.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for idx in pending {
        let texts = buckets[idx].texts();
        let embedder = Arc::clone(&embedder);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = embed_batched(embedder.as_ref(), &texts, batch_size, &policy).await;
            (idx, result)
        });
    }

    let mut failures: Vec<(usize, CanonError)> = Vec::new();
    let mut done = 0u64;
    while let Some(joined) = tasks.join_next().await {
        let (idx, result) = joined.context("Embedding task failed")?;
        done += 1;
        reporter.report(BuildProgressEvent::Embedding { n: done, total });
        match result {
            Ok(vectors) => results[idx] = BucketEmbeddings::Vectors(vectors),
            Err(e) => failures.push((idx, e)),
        }
    }

    // Completion order is nondeterministic; report failures in bucket order.
    failures.sort_by_key(|(idx, _)| *idx);
    for (idx, err) in failures {
        let bucket = &buckets[idx];
        warn!(bucket = %bucket.verse_id, "embedding unavailable, passing through unclustered: {}", err);
        report.push(embedding_rejection(bucket, &err));
        results[idx] = BucketEmbeddings::Unavailable;
    }

    Ok(results)
}

fn print_summary(summary: &BuildSummary) {
    if summary.dry_run {
        println!("build (dry-run)");
    } else {
        println!("build");
    }
    println!("  sources: {} ({} files)", summary.sources, summary.files);
    println!("  raw records: {}", summary.raw_records);
    println!("  verse units: {}", summary.verse_units);
    println!("  master verses: {} in {} chapters", summary.master_verses, summary.chapters);
    println!("  authors: {}", summary.authors);
    println!("  qa records: {}", summary.qa_records);
    println!(
        "  clusters: {} ({} with duplicates)",
        summary.clusters, summary.multi_member_clusters
    );
    if summary.unclustered_buckets > 0 {
        println!("  unclustered buckets: {}", summary.unclustered_buckets);
    }
    println!("  rejections: {}", summary.total_rejections());
    for (kind, count) in &summary.rejections {
        println!("    {}: {}", kind, count);
    }
    println!("ok");
}
