//! Source discovery and raw-record reading.
//!
//! Each `[[sources]]` entry points at a file or a directory. Directories
//! are walked with `walkdir`, filtered by include/exclude globs, and the
//! matching files are sorted so record ordinals are stable across runs.
//!
//! Two on-disk shapes are accepted:
//!
//! | Extension | Shape |
//! |-----------|-------|
//! | `.jsonl`  | one JSON object per line; blank lines skipped |
//! | `.json`   | an array of objects, or `{ "records": [...] }` |
//!
//! Files are decoded lossily, so invalid UTF-8 becomes U+FFFD instead of
//! failing the whole file. A line that is not a JSON object becomes a
//! `ParseFailure` rejection and reading continues.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use scripture_canon_core::{CanonError, Rejection};
use scripture_canon_core::models::RawRecord;

use crate::config::{Config, SourceConfig};

/// Everything read from one configured source.
#[derive(Debug, Default)]
pub struct SourceRead {
    pub files: Vec<PathBuf>,
    pub records: Vec<RawRecord>,
    pub rejections: Vec<Rejection>,
}

/// List the files a source contributes, sorted by relative path.
pub fn discover_files(source: &SourceConfig) -> Result<Vec<PathBuf>> {
    let root = &source.path;
    if !root.exists() {
        bail!(
            "Source '{}' path does not exist: {}",
            source.tag,
            root.display()
        );
    }
    if root.is_file() {
        return Ok(vec![root.clone()]);
    }

    let include_set = build_globset(&source.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(source.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((rel_str, path.to_path_buf()));
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Read every file of `source` into raw records with source-wide ordinals.
pub fn read_source(source: &SourceConfig) -> Result<SourceRead> {
    let files = discover_files(source)?;
    let mut read = SourceRead::default();
    for file in &files {
        let (records, rejections) = read_raw_records(file, &source.tag, read.records.len())?;
        read.records.extend(records);
        read.rejections.extend(rejections);
    }
    read.files = files;
    Ok(read)
}

/// Parse one file. Ordinals start at `first_ordinal`.
pub fn read_raw_records(
    path: &Path,
    tag: &str,
    first_ordinal: usize,
) -> Result<(Vec<RawRecord>, Vec<Rejection>)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let mut items: Vec<(String, Value)> = Vec::new();
    let mut rejections = Vec::new();

    let is_json_document = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json_document {
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Array(values)) => {
                for (i, item) in values.into_iter().enumerate() {
                    items.push((format!("{}#{}", file_name, i), item));
                }
            }
            Ok(Value::Object(mut obj)) => match obj.remove("records") {
                Some(Value::Array(values)) => {
                    for (i, item) in values.into_iter().enumerate() {
                        items.push((format!("{}#{}", file_name, i), item));
                    }
                }
                _ => items.push((format!("{}#0", file_name), Value::Object(obj))),
            },
            Ok(other) => items.push((format!("{}#0", file_name), other)),
            Err(e) => rejections.push(Rejection::new(
                &CanonError::parse(format!("invalid JSON document: {}", e)),
                tag,
                file_name.clone(),
                None,
            )),
        }
    } else {
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let location = format!("{}:{}", file_name, i + 1);
            match serde_json::from_str::<Value>(line) {
                Ok(value) => items.push((location, value)),
                Err(e) => rejections.push(Rejection::new(
                    &CanonError::parse(format!("invalid JSON line: {}", e)),
                    tag,
                    location,
                    Some(Value::String(line.to_string())),
                )),
            }
        }
    }

    let mut records = Vec::with_capacity(items.len());
    for (location, value) in items {
        match value {
            Value::Object(fields) => records.push(RawRecord {
                source: tag.to_string(),
                location,
                ordinal: first_ordinal + records.len(),
                fields,
            }),
            other => rejections.push(Rejection::new(
                &CanonError::parse("record is not a JSON object"),
                tag,
                location,
                Some(other),
            )),
        }
    }

    Ok((records, rejections))
}

/// Print the configured sources with file counts and health.
pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<8} {:<8} {:<8} {:<8} PATH", "TAG", "KIND", "FILES", "HEALTHY");
    for source in &config.sources {
        let (files, healthy) = match discover_files(source) {
            Ok(files) => (files.len().to_string(), !files.is_empty()),
            Err(_) => ("-".to_string(), false),
        };
        println!(
            "{:<8} {:<8} {:<8} {:<8} {}",
            source.tag,
            source.kind.to_string(),
            files,
            healthy,
            source.path.display()
        );
    }
    if config.sources.is_empty() {
        println!("(no sources configured)");
    }
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
