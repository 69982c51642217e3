//! Canonical output writing and archive packaging.
//!
//! Every output is JSON Lines: one self-contained record per line, so
//! files can be streamed, grepped, and appended to by downstream tools.
//!
//! # Atomic replacement
//!
//! 1. Records are written to `<file>.tmp` and fsynced.
//! 2. If `keep_previous` is set, the current `<file>` is copied to `<file>.prev`.
//! 3. `<file>.tmp` is renamed over `<file>`.
//!
//! A reader therefore sees either the old file or the new one, never a
//! partial write. A writer dropped before [`AtomicJsonlWriter::commit`]
//! removes its temp file and leaves `<file>` untouched.
//!
//! A build writes several files through one [`OutputBatch`]: every file is
//! written and fsynced to its temp path first, and renames start only once
//! all of them succeeded. A failure while staging leaves every target as
//! it was.
//!
//! # Packaging
//!
//! `canon package` bundles the output files into `<name>.zip` and writes
//! `<name>.zip.sha256` in `sha256sum` format (`<hex>  <file name>`).
//! `canon verify` recomputes the digest and checks the archive opens.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Streams records into a temp file and swaps it into place on commit.
pub struct AtomicJsonlWriter {
    target: PathBuf,
    tmp: PathBuf,
    out: Option<BufWriter<File>>,
    keep_previous: bool,
    count: usize,
    /// Set once the temp file has been renamed over the target.
    done: bool,
}

impl AtomicJsonlWriter {
    pub fn create(target: &Path, keep_previous: bool) -> Result<Self> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
        }
        let tmp = sibling(target, "tmp");
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
        Ok(Self {
            target: target.to_path_buf(),
            tmp,
            out: Some(BufWriter::new(file)),
            keep_previous,
            count: 0,
            done: false,
        })
    }

    /// Append one record.
    ///
    /// Records that carry a `verse_id` or `chapter` field must have it
    /// filled in; an empty `verse_id` or a zero `chapter` is refused.
    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)?;
        check_required(&value)?;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("writer already finished"))?;
        serde_json::to_writer(&mut *out, &value)?;
        out.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    /// Flush and fsync the temp file without touching the target. Calling
    /// it again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        let Some(out) = self.out.take() else {
            return Ok(());
        };
        let file = out
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush {}: {}", self.tmp.display(), e))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", self.tmp.display()))?;
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Finish, then move the temp file into place. Returns the number of
    /// records written.
    pub fn commit(mut self) -> Result<usize> {
        self.finish()?;

        if self.keep_previous && self.target.exists() {
            let prev = sibling(&self.target, "prev");
            fs::copy(&self.target, &prev)
                .with_context(|| format!("Failed to keep previous: {}", prev.display()))?;
        }
        fs::rename(&self.tmp, &self.target).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                self.tmp.display(),
                self.target.display()
            )
        })?;
        self.done = true;
        Ok(self.count)
    }
}

impl Drop for AtomicJsonlWriter {
    fn drop(&mut self) {
        self.out.take();
        if !self.done {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Several outputs replaced together.
pub struct OutputBatch {
    keep_previous: bool,
    staged: Vec<AtomicJsonlWriter>,
}

impl OutputBatch {
    pub fn new(keep_previous: bool) -> Self {
        Self {
            keep_previous,
            staged: Vec::new(),
        }
    }

    /// Write `records` to `path`'s temp file. Nothing is renamed yet.
    pub fn stage<T: Serialize>(&mut self, path: &Path, records: &[T]) -> Result<usize> {
        let mut writer = AtomicJsonlWriter::create(path, self.keep_previous)?;
        for record in records {
            writer.write_record(record)?;
        }
        writer.finish()?;
        let count = writer.count;
        self.staged.push(writer);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Move every staged file into place, in staging order.
    pub fn commit(self) -> Result<Vec<(PathBuf, usize)>> {
        let mut written = Vec::with_capacity(self.staged.len());
        for writer in self.staged {
            let target = writer.target().to_path_buf();
            let count = writer.commit()?;
            written.push((target, count));
        }
        Ok(written)
    }
}

/// Write all `records` to `path` atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T], keep_previous: bool) -> Result<usize> {
    let mut writer = AtomicJsonlWriter::create(path, keep_previous)?;
    for record in records {
        writer.write_record(record)?;
    }
    writer.commit()
}

/// Read a JSONL file back into typed records. Blank lines are skipped.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))
        })
        .collect()
}

fn check_required(value: &Value) -> Result<()> {
    if let Some(verse_id) = value.get("verse_id") {
        if verse_id.as_str().map_or(true, |s| s.trim().is_empty()) {
            bail!("refusing to write record without verse_id: {}", value);
        }
    }
    if let Some(chapter) = value.get("chapter") {
        if chapter.as_u64().map_or(true, |c| c == 0) {
            bail!("refusing to write record without chapter: {}", value);
        }
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Result of `canon package`.
#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub archive: PathBuf,
    pub checksum_file: PathBuf,
    pub sha256: String,
    pub files: usize,
}

/// Zip `files` (names relative to `dir`) into `archive` and write the
/// `.sha256` companion.
pub fn package_outputs(dir: &Path, files: &[&str], archive: &Path) -> Result<PackageSummary> {
    for name in files {
        let path = dir.join(name);
        if !path.is_file() {
            bail!(
                "Output file missing: {} (run `canon build` first)",
                path.display()
            );
        }
    }
    if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(archive)
        .with_context(|| format!("Failed to create archive: {}", archive.display()))?;
    let mut zip = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for name in files {
        let bytes = fs::read(dir.join(name))?;
        zip.start_file(*name, options)
            .map_err(|e| anyhow::anyhow!("zip error: {}", e))?;
        zip.write_all(&bytes)?;
    }
    zip.finish().map_err(|e| anyhow::anyhow!("zip error: {}", e))?;

    let sha256 = sha256_hex(archive)?;
    let checksum_file = sibling(archive, "sha256");
    let archive_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    fs::write(&checksum_file, format!("{}  {}\n", sha256, archive_name))
        .with_context(|| format!("Failed to write {}", checksum_file.display()))?;

    Ok(PackageSummary {
        archive: archive.to_path_buf(),
        checksum_file,
        sha256,
        files: files.len(),
    })
}

/// Result of `canon verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub expected: String,
    pub actual: String,
    pub entries: usize,
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        self.expected == self.actual
    }
}

/// Recompute the archive digest and compare it with `<archive>.sha256`.
pub fn verify_archive(archive: &Path) -> Result<VerifyOutcome> {
    let checksum_file = sibling(archive, "sha256");
    let recorded = fs::read_to_string(&checksum_file)
        .with_context(|| format!("Failed to read checksum file: {}", checksum_file.display()))?;
    let expected = recorded
        .split_whitespace()
        .next()
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow::anyhow!("Checksum file is empty: {}", checksum_file.display()))?;

    let actual = sha256_hex(archive)?;
    let entries = zip::ZipArchive::new(File::open(archive)?)
        .map_err(|e| anyhow::anyhow!("Not a readable zip archive: {}", e))?
        .len();

    Ok(VerifyOutcome {
        expected,
        actual,
        entries,
    })
}

/// SHA-256 of a file, read in 64 KiB chunks.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/records.jsonl");
        let records = vec![
            json!({"verse_id": "1.1", "chapter": 1}),
            json!({"verse_id": "1.2", "chapter": 1}),
        ];
        assert_eq!(write_jsonl(&path, &records, true).unwrap(), 2);
        let back: Vec<Value> = read_jsonl(&path).unwrap();
        assert_eq!(back, records);
        assert!(!sibling(&path, "tmp").exists());
        assert!(!sibling(&path, "prev").exists());
    }

    #[test]
    fn test_previous_version_is_kept() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("authors.jsonl");
        write_jsonl(&path, &[json!({"author_id": 1})], true).unwrap();
        write_jsonl(&path, &[json!({"author_id": 2})], true).unwrap();

        let prev: Vec<Value> = read_jsonl(&sibling(&path, "prev")).unwrap();
        let cur: Vec<Value> = read_jsonl(&path).unwrap();
        assert_eq!(prev[0]["author_id"], 1);
        assert_eq!(cur[0]["author_id"], 2);
    }

    #[test]
    fn test_refuses_missing_verse_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("qa.jsonl");
        std::fs::write(&path, "{\"verse_id\":\"2.47\"}\n").unwrap();

        let err = write_jsonl(&path, &[json!({"verse_id": "", "chapter": 2})], true).unwrap_err();
        assert!(err.to_string().contains("verse_id"));
        assert!(write_jsonl(&path, &[json!({"verse_id": "2.1", "chapter": 0})], true).is_err());

        // the failed writes left the existing file and no temp file behind
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"verse_id\":\"2.47\"}\n");
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn test_batch_failure_leaves_every_target() {
        let tmp = TempDir::new().unwrap();
        let verses = tmp.path().join("master_verses.jsonl");
        let qa = tmp.path().join("qa_records.jsonl");
        std::fs::write(&verses, "{\"verse_id\":\"1.1\"}\n").unwrap();
        std::fs::write(&qa, "{\"verse_id\":\"2.47\"}\n").unwrap();

        let mut batch = OutputBatch::new(true);
        batch.stage(&verses, &[json!({"verse_id": "1.2", "chapter": 1})]).unwrap();
        let err = batch.stage(&qa, &[json!({"verse_id": "", "chapter": 2})]).unwrap_err();
        assert!(err.to_string().contains("verse_id"));
        assert_eq!(batch.len(), 1);
        drop(batch);

        assert_eq!(std::fs::read_to_string(&verses).unwrap(), "{\"verse_id\":\"1.1\"}\n");
        assert_eq!(std::fs::read_to_string(&qa).unwrap(), "{\"verse_id\":\"2.47\"}\n");
        assert!(!sibling(&verses, "tmp").exists());
        assert!(!sibling(&qa, "tmp").exists());
        assert!(!sibling(&verses, "prev").exists());
    }

    #[test]
    fn test_batch_commits_all_staged_files() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jsonl");
        let b = tmp.path().join("b.jsonl");
        std::fs::write(&a, "{\"n\":0}\n").unwrap();

        let mut batch = OutputBatch::new(true);
        assert_eq!(batch.stage(&a, &[json!({"n": 1})]).unwrap(), 1);
        assert_eq!(batch.stage(&b, &[json!({"n": 2}), json!({"n": 3})]).unwrap(), 2);
        // staged but not yet visible
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "{\"n\":0}\n");
        assert!(!b.exists());

        let written = batch.commit().unwrap();
        assert_eq!(written, vec![(a.clone(), 1), (b.clone(), 2)]);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "{\"n\":1}\n");
        assert_eq!(std::fs::read_to_string(sibling(&a, "prev")).unwrap(), "{\"n\":0}\n");
        assert_eq!(read_jsonl::<Value>(&b).unwrap().len(), 2);
        assert!(!sibling(&b, "tmp").exists());
    }

    #[test]
    fn test_package_and_verify() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.jsonl"), "{}\n").unwrap();
        std::fs::write(tmp.path().join("b.jsonl"), "{}\n{}\n").unwrap();
        let archive = tmp.path().join("dist/canon.zip");

        let summary = package_outputs(tmp.path(), &["a.jsonl", "b.jsonl"], &archive).unwrap();
        assert_eq!(summary.files, 2);
        let line = std::fs::read_to_string(&summary.checksum_file).unwrap();
        assert_eq!(line, format!("{}  canon.zip\n", summary.sha256));

        let outcome = verify_archive(&archive).unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.entries, 2);

        std::fs::write(&summary.checksum_file, format!("{}  canon.zip\n", "0".repeat(64))).unwrap();
        assert!(!verify_archive(&archive).unwrap().is_ok());
    }

    #[test]
    fn test_package_requires_outputs() {
        let tmp = TempDir::new().unwrap();
        let err = package_outputs(tmp.path(), &["missing.jsonl"], &tmp.path().join("x.zip"))
            .unwrap_err();
        assert!(err.to_string().contains("canon build"));
    }
}
