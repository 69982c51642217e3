//! Build progress reporting.
//!
//! Reports observable progress during `canon build` so users see which
//! source is being read, how many records are adapted, and how many
//! verse buckets are left to embed. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildProgressEvent {
    /// Source files are being discovered and parsed. Total unknown.
    Reading { source: String },
    /// Raw records of `source` converted so far.
    Adapting { source: String, n: u64, total: u64 },
    /// Verse buckets embedded so far.
    Embedding { n: u64, total: u64 },
    /// An output file is being written.
    Writing { file: String },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: `"embed  1,234 / 5,000 buckets"`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Reading { source } => format!("read {}  ...\n", source),
            BuildProgressEvent::Adapting { source, n, total } => format!(
                "adapt {}  {} / {} records\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
            BuildProgressEvent::Embedding { n, total } => format!(
                "embed  {} / {} buckets\n",
                format_number(*n),
                format_number(*total)
            ),
            BuildProgressEvent::Writing { file } => format!("write {}\n", file),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &BuildProgressEvent) -> serde_json::Value {
    match event {
        BuildProgressEvent::Reading { source } => serde_json::json!({
            "event": "progress",
            "phase": "reading",
            "source": source
        }),
        BuildProgressEvent::Adapting { source, n, total } => serde_json::json!({
            "event": "progress",
            "phase": "adapting",
            "source": source,
            "n": n,
            "total": total
        }),
        BuildProgressEvent::Embedding { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "embedding",
            "n": n,
            "total": total
        }),
        BuildProgressEvent::Writing { file } => serde_json::json!({
            "event": "progress",
            "phase": "writing",
            "file": file
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
