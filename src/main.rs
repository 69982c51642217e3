//! # Scripture Canon CLI (`canon`)
//!
//! The `canon` binary runs the batch pipeline that turns raw scripture and
//! Q&A snapshots into canonical JSONL files.
//!
//! ## Usage
//!
//! ```bash
//! canon --config ./config/canon.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `canon sources` | List configured sources, their file counts and health |
//! | `canon build` | Read, merge, cluster, and write all canonical outputs |
//! | `canon stats` | Summarize the current output directory |
//! | `canon package` | Zip the outputs and write a SHA-256 companion file |
//! | `canon verify <archive>` | Check an archive against its `.sha256` file |
//!
//! ## Examples
//!
//! ```bash
//! # See what a build would produce without writing anything
//! canon build --dry-run
//!
//! # Full build with JSON progress on stderr and JSON logs
//! canon --log-format json build --progress json
//!
//! # Ship the result
//! canon package --name gita-canon-v3
//! canon verify ./data/canonical/gita-canon-v3.zip
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use scripture_canon::config;
use scripture_canon::pipeline::{self, BuildOptions};
use scripture_canon::progress::ProgressMode;
use scripture_canon::{sources, stats, writer};

/// Scripture Canon CLI: canonicalize scripture verses and deduplicate
/// Q&A records across heterogeneous sources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/canon.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "canon",
    about = "Scripture Canon: canonical verse and Q&A builder",
    version,
    long_about = "Scripture Canon merges verse records from many scripture sources into one \
    canonical record per verse with a stable author registry, and clusters near-duplicate \
    questions per verse with deterministic, reproducible identifiers."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/canon.toml")]
    config: PathBuf,

    /// Log output format on stderr. Filter with `RUST_LOG` (default `info`).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List configured sources and their status.
    ///
    /// Shows each source's kind, how many files its globs match, and
    /// whether its path exists.
    Sources,

    /// Build all canonical outputs.
    ///
    /// Reads every source, merges verses, assigns Q&A ids, clusters
    /// near-duplicate questions, and atomically replaces the output files.
    /// Rejected records go to the rejections file and do not fail the run.
    Build {
        /// Run the whole pipeline but write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal, else `off`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Print counts for the current output directory.
    Stats,

    /// Zip the output files into `<name>.zip` with a `.sha256` companion.
    Package {
        /// Archive base name. Defaults to `canon-<YYYYMMDD>`.
        #[arg(long)]
        name: Option<String>,
    },

    /// Verify an archive against its `.sha256` file.
    Verify {
        /// Path to the `.zip` archive.
        archive: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    // Verify only needs the archive, not a config
    if let Commands::Verify { archive } = &cli.command {
        let outcome = writer::verify_archive(archive)?;
        println!("verify {}", archive.display());
        println!("  entries: {}", outcome.entries);
        println!("  expected: {}", outcome.expected);
        println!("  actual:   {}", outcome.actual);
        if !outcome.is_ok() {
            anyhow::bail!("checksum mismatch for {}", archive.display());
        }
        println!("ok");
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Build { dry_run, progress } => {
            let progress = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(p) => ProgressMode::parse(p).ok_or_else(|| {
                    anyhow::anyhow!("Invalid --progress value '{}': use off, human, or json", p)
                })?,
            };
            pipeline::run_build(&cfg, &BuildOptions { dry_run, progress }).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg)?;
        }
        Commands::Package { name } => {
            let name = name.unwrap_or_else(|| {
                format!("canon-{}", chrono::Utc::now().format("%Y%m%d"))
            });
            let archive = cfg.output.path(&format!("{}.zip", name));
            let summary = writer::package_outputs(&cfg.output.dir, &cfg.output.files(), &archive)?;
            println!("package {}", summary.archive.display());
            println!("  files: {}", summary.files);
            println!("  sha256: {}", summary.sha256);
            println!("  checksum file: {}", summary.checksum_file.display());
            println!("ok");
        }
        Commands::Verify { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
