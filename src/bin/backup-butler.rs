//! # backup-butler CLI
//!
//! Command-line front end for the backup engine.
//!
//! ## Usage
//! ```bash
//! # Compare source and target without touching anything
//! backup-butler check -c backup.toml --level deep
//!
//! # Mirror the source into the target
//! backup-butler sync -c backup.toml
//!
//! # Walk the whole pipeline without writing
//! backup-butler sync -c backup.toml --dry-run
//!
//! # Show past runs, newest first
//! backup-butler history -c backup.toml
//! ```
//!
//! Exit code 0 means the operation completed (individual files may still
//! have failed; the summary lists them); 1 means a fatal error - bad
//! configuration, an unreachable root, or cancellation.

use backup_butler::{
    format_bytes, BackupConfig, CancellationToken, CheckReport, FileAction, Orchestrator,
    ProgressEvent, ProgressSink, Result, RunReport, ValidationLevel, Verdict,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// backup-butler - directory mirroring with tiered content validation
#[derive(Parser)]
#[command(name = "backup-butler")]
#[command(version)]
#[command(about = "Mirror a directory tree with tiered content validation and run journaling")]
#[command(long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long, global = true, default_value = "backup-butler.toml")]
    config: PathBuf,

    /// Log level for diagnostic output
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Error)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare every file pair and report verdicts; no mutations
    Check {
        /// Override the configured validation level
        #[arg(long, value_enum)]
        level: Option<LevelArg>,
    },

    /// Mirror the source into the target
    Sync {
        /// Record intended actions without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print summaries of past runs, newest first
    History,

    /// Print build info
    Version,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LevelArg {
    Quick,
    Standard,
    Deep,
}

impl From<LevelArg> for ValidationLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Quick => ValidationLevel::Quick,
            LevelArg::Standard => ValidationLevel::Standard,
            LevelArg::Deep => ValidationLevel::Deep,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level.as_tracing())
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("backup-butler {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Check { level } => {
            let config = BackupConfig::load(&cli.config)?;
            cmd_check(config, level.map(Into::into))
        }
        Commands::Sync { dry_run } => {
            let config = BackupConfig::load(&cli.config)?;
            cmd_sync(config, dry_run)
        }
        Commands::History => {
            let config = BackupConfig::load(&cli.config)?;
            cmd_history(config)
        }
    }
}

/// Compare without mutating; print every non-matching pair and a summary
fn cmd_check(config: BackupConfig, level: Option<ValidationLevel>) -> Result<()> {
    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.check(level)?;

    print_check_entries(&report);
    println!();
    println!("{}", "Check summary".blue().bold());
    println!("  matched:   {}", report.matched.to_string().green());
    println!("  differing: {}", report.differing.to_string().yellow());
    println!("  missing:   {}", report.missing.to_string().yellow());
    println!("  orphaned:  {}", report.orphans);
    if report.errors > 0 {
        println!("  errors:    {}", report.errors.to_string().red());
    }
    Ok(())
}

fn print_check_entries(report: &CheckReport) {
    for entry in &report.entries {
        match &entry.verdict {
            Verdict::Match(_) => {}
            Verdict::Differ(level) => {
                println!("{} {} ({})", "*".yellow(), entry.relative_path, level)
            }
            Verdict::Missing => println!("{} {}", "+".yellow(), entry.relative_path),
            Verdict::Orphan => println!("{} {}", "-".cyan(), entry.relative_path),
            Verdict::Error { message, .. } => {
                println!("{} {}: {}", "!".red(), entry.relative_path, message)
            }
        }
    }
}

/// Run a sync (or dry run) with a progress bar and print the summary
fn cmd_sync(config: BackupConfig, dry_run: bool) -> Result<()> {
    let cancel = register_cancellation();
    let progress = Arc::new(ConsoleProgress::default());
    let orchestrator = Orchestrator::new(config).with_progress(progress.clone());

    let banner = if dry_run {
        "Starting dry run..."
    } else {
        "Starting sync..."
    };
    println!("{}", banner.blue().bold());

    let result = if dry_run {
        orchestrator.dry_run(&cancel)
    } else {
        orchestrator.sync(&cancel)
    };
    progress.clear();

    let report = result?;
    print_run_report(&report);
    Ok(())
}

fn print_run_report(report: &RunReport) {
    let action = if report.dry_run { "would copy" } else { "copied" };
    println!();
    println!(
        "{} {} ({})",
        "Run".blue().bold(),
        report.run_id,
        report.status
    );
    println!(
        "  {}: {} files, {}",
        action,
        report.stats.files_copied.to_string().green(),
        format_bytes(report.stats.bytes_copied)
    );
    println!(
        "  skipped: {} files, {}",
        report.stats.files_skipped,
        format_bytes(report.stats.bytes_skipped)
    );
    if report.stats.files_failed > 0 {
        println!("  failed: {}", report.stats.files_failed.to_string().red());
        for (path, message) in &report.failures {
            println!("    {} {}: {}", "!".red(), path, message);
        }
    }
    if !report.deleted.is_empty() {
        println!("  only in target: {} files", report.deleted.len());
    }
}

/// Print past run summaries, newest first
fn cmd_history(config: BackupConfig) -> Result<()> {
    let journal = backup_butler::Journal::open(&config.target_directory, config.max_versions)?;
    let summaries = journal.history()?;

    if summaries.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!("{}", "Run history".blue().bold());
    for summary in summaries {
        let duration = summary
            .finished_at
            .and_then(|end| (end - summary.started_at).to_std().ok())
            .map(|d| humantime::format_duration(round_secs(d)).to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<10}  {:>8}  {} files ({} copied, {} skipped, {} failed)  {}",
            summary.id.cyan(),
            summary.status.to_string(),
            duration,
            summary.stats.total_files,
            summary.stats.files_copied.to_string().green(),
            summary.stats.files_skipped,
            summary.stats.files_failed.to_string().red(),
            format_bytes(summary.stats.bytes_copied + summary.stats.bytes_skipped),
        );
    }
    Ok(())
}

fn round_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs())
}

/// Wire SIGINT/SIGTERM to the cooperative cancellation flag
fn register_cancellation() -> CancellationToken {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&flag)) {
            eprintln!("{}: cannot register signal handler: {e}", "Warning".yellow());
        }
    }
    CancellationToken::from_flag(flag)
}

/// Progress sink backed by an indicatif byte bar
#[derive(Default)]
struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleProgress {
    fn clear(&self) {
        if let Some(bar) = self.bar.lock().take() {
            bar.finish_and_clear();
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ScanStarted => {}
            ProgressEvent::ScanCompleted { total_bytes, .. } => {
                let bar = ProgressBar::new(*total_bytes);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{bar:40.cyan/blue} {bytes}/{total_bytes} {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                *self.bar.lock() = Some(bar);
            }
            ProgressEvent::FileCompleted { path, action, size } => {
                if let Some(bar) = self.bar.lock().as_ref() {
                    bar.inc(*size);
                    if *action == FileAction::Copied {
                        bar.set_message(path.clone());
                    }
                }
            }
            ProgressEvent::DirectoryStarted { .. } | ProgressEvent::DirectoryCompleted { .. } => {}
            ProgressEvent::RunCompleted { .. } => self.clear(),
        }
    }
}
