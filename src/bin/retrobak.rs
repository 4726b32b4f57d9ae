//! # Retrobak CLI - Incremental backups you can walk back
//!
//! A thin command-line front end for the retrobak library.
//!
//! ## Usage
//! ```bash
//! # Back up a directory (creates the repository on first use)
//! retrobak backup ~/projects /backups/projects --exclude '**/target'
//!
//! # Undo an interrupted session
//! retrobak regress /backups/projects
//!
//! # Restore the tree as it was three days ago
//! retrobak restore /backups/projects /tmp/projects --at 3d
//!
//! # Inspect sessions and one file's history
//! retrobak list /backups/projects
//! retrobak increments /backups/projects src/main.rs
//!
//! # Forget sessions older than 30 days
//! retrobak prune /backups/projects --older-than 30d
//! ```

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use retrobak::utils::{format_bytes, nested_within};
use retrobak::{
    LocalFs, NoMetadata, PayloadCompression, RegressOutcome, RepoPath, Repository, RepositoryBuilder, Result,
    RetrobakError, SessionTime, SourceScanner,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Retrobak CLI - mirror plus reverse increments
#[derive(Parser)]
#[command(name = "retrobak")]
#[command(version)]
#[command(about = "Incremental backups with a current mirror and reverse increments")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up SOURCE into REPO
    Backup {
        /// Directory to back up
        source: PathBuf,

        /// Repository directory
        repo: PathBuf,

        /// Glob patterns to exclude
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Payload compression for a new repository
        #[arg(long, value_enum, default_value = "lz4")]
        compression: CompressionMode,

        /// Escape upper case in mirror names (case-insensitive filesystems)
        #[arg(long)]
        case_insensitive: bool,
    },

    /// Undo an interrupted session
    Regress {
        /// Repository directory
        repo: PathBuf,
    },

    /// Restore a past state of REPO into TARGET
    #[command(alias = "rs")]
    Restore {
        /// Repository directory
        repo: PathBuf,

        /// Directory to restore into
        target: PathBuf,

        /// Session stamp, RFC 3339 time, or age such as `3d` (defaults to latest)
        #[arg(long)]
        at: Option<String>,
    },

    /// List committed sessions
    #[command(alias = "ls")]
    List {
        /// Repository directory
        repo: PathBuf,
    },

    /// List increments of one entry
    Increments {
        /// Repository directory
        repo: PathBuf,

        /// Entry path relative to the backup root
        path: PathBuf,
    },

    /// Remove sessions older than a point in time
    Prune {
        /// Repository directory
        repo: PathBuf,

        /// Session stamp, RFC 3339 time, or age such as `30d`
        #[arg(long)]
        older_than: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionMode {
    None,
    Lz4,
}

impl From<CompressionMode> for PayloadCompression {
    fn from(mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::None => PayloadCompression::None,
            CompressionMode::Lz4 => PayloadCompression::Lz4,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let jobs = cli.jobs;
    match cli.command {
        Commands::Backup {
            source,
            repo,
            exclude,
            compression,
            case_insensitive,
        } => cmd_backup(source, repo, exclude, compression, case_insensitive, jobs),
        Commands::Regress { repo } => cmd_regress(repo),
        Commands::Restore { repo, target, at } => cmd_restore(repo, target, at, jobs),
        Commands::List { repo } => cmd_list(repo),
        Commands::Increments { repo, path } => cmd_increments(repo, path),
        Commands::Prune { repo, older_than } => cmd_prune(repo, older_than),
    }
}

fn builder(jobs: Option<usize>) -> RepositoryBuilder {
    match jobs {
        Some(jobs) => RepositoryBuilder::new().parallel_workers(jobs),
        None => RepositoryBuilder::new(),
    }
}

fn open(repo: PathBuf) -> Result<Repository> {
    Repository::open(std::sync::Arc::new(LocalFs::new(repo)))
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Parse a session stamp, an RFC 3339 time, or an age relative to now
fn parse_point(input: &str) -> Result<SessionTime> {
    if let Ok(stamp) = SessionTime::parse(input) {
        return Ok(stamp);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return SessionTime::from_datetime(time.with_timezone(&Utc));
    }
    let age = humantime::parse_duration(input)
        .map_err(|e| RetrobakError::InvalidConfiguration(format!("cannot read time {input:?}: {e}")))?;
    let age = chrono::Duration::from_std(age)
        .map_err(|e| RetrobakError::InvalidConfiguration(format!("age {input:?} out of range: {e}")))?;
    SessionTime::from_datetime(Utc::now() - age)
}

fn cmd_backup(
    source: PathBuf,
    repo: PathBuf,
    exclude: Vec<String>,
    compression: CompressionMode,
    case_insensitive: bool,
    jobs: Option<usize>,
) -> Result<()> {
    let mut builder = builder(jobs).compression(compression.into());
    if case_insensitive {
        builder = builder.quoting(retrobak::PathCodec::case_insensitive().extra_chars());
    }
    let repository = builder.build_local(&repo)?;
    let source_fs = LocalFs::new(&source);
    let excludes: Vec<&str> = exclude.iter().map(String::as_str).collect();
    warn_if_inside_source(&repo, &source, &source_fs, &excludes)?;

    println!("{} {} {} {}", "Backing up".blue().bold(), source.display(), "→".dimmed(), repo.display());
    let start = Instant::now();
    let pb = spinner("Mirroring...");
    let report = repository.backup_tree(&source_fs, &excludes);
    pb.finish_and_clear();
    let report = report?;

    let stats = &report.stats;
    println!("{} Session {}", "✓".green().bold(), report.session.to_string().yellow().bold());
    println!(
        "  Source: {} entries, {}",
        stats.source_files.to_string().cyan(),
        format_bytes(stats.source_file_size).cyan()
    );
    println!(
        "  New: {}  Changed: {}  Deleted: {}",
        stats.new_files.to_string().green(),
        stats.changed_files.to_string().yellow(),
        stats.deleted_files.to_string().red()
    );
    println!(
        "  Increments: {} ({})",
        stats.increment_files.to_string().cyan(),
        format_bytes(stats.increment_file_size).cyan()
    );
    println!("  Time: {}", format_duration(trim(start.elapsed())).to_string().cyan());

    if !report.errors.is_empty() {
        println!("{} {} entries failed:", "!".yellow().bold(), report.errors.len());
        for error in &report.errors {
            println!("  {}", error.to_string().yellow());
        }
    }
    Ok(())
}

/// Warn when the repository would end up in its own backups
fn warn_if_inside_source(repo: &Path, source: &Path, source_fs: &LocalFs, excludes: &[&str]) -> Result<()> {
    let Some(inside) = nested_within(repo, source) else {
        return Ok(());
    };
    let scanner = SourceScanner::new(source_fs).with_exclude_patterns(excludes)?;
    if RepoPath::new(&inside).is_ok_and(|path| scanner.is_excluded(&path)) {
        return Ok(());
    }
    warn!("repository {} lies inside source {}", repo.display(), source.display());
    println!(
        "{} Repository is inside the source; add {} to keep it out of its own backups",
        "⚠".yellow().bold(),
        format!("--exclude '{}'", inside.display()).yellow()
    );
    Ok(())
}

fn cmd_regress(repo: PathBuf) -> Result<()> {
    let repository = open(repo)?;
    match repository.regress()? {
        RegressOutcome::Clean => println!("{} Repository is clean", "✓".green().bold()),
        RegressOutcome::Regressed {
            session,
            reverted,
            skipped,
        } => println!(
            "{} Undid session {} ({} reverted, {} untouched)",
            "✓".green().bold(),
            session.to_string().yellow(),
            reverted,
            skipped
        ),
    }
    Ok(())
}

fn cmd_restore(repo: PathBuf, target: PathBuf, at: Option<String>, jobs: Option<usize>) -> Result<()> {
    let repository = builder(jobs).open(std::sync::Arc::new(LocalFs::new(&repo)))?;
    let as_of = match at {
        Some(at) => parse_point(&at)?,
        None => SessionTime::now(),
    };
    std::fs::create_dir_all(&target)?;
    let target_fs = LocalFs::new(&target);

    let start = Instant::now();
    let pb = spinner("Restoring...");
    let report = repository.restore(as_of, &target_fs, &NoMetadata);
    pb.finish_and_clear();
    let report = report?;

    let session = report.session.map(|s| s.to_string()).unwrap_or_default();
    println!("{} Restored session {}", "✓".green().bold(), session.yellow().bold());
    println!(
        "  Files: {}  Directories: {}  Links: {}  Special: {}",
        report.files_restored.to_string().cyan(),
        report.directories_restored.to_string().cyan(),
        report.links_restored.to_string().cyan(),
        report.specials_restored.to_string().cyan()
    );
    println!("  Size: {}", format_bytes(report.bytes_written).cyan());
    println!("  Time: {}", format_duration(trim(start.elapsed())).to_string().cyan());
    for error in &report.errors {
        println!("  {}", error.to_string().yellow());
    }
    Ok(())
}

fn cmd_list(repo: PathBuf) -> Result<()> {
    let repository = open(repo)?;
    if repository.needs_regress()? {
        println!("{} an interrupted session awaits regression", "!".yellow().bold());
    }
    let sessions = repository.list_sessions()?;
    if sessions.is_empty() {
        println!("{}", "No sessions yet".dimmed());
        return Ok(());
    }
    for session in sessions {
        let when = session.as_datetime().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        match repository.session_statistics(session) {
            Ok(stats) => println!(
                "{}  {}  {} new, {} changed, {} deleted, {} errors",
                session.to_string().yellow(),
                when.dimmed(),
                stats.new_files,
                stats.changed_files,
                stats.deleted_files,
                stats.errors
            ),
            Err(_) => println!("{}  {}", session.to_string().yellow(), when.dimmed()),
        }
    }
    Ok(())
}

fn cmd_increments(repo: PathBuf, path: PathBuf) -> Result<()> {
    let repository = open(repo)?;
    let path = RepoPath::new(path)?;
    let increments = repository.list_increments(&path)?;
    if increments.is_empty() {
        println!("{}", format!("No increments for {path}").dimmed());
        return Ok(());
    }
    for info in increments {
        println!(
            "{}  {:<8}  {:>10}{}",
            info.session.to_string().yellow(),
            info.kind.to_string().cyan(),
            format_bytes(info.size),
            if info.compressed { "  lz4".dimmed() } else { "".normal() }
        );
    }
    Ok(())
}

fn cmd_prune(repo: PathBuf, older_than: String) -> Result<()> {
    let repository = open(repo)?;
    let cutoff = parse_point(&older_than)?;
    let report = repository.remove_older_than(cutoff)?;
    println!(
        "{} Removed {} sessions and {} increments, freed {}",
        "✓".green().bold(),
        report.sessions_removed.len().to_string().cyan(),
        report.increments_removed.to_string().cyan(),
        format_bytes(report.bytes_freed).cyan()
    );
    Ok(())
}

fn trim(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
