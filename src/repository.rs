//! Repository facade: configuration, lifecycle and public operations
//!
//! A [`Repository`] ties the session engine, regression, restore and
//! retention to one repository directory reached through a
//! [`FileSystemAccess`]. Every mutating operation first regresses an
//! unterminated session, so callers never observe a half-applied mirror.
//!
//! ## Examples
//!
//! ```rust
//! use retrobak::memory_fs::MemoryFs;
//! use retrobak::source::SourceScanner;
//! use retrobak::{RepoPath, RepositoryBuilder, SessionTime};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = MemoryFs::new();
//! source.write_file("notes.txt", "v1")?;
//!
//! let repo = RepositoryBuilder::new()
//!     .parallel_workers(1)
//!     .build(Arc::new(MemoryFs::new()))?;
//!
//! let first = SessionTime::from_millis(1_000)?;
//! repo.backup_at(first, &source, SourceScanner::new(&source))?;
//!
//! source.write_file("notes.txt", "v2")?;
//! repo.backup_at(SessionTime::from_millis(2_000)?, &source, SourceScanner::new(&source))?;
//!
//! let old = repo.reconstruct(&RepoPath::new("notes.txt")?, first)?.unwrap();
//! assert_eq!(old.content.as_deref(), Some(&b"v1"[..]));
//! # Ok(())
//! # }
//! ```

use crate::compression::PayloadCompression;
use crate::delta::{DeltaCodec, DEFAULT_BLOCK_SIZE};
use crate::error::{EntryError, Result, RetrobakError};
use crate::fs_access::{FileSystemAccess, LocalFs};
use crate::increment::IncrementStore;
use crate::layout::RepoLayout;
use crate::manifest::ManifestStore;
use crate::marker::{LivenessProbe, MarkerStore, ProcessProbe};
use crate::path_codec::PathCodec;
use crate::regress::{RegressOutcome, Regressor};
use crate::restore::{Reconstructed, Restorer};
use crate::shadow::RepositoryShadow;
use crate::source::{MetadataChannel, SourceScanner};
use crate::types::{
    IncrementInfo, PruneReport, RepoPath, RestoreReport, SessionReport, SessionStats, SessionTime, SourceEntry,
};
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// On-disk format written by this version
pub const FORMAT_VERSION: u32 = 1;

/// Default number of entries prepared per parallel batch
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Settings of one repository, persisted to `data/config.json`
///
/// `quoting`, `delta_block_size` and `preserve_hardlinks` shape what is
/// stored and are fixed at init. `parallel_workers`, `batch_size` and
/// `restore_ownership` only tune a running process and may be overridden
/// when opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Extra ASCII characters the path codec escapes in mirror names
    pub quoting: String,
    /// Compression of increment payloads
    pub compression: PayloadCompression,
    /// Block size for signatures and deltas
    pub delta_block_size: u32,
    /// Threads preparing content in parallel
    pub parallel_workers: usize,
    /// Entries prepared per batch
    pub batch_size: usize,
    /// Keep source hard link groups as hard links in the mirror
    pub preserve_hardlinks: bool,
    /// Restore uid/gid on restore
    pub restore_ownership: bool,
    /// On-disk format version
    pub format_version: u32,
    /// Crate version that wrote the config
    pub version: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            quoting: String::new(),
            compression: PayloadCompression::default(),
            delta_block_size: DEFAULT_BLOCK_SIZE,
            parallel_workers: num_cpus::get(),
            batch_size: DEFAULT_BATCH_SIZE,
            preserve_hardlinks: true,
            restore_ownership: false,
            format_version: FORMAT_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RepositoryConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.delta_block_size == 0 {
            return Err(RetrobakError::InvalidConfiguration(
                "delta_block_size must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(RetrobakError::InvalidConfiguration("batch_size must be positive".to_string()));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(RetrobakError::InvalidConfiguration(format!(
                "unsupported repository format {} (expected {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        self.codec().map(|_| ())
    }

    /// Path codec described by `quoting`
    pub fn codec(&self) -> Result<PathCodec> {
        PathCodec::with_extra(&self.quoting)
    }
}

/// Contents of `data/metadata.json`, written once at init
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    /// On-disk format version
    pub format_version: u32,
    /// Crate version that created the repository
    pub version: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// An initialized backup repository
///
/// All operations take `&self`; sessions, regression and retention are
/// serialized by an internal lock, reads are not.
pub struct Repository {
    fs: Arc<dyn FileSystemAccess>,
    layout: RepoLayout,
    config: RepositoryConfig,
    probe: Arc<dyn LivenessProbe>,
    session_lock: Mutex<()>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("fs", &self.fs)
            .field("config", &self.config)
            .field("probe", &self.probe)
            .field("busy", &self.session_lock.is_locked())
            .finish()
    }
}

impl Repository {
    /// Initialize a new repository on `fs`
    ///
    /// Creates `data/`, `data/tmp/` and `increments/`, and writes
    /// `metadata.json` and `config.json`. The mirror itself is created by
    /// the first session.
    ///
    /// # Errors
    ///
    /// - [`RetrobakError::AlreadyInitialized`] if `data/metadata.json` exists
    /// - [`RetrobakError::InvalidConfiguration`] if `config` does not validate
    #[instrument(skip(fs, config))]
    pub fn init(fs: Arc<dyn FileSystemAccess>, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let layout = RepoLayout::new(config.codec()?);
        if fs.exists(&layout.metadata())? {
            return Err(RetrobakError::AlreadyInitialized(layout.metadata()));
        }
        info!("initializing repository");

        fs.create_dir_all(&layout.tmp_dir())?;
        fs.create_dir_all(&layout.increments_root())?;
        let config_json = serde_json::to_vec_pretty(&config)?;
        atomic_write(fs.as_ref(), &layout.tmp_dir(), &layout.config(), &config_json)?;
        let metadata = RepositoryMetadata {
            format_version: FORMAT_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        atomic_write(fs.as_ref(), &layout.tmp_dir(), &layout.metadata(), &metadata_json)?;

        Ok(Self::assemble(fs, layout, config, Arc::new(ProcessProbe)))
    }

    /// Open an existing repository on `fs`
    ///
    /// Opening reads only; a dirty repository stays dirty until the next
    /// mutating operation or an explicit [`Repository::regress`].
    ///
    /// # Errors
    ///
    /// - [`RetrobakError::NotInitialized`] if there is no `data/metadata.json`
    /// - [`RetrobakError::InvalidConfiguration`] for an unknown format version
    #[instrument(skip(fs))]
    pub fn open(fs: Arc<dyn FileSystemAccess>) -> Result<Self> {
        let metadata_path = RepoLayout::new(PathCodec::minimal()).metadata();
        if !fs.exists(&metadata_path)? {
            return Err(RetrobakError::NotInitialized(metadata_path));
        }
        let metadata: RepositoryMetadata = serde_json::from_slice(&fs.read(&metadata_path)?)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(RetrobakError::InvalidConfiguration(format!(
                "repository format {} is not supported",
                metadata.format_version
            )));
        }
        let config_path = RepoLayout::new(PathCodec::minimal()).config();
        let config: RepositoryConfig = if fs.exists(&config_path)? {
            serde_json::from_slice(&fs.read(&config_path)?)?
        } else {
            warn!("config.json is missing, using defaults");
            RepositoryConfig::default()
        };
        config.validate()?;
        let layout = RepoLayout::new(config.codec()?);
        debug!("opened repository created {} by {}", metadata.created_at, metadata.version);
        Ok(Self::assemble(fs, layout, config, Arc::new(ProcessProbe)))
    }

    fn assemble(
        fs: Arc<dyn FileSystemAccess>,
        layout: RepoLayout,
        config: RepositoryConfig,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            fs,
            layout,
            config,
            probe,
            session_lock: Mutex::new(()),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Locations inside the repository
    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// Filesystem the repository lives on
    pub fn fs(&self) -> &dyn FileSystemAccess {
        self.fs.as_ref()
    }

    fn codec(&self) -> DeltaCodec {
        DeltaCodec::new(self.config.delta_block_size)
    }

    fn regressor(&self) -> Regressor<'_> {
        Regressor::new(
            self.fs.as_ref(),
            &self.layout,
            self.config.compression,
            self.codec(),
            self.probe.as_ref(),
        )
    }

    fn restorer(&self) -> Restorer<'_> {
        Restorer::new(self.fs.as_ref(), &self.layout, self.config.compression, self.codec())
    }

    fn manifests(&self) -> ManifestStore<'_> {
        ManifestStore::new(self.fs.as_ref(), &self.layout)
    }

    /// Run one backup session stamped with the current time
    ///
    /// See [`Repository::backup_at`].
    pub fn backup<I>(&self, source_fs: &dyn FileSystemAccess, entries: I) -> Result<SessionReport>
    where
        I: IntoIterator<Item = Result<SourceEntry>>,
    {
        self.backup_at(SessionTime::now(), source_fs, entries)
    }

    /// Run one backup session stamped `time`
    ///
    /// Regresses an unterminated session first, then mirrors `entries`
    /// (which must arrive in component order) and writes a reverse
    /// increment for every change. The initial session writes no
    /// increments.
    ///
    /// # Arguments
    ///
    /// * `time` - Session stamp; must be after the last committed session
    /// * `source_fs` - Filesystem the entries' content is read from
    /// * `entries` - Selection layer output, e.g. a [`SourceScanner`]
    ///
    /// # Returns
    ///
    /// The session report. Per-entry failures are listed in it; the session
    /// still committed.
    ///
    /// # Errors
    ///
    /// - [`RetrobakError::Conflict`] if another live session owns the repository
    /// - [`RetrobakError::SessionNotAfter`] if `time` is not after the last session
    /// - [`RetrobakError::SourceOrder`] if entries arrive out of order
    /// - [`RetrobakError::FatalRepository`] / [`RetrobakError::Integrity`] when
    ///   the repository cannot be brought into a consistent state
    #[instrument(skip(self, source_fs, entries), fields(session = %time))]
    pub fn backup_at<I>(&self, time: SessionTime, source_fs: &dyn FileSystemAccess, entries: I) -> Result<SessionReport>
    where
        I: IntoIterator<Item = Result<SourceEntry>>,
    {
        let _guard = self.session_lock.lock();
        self.regress_locked()?;
        let report = RepositoryShadow::new(self.fs.as_ref(), &self.layout, &self.config).run(time, source_fs, entries)?;
        info!(
            "session {} committed: {} new, {} changed, {} deleted, {} errors",
            report.session,
            report.stats.new_files,
            report.stats.changed_files,
            report.stats.deleted_files,
            report.errors.len()
        );
        Ok(report)
    }

    /// Back up a whole source tree, skipping paths matching `excludes`
    pub fn backup_tree(&self, source_fs: &dyn FileSystemAccess, excludes: &[&str]) -> Result<SessionReport> {
        let scanner = SourceScanner::new(source_fs).with_exclude_patterns(excludes)?;
        self.backup(source_fs, scanner)
    }

    /// Undo an unterminated session, if any
    ///
    /// # Errors
    ///
    /// - [`RetrobakError::Conflict`] if the session's owner is still alive
    /// - [`RetrobakError::Integrity`] if the mirror matches neither side of
    ///   an increment; the marker stays in place
    pub fn regress(&self) -> Result<RegressOutcome> {
        let _guard = self.session_lock.lock();
        self.regress_locked()
    }

    fn regress_locked(&self) -> Result<RegressOutcome> {
        self.regressor().run()
    }

    /// Whether an unterminated session awaits regression
    pub fn needs_regress(&self) -> Result<bool> {
        self.regressor().is_dirty()
    }

    /// Restore the tree as of `as_of` into `target`
    ///
    /// Uses the latest committed session at or before `as_of`. Metadata
    /// blobs are handed to `metadata`.
    #[instrument(skip(self, target, metadata))]
    pub fn restore(
        &self,
        as_of: SessionTime,
        target: &dyn FileSystemAccess,
        metadata: &dyn MetadataChannel,
    ) -> Result<RestoreReport> {
        let _guard = self.session_lock.lock();
        self.regress_locked()?;
        self.restorer()
            .restore(as_of, target, metadata, self.config.restore_ownership)
    }

    /// State of one entry as of `as_of`, `None` if it did not exist then
    pub fn reconstruct(&self, path: &RepoPath, as_of: SessionTime) -> Result<Option<Reconstructed>> {
        let _guard = self.session_lock.lock();
        self.regress_locked()?;
        self.restorer().reconstruct(path, as_of)
    }

    /// Committed sessions, oldest first
    pub fn list_sessions(&self) -> Result<Vec<SessionTime>> {
        let pending = MarkerStore::new(self.fs.as_ref(), &self.layout)
            .read()?
            .map(|m| m.session);
        Ok(self
            .manifests()
            .list_sessions()?
            .into_iter()
            .filter(|s| Some(*s) != pending)
            .collect())
    }

    /// Increments stored for `path`, oldest first
    pub fn list_increments(&self, path: &RepoPath) -> Result<Vec<IncrementInfo>> {
        let pending = MarkerStore::new(self.fs.as_ref(), &self.layout)
            .read()?
            .map(|m| m.session);
        let store = IncrementStore::new(self.fs.as_ref(), &self.layout, self.config.compression);
        store
            .for_path(path)?
            .iter()
            .filter(|f| Some(f.session) != pending)
            .map(|f| store.info(f))
            .collect()
    }

    /// Statistics recorded for a committed session
    pub fn session_statistics(&self, session: SessionTime) -> Result<SessionStats> {
        self.manifests().load_statistics(session)
    }

    /// Entries that failed during a committed session
    ///
    /// Only sessions that hit per-entry errors keep a log; the others
    /// yield an empty list.
    pub fn session_errors(&self, session: SessionTime) -> Result<Vec<EntryError>> {
        self.manifests().load_error_log(session)
    }

    /// Forget sessions older than `cutoff`
    ///
    /// Sessions at or after `cutoff` stay restorable; the latest session is
    /// always kept. Increments, manifests, statistics and error logs needed
    /// by no kept session are deleted. The mirror is never touched.
    ///
    /// # Errors
    ///
    /// [`RetrobakError::FatalRepository`] while an unterminated session
    /// awaits regression.
    #[instrument(skip(self))]
    pub fn remove_older_than(&self, cutoff: SessionTime) -> Result<PruneReport> {
        let _guard = self.session_lock.lock();
        if let Some(marker) = MarkerStore::new(self.fs.as_ref(), &self.layout).read()? {
            return Err(RetrobakError::fatal(format!(
                "session {} is unterminated; regress before removing old sessions",
                marker.session
            )));
        }

        let manifests = self.manifests();
        let sessions = manifests.list_sessions()?;
        let mut report = PruneReport::default();
        let oldest_kept = match sessions.iter().find(|s| **s >= cutoff).or(sessions.last()) {
            Some(session) => *session,
            None => return Ok(report),
        };

        let store = IncrementStore::new(self.fs.as_ref(), &self.layout, self.config.compression);
        for file in store.all()?.into_iter().filter(|f| f.session <= oldest_kept) {
            let size = self.fs.lstat(&file.location)?.map(|s| s.size).unwrap_or(0);
            store.remove(&file)?;
            report.increments_removed += 1;
            report.bytes_freed += size;
        }
        store.prune_empty_dirs()?;

        for session in sessions.into_iter().filter(|s| *s < oldest_kept) {
            for location in manifests.session_files(session) {
                if let Some(state) = self.fs.lstat(&location)? {
                    report.bytes_freed += state.size;
                }
            }
            manifests.remove(session)?;
            report.sessions_removed.push(session);
        }

        info!(
            "removed {} sessions and {} increments before {}",
            report.sessions_removed.len(),
            report.increments_removed,
            oldest_kept
        );
        Ok(report)
    }
}

/// Builder for opening or creating a [`Repository`]
///
/// # Default Values
///
/// - `quoting`: empty (minimal escaping)
/// - `compression`: `PayloadCompression::Lz4`
/// - `delta_block_size`: 16 KiB
/// - `parallel_workers`: number of CPU cores
/// - `batch_size`: 256
/// - `preserve_hardlinks`: true
/// - `restore_ownership`: false
#[derive(Debug)]
pub struct RepositoryBuilder {
    config: RepositoryConfig,
    probe: Option<Arc<dyn LivenessProbe>>,
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryBuilder {
    /// Create a new builder with default settings
    ///
    /// # Examples
    ///
    /// ```rust
    /// use retrobak::RepositoryBuilder;
    ///
    /// let builder = RepositoryBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            config: RepositoryConfig::default(),
            probe: None,
        }
    }

    /// Set extra characters to escape in mirror names
    ///
    /// Only used when a new repository is created.
    ///
    /// # Arguments
    ///
    /// * `chars` - ASCII characters to escape, e.g. `A-Z` as a literal list
    ///   for case-insensitive mirror filesystems
    ///
    /// # Examples
    ///
    /// ```rust
    /// use retrobak::RepositoryBuilder;
    ///
    /// let builder = RepositoryBuilder::new().quoting("ABCDEFGHIJKLMNOPQRSTUVWXYZ");
    /// ```
    pub fn quoting(mut self, chars: impl Into<String>) -> Self {
        self.config.quoting = chars.into();
        self
    }

    /// Set increment payload compression
    ///
    /// # Examples
    ///
    /// ```rust
    /// use retrobak::{PayloadCompression, RepositoryBuilder};
    ///
    /// let builder = RepositoryBuilder::new().compression(PayloadCompression::None);
    /// ```
    pub fn compression(mut self, compression: PayloadCompression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the signature block size used for deltas
    pub fn delta_block_size(mut self, size: u32) -> Self {
        self.config.delta_block_size = size;
        self
    }

    /// Set number of parallel workers
    ///
    /// # Arguments
    ///
    /// * `count` - Number of threads preparing content (minimum 1)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use retrobak::RepositoryBuilder;
    ///
    /// let builder = RepositoryBuilder::new().parallel_workers(4);
    /// ```
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// Set how many entries are prepared per batch
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    /// Keep hard link groups as hard links in the mirror
    pub fn preserve_hardlinks(mut self, preserve: bool) -> Self {
        self.config.preserve_hardlinks = preserve;
        self
    }

    /// Restore uid/gid when restoring
    pub fn restore_ownership(mut self, restore: bool) -> Self {
        self.config.restore_ownership = restore;
        self
    }

    /// Replace the probe deciding whether a marker's owner is alive
    pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Create a new repository on `fs`
    pub fn init(self, fs: Arc<dyn FileSystemAccess>) -> Result<Repository> {
        let mut repo = Repository::init(fs, self.config)?;
        if let Some(probe) = self.probe {
            repo.probe = probe;
        }
        Ok(repo)
    }

    /// Open an existing repository on `fs`
    ///
    /// The builder's runtime settings (workers, batch size, ownership)
    /// override the stored ones; everything else comes from `config.json`.
    pub fn open(self, fs: Arc<dyn FileSystemAccess>) -> Result<Repository> {
        let mut repo = Repository::open(fs)?;
        repo.config.parallel_workers = self.config.parallel_workers;
        repo.config.batch_size = self.config.batch_size;
        repo.config.restore_ownership = self.config.restore_ownership;
        if let Some(probe) = self.probe {
            repo.probe = probe;
        }
        Ok(repo)
    }

    /// Open the repository on `fs`, creating it if needed
    ///
    /// # Examples
    ///
    /// ```rust
    /// use retrobak::memory_fs::MemoryFs;
    /// use retrobak::RepositoryBuilder;
    /// use std::sync::Arc;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let fs = Arc::new(MemoryFs::new());
    /// let repo = RepositoryBuilder::new().build(fs.clone())?;
    /// assert!(repo.list_sessions()?.is_empty());
    ///
    /// // a second build opens the same repository
    /// RepositoryBuilder::new().build(fs)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn build(self, fs: Arc<dyn FileSystemAccess>) -> Result<Repository> {
        let metadata = RepoLayout::new(PathCodec::minimal()).metadata();
        if fs.exists(&metadata)? {
            self.open(fs)
        } else {
            self.init(fs)
        }
    }

    /// [`RepositoryBuilder::build`] on a local directory, creating it if missing
    pub fn build_local(self, path: impl AsRef<Path>) -> Result<Repository> {
        let path: PathBuf = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        self.build(Arc::new(LocalFs::new(path)))
    }
}
