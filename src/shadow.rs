//! Repository shadow: one backup session against the mirror
//!
//! A session merges the ordered source stream against the last committed
//! manifest and, for every path that differs, writes an increment and then
//! mutates the mirror. The transaction marker is placed before the first
//! mutation and removed after the manifest, statistics and
//! `current_mirror` are in place; its removal is the commit.
//!
//! ## Pipeline
//!
//! 1. **Plan** (sequential): merge source against the old records, resolve
//!    hardlinks, order deletions deepest-first.
//! 2. **Prepare** (parallel, per batch): read source and mirror content,
//!    hash, compute and verify deltas.
//! 3. **Commit** (sequential, plan order): choose the increment type
//!    against the live record, write the increment, mutate the mirror.
//!    A failed mutation is rolled back through the same inversion
//!    regression uses; if the rollback fails the session aborts.
//!
//! Cancellation is a crash: nothing is cleaned up in process. Whatever was
//! written is undone by the next regression pass.

use crate::delta::DeltaCodec;
use crate::error::{EntryError, Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::hardlink::{promote_successor, HardlinkTracker, Resolution};
use crate::increment::{decide, unchanged, IncrementFile, IncrementHeader, IncrementRecord, IncrementStore};
use crate::layout::RepoLayout;
use crate::manifest::{Manifest, ManifestStore};
use crate::marker::{MarkerStore, SessionGuard, SessionMarker};
use crate::regress::revert_increment;
use crate::repository::RepositoryConfig;
use crate::types::{
    EntryKind, Fingerprint, IncrementKind, LinkRole, MirrorRecord, RepoPath, SessionReport, SessionStats,
    SessionTime, SourceEntry,
};
use crate::utils::{hash_data, staging_path};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Writes entries into the mirror area
///
/// Every replacement goes through a staging entry in `data/tmp` and a
/// rename, so a mirror path is always either its old or its new self.
/// Mirror files get owner read/write and directories owner rwx on top of
/// their recorded bits, so the repository stays readable to its owner.
#[derive(Debug, Clone, Copy)]
pub struct MirrorWriter<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
}

impl<'a> MirrorWriter<'a> {
    /// Writer over the repository filesystem
    pub fn new(fs: &'a dyn FileSystemAccess, layout: &'a RepoLayout) -> Self {
        Self { fs, layout }
    }

    /// Mirror location of a path
    pub fn location(&self, path: &RepoPath) -> PathBuf {
        self.layout.mirror_path(path)
    }

    /// Remove a mirror entry; directories must already be empty
    pub fn remove(&self, path: &RepoPath) -> io::Result<()> {
        let location = self.location(path);
        match self.fs.lstat(&location)? {
            None => Ok(()),
            Some(state) if state.kind.is_dir() => self.fs.remove_dir(&location),
            Some(_) => self.fs.remove_file(&location),
        }
    }

    /// Move a staged entry onto `location`, replacing what is there
    fn install(&self, staged: &Path, location: &Path) -> io::Result<()> {
        if self.fs.lstat(location)?.is_some_and(|s| s.kind.is_dir()) {
            self.fs.remove_dir(location)?;
        }
        if let Err(e) = self.fs.rename(staged, location) {
            let _ = self.fs.remove_file(staged);
            return Err(e);
        }
        Ok(())
    }

    /// Replace the entry with a regular file holding `content`
    pub fn put_file(&self, path: &RepoPath, content: &[u8]) -> io::Result<()> {
        let staged = staging_path(&self.layout.tmp_dir());
        self.fs.write(&staged, content)?;
        self.install(&staged, &self.location(path))
    }

    /// Make the entry a directory, keeping an existing one
    pub fn put_dir(&self, path: &RepoPath) -> io::Result<()> {
        let location = self.location(path);
        match self.fs.lstat(&location)? {
            Some(state) if state.kind.is_dir() => Ok(()),
            Some(_) => {
                self.fs.remove_file(&location)?;
                self.fs.create_dir(&location)
            }
            None => self.fs.create_dir(&location),
        }
    }

    /// Replace the entry with a symlink or special file
    pub fn put_special(&self, path: &RepoPath, kind: &EntryKind, permissions: u32) -> io::Result<()> {
        let staged = staging_path(&self.layout.tmp_dir());
        match kind.symlink_target() {
            Some(target) => self.fs.symlink(&target, &staged)?,
            None => self.fs.make_special(&staged, kind, permissions)?,
        }
        self.install(&staged, &self.location(path))
    }

    /// Hardlink the entry to `holder`, copying content if linking fails
    ///
    /// Returns `true` when a real hard link is in place.
    pub fn put_link(&self, path: &RepoPath, holder: &RepoPath, fallback: Option<&[u8]>) -> io::Result<bool> {
        let location = self.location(path);
        let holder_location = self.location(holder);
        if self.fs.same_file(&location, &holder_location)? {
            return Ok(true);
        }
        let staged = staging_path(&self.layout.tmp_dir());
        match self.fs.hard_link(&holder_location, &staged) {
            Ok(()) => {
                self.install(&staged, &location)?;
                trace!("linked {} to {}", path, holder);
                Ok(true)
            }
            Err(e) => {
                debug!("hard link {} -> {} failed ({}), copying content", path, holder, e);
                let content = match fallback {
                    Some(content) => content.to_vec(),
                    None => self.fs.read(&holder_location)?,
                };
                self.put_file(path, &content)?;
                Ok(false)
            }
        }
    }

    /// Apply recorded permissions and mtime
    pub fn apply_metadata(&self, record: &MirrorRecord) -> io::Result<()> {
        let location = self.location(&record.path);
        let state = &record.state;
        match state.kind {
            EntryKind::Symlink { .. } => {}
            EntryKind::Regular => self.fs.set_permissions(&location, state.permissions | 0o600)?,
            EntryKind::Directory => self.fs.set_permissions(&location, state.permissions | 0o700)?,
            _ => self.fs.set_permissions(&location, state.permissions)?,
        }
        self.fs.set_mtime(&location, state.mtime, state.mtime_nanos)
    }

    /// Recreate `record` as a standalone entry
    ///
    /// `content` is required for regular files. Hardlink annotations are
    /// not acted upon; link repair restores group structure afterwards.
    pub fn materialize(&self, record: &MirrorRecord, content: Option<&[u8]>) -> io::Result<()> {
        match &record.state.kind {
            EntryKind::Regular => {
                let content = content.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("no content to restore {}", record.path))
                })?;
                self.put_file(&record.path, content)?;
            }
            EntryKind::Directory => self.put_dir(&record.path)?,
            kind => self.put_special(&record.path, kind, record.state.permissions)?,
        }
        self.apply_metadata(record)
    }
}

/// Content-level view of one mirror entry
pub(crate) fn observe(
    fs: &dyn FileSystemAccess,
    location: &Path,
) -> io::Result<(Option<Fingerprint>, Option<Vec<u8>>)> {
    let Some(state) = fs.lstat(location)? else {
        return Ok((None, None));
    };
    if state.kind.is_regular() {
        let content = fs.read(location)?;
        let fingerprint = Fingerprint::new(state.kind, content.len() as u64, Some(hash_data(&content)));
        Ok((Some(fingerprint), Some(content)))
    } else {
        Ok((Some(Fingerprint::new(state.kind, 0, None)), None))
    }
}

/// One planned transition
#[derive(Debug)]
struct PlanItem {
    path: RepoPath,
    prior: Option<MirrorRecord>,
    source: Option<SourceEntry>,
    resolution: Resolution,
}

/// Content-heavy work done ahead of commit
#[derive(Debug, Default)]
struct Prepared {
    new: Option<MirrorRecord>,
    /// New content, when it must be written or linked
    content: Option<Vec<u8>>,
    /// Mirror content before the session
    old_content: Option<Vec<u8>>,
    reverse_delta: Option<Vec<u8>>,
    /// Bytes a transfer would move: forward delta or full content
    transfer: u64,
}

/// Runs backup sessions against one repository
#[derive(Debug)]
pub struct RepositoryShadow<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
    config: &'a RepositoryConfig,
    codec: DeltaCodec,
}

/// Mutable state of a running session
struct Session<'s> {
    time: SessionTime,
    previous: Option<SessionTime>,
    working: BTreeMap<RepoPath, MirrorRecord>,
    tracker: HardlinkTracker,
    stats: SessionStats,
    errors: Vec<EntryError>,
    seq: u64,
    source_fs: &'s dyn FileSystemAccess,
}

impl Session<'_> {
    fn fail(&mut self, path: &RepoPath, err: &RetrobakError) {
        warn!("{}: {}", path, err);
        self.stats.errors += 1;
        self.errors.push(EntryError::from_error(path, err));
    }
}

impl<'a> RepositoryShadow<'a> {
    /// Shadow over the repository filesystem
    pub fn new(fs: &'a dyn FileSystemAccess, layout: &'a RepoLayout, config: &'a RepositoryConfig) -> Self {
        Self {
            fs,
            layout,
            config,
            codec: DeltaCodec::new(config.delta_block_size),
        }
    }

    fn writer(&self) -> MirrorWriter<'a> {
        MirrorWriter::new(self.fs, self.layout)
    }

    fn store(&self) -> IncrementStore<'a> {
        IncrementStore::new(self.fs, self.layout, self.config.compression)
    }

    /// Run one session stamped `time` over `entries`
    ///
    /// The caller must have regressed the repository first. Entries must
    /// arrive in component order; anything else aborts the session with
    /// [`RetrobakError::SourceOrder`] and leaves the marker for regression.
    #[instrument(skip(self, source_fs, entries), fields(session = %time))]
    pub fn run<I>(&self, time: SessionTime, source_fs: &dyn FileSystemAccess, entries: I) -> Result<SessionReport>
    where
        I: IntoIterator<Item = Result<SourceEntry>>,
    {
        let started = Instant::now();
        let manifests = ManifestStore::new(self.fs, self.layout);
        let markers = MarkerStore::new(self.fs, self.layout);

        if let Some(marker) = markers.read()? {
            return Err(RetrobakError::fatal(format!(
                "session {} was not regressed before starting a new one",
                marker.session
            )));
        }
        let previous = manifests.read_current()?;
        if let Some(previous) = previous {
            if time <= previous {
                return Err(RetrobakError::SessionNotAfter {
                    previous: previous.stamp(),
                    requested: time.stamp(),
                });
            }
        }
        let old = match previous {
            Some(previous) => {
                if !self.fs.exists(&self.layout.mirror_root())? {
                    return Err(RetrobakError::fatal("mirror root is missing"));
                }
                manifests.load_or_rebuild(previous)?.records
            }
            None => BTreeMap::new(),
        };

        let marker = SessionMarker::for_current_process(time, previous);
        markers.write(&marker)?;
        let _guard = SessionGuard::register(&marker);
        info!(
            "session {} started (previous: {})",
            time,
            previous.map(|p| p.stamp()).unwrap_or_else(|| "none".to_string())
        );

        self.fs
            .clear_dir(&self.layout.tmp_dir())
            .map_err(|e| RetrobakError::fatal(format!("cannot clear staging area: {e}")))?;
        if previous.is_none() {
            self.writer()
                .put_dir(&RepoPath::root())
                .map_err(|e| RetrobakError::fatal(format!("cannot create mirror root: {e}")))?;
        }

        let mut session = Session {
            time,
            previous,
            working: old.clone(),
            tracker: HardlinkTracker::new(self.config.preserve_hardlinks),
            stats: SessionStats {
                session: Some(time),
                start_time: Some(Utc::now()),
                ..Default::default()
            },
            errors: Vec::new(),
            seq: 0,
            source_fs,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers.max(1))
            .build()
            .map_err(|e| RetrobakError::internal(format!("cannot build worker pool: {e}")))?;

        let old_paths: Vec<RepoPath> = old.keys().cloned().collect();
        let mut cursor = 0;
        let mut last: Option<RepoPath> = None;
        let mut unreadable: Vec<RepoPath> = Vec::new();
        let mut plan: Vec<PlanItem> = Vec::with_capacity(self.config.batch_size);

        for item in entries {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = match &e {
                        RetrobakError::TransientIo { path, .. } => RepoPath::new(path).unwrap_or_default(),
                        _ => RepoPath::root(),
                    };
                    session.fail(&path, &e);
                    unreadable.push(path);
                    continue;
                }
            };
            if let Some(before) = &last {
                if entry.path <= *before {
                    error!("source entry {} arrived after {}", entry.path, before);
                    return Err(RetrobakError::SourceOrder {
                        previous: before.as_path().to_path_buf(),
                        current: entry.path.as_path().to_path_buf(),
                    });
                }
            }
            last = Some(entry.path.clone());
            session.stats.source_files += 1;
            if entry.state.kind.is_regular() {
                session.stats.source_file_size += entry.state.size;
            }

            // old paths the source skipped over are gone
            let start = cursor;
            while cursor < old_paths.len() && old_paths[cursor] < entry.path {
                cursor += 1;
            }
            self.plan_deletions(&old_paths[start..cursor], &old, &unreadable, &mut plan);

            let prior = old.get(&entry.path).cloned();
            if prior.is_some() {
                cursor += 1;
            }
            // a directory replaced by something else loses its subtree first
            if prior.as_ref().is_some_and(|p| p.state.kind.is_dir()) && !entry.state.kind.is_dir() {
                let start = cursor;
                while cursor < old_paths.len() && old_paths[cursor].starts_with(&entry.path) {
                    cursor += 1;
                }
                self.plan_deletions(&old_paths[start..cursor], &old, &unreadable, &mut plan);
            }

            let resolution = session.tracker.resolve(&entry.path, &entry.state);
            plan.push(PlanItem {
                path: entry.path.clone(),
                prior,
                source: Some(entry),
                resolution,
            });

            if plan.len() >= self.config.batch_size {
                self.flush(&pool, &mut session, &mut plan)?;
            }
        }
        self.plan_deletions(&old_paths[cursor..], &old, &unreadable, &mut plan);
        self.flush(&pool, &mut session, &mut plan)?;

        // commit
        session.stats.mirror_files = session.working.len() as u64;
        let ended = Utc::now();
        session.stats.end_time = Some(ended);
        session.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        let manifest = Manifest {
            session: time,
            records: std::mem::take(&mut session.working),
        };
        manifests
            .save(&manifest)
            .map_err(|e| RetrobakError::fatal(format!("cannot save manifest: {e}")))?;
        manifests
            .save_statistics(&session.stats, time)
            .map_err(|e| RetrobakError::fatal(format!("cannot save statistics: {e}")))?;
        if !session.errors.is_empty() {
            manifests
                .save_error_log(&session.errors, time)
                .map_err(|e| RetrobakError::fatal(format!("cannot save error log: {e}")))?;
        }
        manifests
            .write_current(Some(time))
            .map_err(|e| RetrobakError::fatal(format!("cannot update current_mirror: {e}")))?;
        markers
            .remove()
            .map_err(|e| RetrobakError::fatal(format!("cannot remove session marker: {e}")))?;

        info!(
            "session {} committed: {} new, {} changed, {} deleted, {} increments, {} errors",
            time,
            session.stats.new_files,
            session.stats.changed_files,
            session.stats.deleted_files,
            session.stats.increment_files,
            session.stats.errors
        );
        Ok(SessionReport {
            session: time,
            stats: session.stats,
            errors: session.errors,
        })
    }

    /// Queue deletions for a run of vanished paths, children first
    fn plan_deletions(
        &self,
        gone: &[RepoPath],
        old: &BTreeMap<RepoPath, MirrorRecord>,
        unreadable: &[RepoPath],
        plan: &mut Vec<PlanItem>,
    ) {
        for path in gone.iter().rev() {
            if path.is_root() {
                continue;
            }
            if unreadable.iter().any(|base| path.starts_with(base)) {
                trace!("keeping {}: source could not be read", path);
                continue;
            }
            plan.push(PlanItem {
                path: path.clone(),
                prior: old.get(path).cloned(),
                source: None,
                resolution: Resolution::Standalone,
            });
        }
    }

    fn flush(&self, pool: &rayon::ThreadPool, session: &mut Session<'_>, plan: &mut Vec<PlanItem>) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let source_fs = session.source_fs;
        let initial = session.previous.is_none();
        let prepared: Vec<Result<Prepared>> = pool.install(|| {
            plan.par_iter()
                .map(|item| self.prepare(item, source_fs, initial))
                .collect()
        });
        for (item, prepared) in plan.drain(..).zip(prepared) {
            match prepared {
                Ok(prepared) => self.commit(session, &item.path, prepared)?,
                Err(e) => session.fail(&item.path, &e),
            }
        }
        Ok(())
    }

    fn prepare(&self, item: &PlanItem, source_fs: &dyn FileSystemAccess, initial: bool) -> Result<Prepared> {
        let path = &item.path;
        let mut prepared = Prepared::default();

        if let Some(source) = &item.source {
            let link = if source.state.kind.is_regular() {
                item.resolution.link_role()
            } else {
                LinkRole::Standalone
            };
            let mut record = MirrorRecord {
                path: path.clone(),
                state: source.state.clone(),
                content_hash: None,
                metadata: source.metadata.clone(),
                link,
            };
            if record.state.kind.is_regular() {
                let reusable = item.prior.as_ref().filter(|p| {
                    p.state.kind.is_regular() && p.state.same_metadata(&record.state) && p.content_hash.is_some()
                });
                match reusable {
                    Some(prior) => record.content_hash = prior.content_hash.clone(),
                    None => {
                        let content = source_fs
                            .read(path.as_path())
                            .map_err(|e| RetrobakError::transient(path.as_path(), e))?;
                        record.state.size = content.len() as u64;
                        record.content_hash = Some(hash_data(&content));
                        prepared.content = Some(content);
                    }
                }
            }
            prepared.new = Some(record);
        }

        let Some(prior) = &item.prior else {
            prepared.transfer = prepared.content.as_ref().map_or(0, |c| c.len() as u64);
            return Ok(prepared);
        };
        if initial || !prior.state.kind.is_regular() {
            return Ok(prepared);
        }
        if let Some(new) = &prepared.new {
            if unchanged(prior, new) || (prior.link.holder().is_some() && prior.link.holder() == new.link.holder()) {
                return Ok(prepared);
            }
        }

        let location = self.layout.mirror_path(path);
        let old_content = self
            .fs
            .read(&location)
            .map_err(|e| RetrobakError::transient(path.as_path(), e))?;

        if let Some(new) = &prepared.new {
            if new.state.kind.is_regular() && new.link.holder().is_none() {
                if prepared.content.is_none() {
                    // same content, new link relation: rewrite to detach from the group
                    prepared.content = Some(old_content.clone());
                }
                if let Some(content) = &prepared.content {
                    if !old_content.is_empty() {
                        match self.deltas(path, &old_content, content, new.content_hash.as_deref(), prior) {
                            Ok((forward_len, reverse)) => {
                                prepared.transfer = forward_len;
                                prepared.reverse_delta = Some(reverse);
                            }
                            Err(e) => warn!("{}: delta failed, storing a snapshot: {}", path, e),
                        }
                    }
                }
            }
            if prepared.reverse_delta.is_none() {
                prepared.transfer = prepared.content.as_ref().map_or(0, |c| c.len() as u64);
            }
        }
        prepared.old_content = Some(old_content);
        Ok(prepared)
    }

    /// Forward delta (patched and checked) plus verified reverse delta
    fn deltas(
        &self,
        path: &RepoPath,
        old: &[u8],
        new: &[u8],
        new_hash: Option<&str>,
        prior: &MirrorRecord,
    ) -> Result<(u64, Vec<u8>)> {
        let forward = self.codec.forward_delta(old, new)?;
        let patched = self.codec.patch(old, &forward)?;
        if new_hash != Some(hash_data(&patched).as_str()) {
            return Err(RetrobakError::delta(format!("forward patch of {path} does not reproduce the source")));
        }
        let reverse = self.codec.reverse_delta(old, new)?;
        let restored = self.codec.patch(new, &reverse)?;
        if prior.content_hash.as_deref() != Some(hash_data(&restored).as_str()) {
            return Err(RetrobakError::delta(format!("reverse delta of {path} does not reproduce the mirror")));
        }
        Ok((forward.len() as u64, reverse))
    }

    fn commit(&self, session: &mut Session<'_>, path: &RepoPath, mut prepared: Prepared) -> Result<()> {
        let prior = session.working.get(path).cloned();

        // a link whose holder did not make it stays standalone
        if let Some(new) = prepared.new.as_mut() {
            if let Some(holder) = new.link.holder().cloned() {
                let holder_hash = session.working.get(&holder).and_then(|r| r.content_hash.clone());
                if holder_hash.is_none() || holder_hash != new.content_hash {
                    warn!("{}: holder {} is out of date, storing standalone", path, holder);
                    new.link = LinkRole::Standalone;
                }
            }
        }

        let kind = decide(prior.as_ref(), prepared.new.as_ref(), prepared.reverse_delta.is_some());
        let Some(kind) = kind else {
            return self.refresh(session, path, prepared);
        };

        if let Some(prior) = &prior {
            let stays_holder = prepared.new.as_ref().is_some_and(|n| n.link == LinkRole::Holder);
            if prior.link == LinkRole::Holder && !stays_holder {
                let fs = self.fs;
                let layout = self.layout;
                if let Some(successor) = promote_successor(&mut session.working, path, |p| {
                    p != path && fs.exists(&layout.mirror_path(p)).unwrap_or(false)
                }) {
                    debug!("{} takes over content of {}", successor, path);
                }
            }
        }

        let payload = match kind {
            IncrementKind::Diff => prepared.reverse_delta.take().unwrap_or_default(),
            _ => match &prior {
                Some(p) if p.state.kind.is_regular() => match prepared.old_content.take() {
                    Some(content) => content,
                    None => match self.fs.read(&self.layout.mirror_path(path)) {
                        Ok(content) => content,
                        Err(e) => {
                            session.fail(path, &RetrobakError::transient(path.as_path(), e));
                            return Ok(());
                        }
                    },
                },
                _ => Vec::new(),
            },
        };

        session.seq += 1;
        let record = IncrementRecord {
            header: IncrementHeader {
                path: path.clone(),
                session: session.time,
                seq: session.seq,
                kind,
                prior: prior.clone(),
                target: prepared.new.as_ref().map(MirrorRecord::fingerprint),
            },
            payload,
        };

        let mut written: Option<IncrementFile> = None;
        if session.previous.is_some() {
            let store = self.store();
            let encoded = store.encode(&record).and_then(|(framed, compressed)| {
                let file = store.write_encoded(&record.header, &framed, compressed)?;
                Ok((file, framed.len() as u64))
            });
            match encoded {
                Ok((file, size)) => {
                    session.stats.increment_files += 1;
                    session.stats.increment_file_size += size;
                    written = Some(file);
                }
                Err(e) => {
                    session.fail(path, &e);
                    return Ok(());
                }
            }
        }

        if let Err(e) = self.apply(path, prior.as_ref(), &prepared) {
            if path.is_root() {
                error!("mirror root could not be updated: {}", e);
                return Err(RetrobakError::fatal(format!("mirror root: {e}")));
            }
            self.rollback(&record, written.as_ref())?;
            session.fail(path, &RetrobakError::transient(path.as_path(), e));
            return Ok(());
        }
        trace!("{} committed as {} #{}", path, kind, session.seq);

        let stats = &mut session.stats;
        match (&prior, &prepared.new) {
            (None, Some(new)) => {
                stats.new_files += 1;
                stats.new_file_size += new.state.size;
            }
            (Some(old), None) => {
                stats.deleted_files += 1;
                stats.deleted_file_size += old.state.size;
            }
            (Some(old), Some(new)) => {
                stats.changed_files += 1;
                stats.changed_source_size += new.state.size;
                stats.changed_mirror_size += old.state.size;
            }
            (None, None) => {}
        }
        if prepared.content.is_some() {
            stats.bytes_transferred += prepared.transfer;
        }
        match prepared.new {
            Some(new) => session.working.insert(path.clone(), new),
            None => session.working.remove(path),
        };
        Ok(())
    }

    /// No increment needed; keep annotations fresh and links intact
    fn refresh(&self, session: &mut Session<'_>, path: &RepoPath, prepared: Prepared) -> Result<()> {
        let Some(new) = prepared.new else {
            return Ok(());
        };
        if let Some(holder) = new.link.holder() {
            if let Err(e) = self.writer().put_link(path, holder, prepared.content.as_deref()) {
                session.fail(path, &RetrobakError::transient(path.as_path(), e));
                return Ok(());
            }
        }
        session.working.insert(path.clone(), new);
        Ok(())
    }

    /// Make the mirror entry match the new record
    fn apply(&self, path: &RepoPath, prior: Option<&MirrorRecord>, prepared: &Prepared) -> io::Result<()> {
        let writer = self.writer();
        let Some(new) = &prepared.new else {
            return writer.remove(path);
        };
        match &new.state.kind {
            EntryKind::Regular => {
                if let Some(holder) = new.link.holder() {
                    writer.put_link(path, holder, prepared.content.as_deref())?;
                    return Ok(());
                }
                let rewrite = match prior {
                    Some(p) => {
                        !p.state.kind.is_regular()
                            || p.content_hash != new.content_hash
                            || p.link.holder().is_some()
                    }
                    None => true,
                };
                if rewrite {
                    let content = match &prepared.content {
                        Some(content) => content.clone(),
                        None => self.fs.read(&writer.location(path))?,
                    };
                    writer.put_file(path, &content)?;
                }
            }
            EntryKind::Directory => writer.put_dir(path)?,
            kind => {
                if prior.map(|p| &p.state.kind) != Some(kind) {
                    writer.put_special(path, kind, new.state.permissions)?;
                }
            }
        }
        writer.apply_metadata(new)
    }

    /// Undo a failed commit; failure here is fatal
    fn rollback(&self, record: &IncrementRecord, written: Option<&IncrementFile>) -> Result<()> {
        let path = &record.header.path;
        let result = revert_increment(self.fs, self.layout, &self.codec, record).and_then(|_| match written {
            Some(file) => self.store().remove(file),
            None => Ok(()),
        });
        result.map_err(|e| {
            error!("rollback of {} failed: {}", path, e);
            RetrobakError::fatal(format!("could not roll back {path}: {e}"))
        })
    }
}
