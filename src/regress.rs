//! Regression: undoing an unterminated session
//!
//! A repository is `clean` when no marker exists and `dirty` otherwise.
//! Regressing a dirty repository walks the marker session's increments in
//! reverse production order and, for each, compares the live mirror entry
//! with the increment's recorded target and prior fingerprints:
//!
//! | mirror shows | action                                   |
//! |--------------|------------------------------------------|
//! | target       | apply the inverse (restore the prior)    |
//! | prior        | nothing was applied, skip                |
//! | absent       | interrupted replacement, restore prior   |
//! | other        | integrity error, stop and keep marker    |
//!
//! Each handled increment is deleted right away, so an interrupted
//! regression resumes where it stopped. The marker goes last.

use crate::compression::PayloadCompression;
use crate::delta::DeltaCodec;
use crate::error::{Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::increment::{IncrementRecord, IncrementStore};
use crate::layout::RepoLayout;
use crate::manifest::ManifestStore;
use crate::marker::{LivenessProbe, MarkerStore};
use crate::shadow::{observe, MirrorWriter};
use crate::types::{IncrementKind, LinkRole, SessionTime};
use crate::utils::{hash_data, staging_path};
use tracing::{debug, error, info, instrument, warn};

/// What a regression pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegressOutcome {
    /// No marker was present; nothing was touched
    Clean,
    /// An unterminated session was undone
    Regressed {
        /// Session that was undone
        session: SessionTime,
        /// Increments whose inverse was applied
        reverted: usize,
        /// Increments whose change never reached the mirror
        skipped: usize,
    },
}

/// Result of inverting a single increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversion {
    /// Prior state was restored
    Reverted,
    /// Mirror already showed the prior state
    Skipped,
}

/// Restore the mirror entry of `record` to its prior state
///
/// Safe to call whether or not the recorded change reached the mirror.
pub fn revert_increment(
    fs: &dyn FileSystemAccess,
    layout: &RepoLayout,
    codec: &DeltaCodec,
    record: &IncrementRecord,
) -> Result<Reversion> {
    let header = &record.header;
    let path = &header.path;
    let writer = MirrorWriter::new(fs, layout);
    let location = layout.mirror_path(path);
    let (current, content) = observe(fs, &location).map_err(|e| RetrobakError::transient(path.as_path(), e))?;

    let prior_fingerprint = header.prior_fingerprint();
    let interrupted = current.is_none() && header.prior.is_some() && header.kind != IncrementKind::Diff;
    if current != header.target && !interrupted {
        if current == prior_fingerprint {
            debug!("{}: change #{} never reached the mirror", path, header.seq);
            // content may be back while permissions and mtime are not
            if let Some(prior) = &header.prior {
                writer
                    .apply_metadata(prior)
                    .map_err(|e| RetrobakError::transient(path.as_path(), e))?;
            }
            return Ok(Reversion::Skipped);
        }
        error!("{}: mirror matches neither side of increment #{}", path, header.seq);
        return Err(RetrobakError::integrity(
            path.as_path(),
            format!(
                "mirror shows {:?}, increment expects {:?} or {:?}",
                current, header.target, prior_fingerprint
            ),
        ));
    }

    let Some(prior) = &header.prior else {
        writer.remove(path).map_err(|e| RetrobakError::transient(path.as_path(), e))?;
        debug!("{}: removed entry created by #{}", path, header.seq);
        return Ok(Reversion::Reverted);
    };

    let restored = if prior.state.kind.is_regular() {
        let bytes = match header.kind {
            IncrementKind::Diff => {
                let current = content
                    .ok_or_else(|| RetrobakError::integrity(path.as_path(), "diff base is not a regular file"))?;
                codec.patch(&current, &record.payload)?
            }
            _ => record.payload.clone(),
        };
        if prior.content_hash.is_some() && prior.content_hash.as_deref() != Some(hash_data(&bytes).as_str()) {
            return Err(RetrobakError::integrity(
                path.as_path(),
                format!("increment #{} does not reproduce the recorded content", header.seq),
            ));
        }
        Some(bytes)
    } else {
        None
    };
    writer
        .materialize(prior, restored.as_deref())
        .map_err(|e| RetrobakError::transient(path.as_path(), e))?;
    debug!("{}: restored {} state from #{}", path, prior.state.kind.label(), header.seq);
    Ok(Reversion::Reverted)
}

/// Detects and undoes unterminated sessions
#[derive(Debug)]
pub struct Regressor<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
    compression: PayloadCompression,
    codec: DeltaCodec,
    probe: &'a dyn LivenessProbe,
}

impl<'a> Regressor<'a> {
    /// Regressor over the repository filesystem
    pub fn new(
        fs: &'a dyn FileSystemAccess,
        layout: &'a RepoLayout,
        compression: PayloadCompression,
        codec: DeltaCodec,
        probe: &'a dyn LivenessProbe,
    ) -> Self {
        Self {
            fs,
            layout,
            compression,
            codec,
            probe,
        }
    }

    /// Whether a marker is present
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(MarkerStore::new(self.fs, self.layout).read()?.is_some())
    }

    /// Bring the repository back to its last committed session
    ///
    /// A clean repository is left untouched. A marker whose owner is still
    /// alive yields [`RetrobakError::Conflict`] without any mutation.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<RegressOutcome> {
        let markers = MarkerStore::new(self.fs, self.layout);
        let Some(marker) = markers.read()? else {
            return Ok(RegressOutcome::Clean);
        };
        if self.probe.is_alive(&marker) {
            warn!("session {} is still live (pid {} on {})", marker.session, marker.pid, marker.hostname);
            return Err(marker.conflict());
        }
        info!("regressing unterminated session {}", marker.session);

        let tmp = self.layout.tmp_dir();
        if self.fs.exists(&tmp)? {
            self.fs.clear_dir(&tmp)?;
        } else {
            self.fs.create_dir_all(&tmp)?;
        }

        let store = IncrementStore::new(self.fs, self.layout, self.compression);
        let mut pending = Vec::new();
        for file in store.all()?.into_iter().filter(|f| f.session == marker.session) {
            let record = store
                .read(&file)
                .map_err(|e| RetrobakError::fatal(format!("unreadable increment {:?}: {e}", file.location)))?;
            pending.push((file, record));
        }
        pending.sort_by(|a, b| b.1.header.seq.cmp(&a.1.header.seq));

        let (mut reverted, mut skipped) = (0, 0);
        for (file, record) in &pending {
            match revert_increment(self.fs, self.layout, &self.codec, record)? {
                Reversion::Reverted => reverted += 1,
                Reversion::Skipped => skipped += 1,
            }
            store.remove(file)?;
        }

        let manifests = ManifestStore::new(self.fs, self.layout);
        match marker.previous {
            None => {
                let mirror = self.layout.mirror_root();
                debug!("initial session: discarding mirror");
                self.fs.remove_tree(&mirror)?;
            }
            Some(previous) => self.repair_links(&manifests, previous)?,
        }
        store.prune_empty_dirs()?;
        manifests.remove(marker.session)?;
        match manifests.read_current() {
            Ok(current) if current == marker.previous => {}
            Ok(_) => manifests.write_current(marker.previous)?,
            Err(e) => {
                warn!("rewriting unreadable current_mirror: {}", e);
                manifests.write_current(marker.previous)?;
            }
        }
        markers.remove()?;

        info!(
            "regressed session {}: {} reverted, {} already clean",
            marker.session, reverted, skipped
        );
        Ok(RegressOutcome::Regressed {
            session: marker.session,
            reverted,
            skipped,
        })
    }

    /// Re-establish hard links recorded in the previous manifest
    fn repair_links(&self, manifests: &ManifestStore<'_>, previous: SessionTime) -> Result<()> {
        let manifest = match manifests.load(previous) {
            Ok(manifest) => manifest,
            Err(RetrobakError::SessionNotFound(_)) => {
                warn!("manifest for {} is missing, skipping link repair", previous);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let writer = MirrorWriter::new(self.fs, self.layout);
        let mut linkable = None;
        for record in manifest.records.values() {
            let LinkRole::Link { holder } = &record.link else {
                continue;
            };
            let location = writer.location(&record.path);
            let holder_location = writer.location(holder);
            if !self.fs.exists(&location)? || !self.fs.exists(&holder_location)? {
                continue;
            }
            if self.fs.same_file(&location, &holder_location)? {
                continue;
            }
            if self.fs.read(&location)? == self.fs.read(&holder_location)? {
                let supported = match linkable {
                    Some(supported) => supported,
                    None => *linkable.insert(self.linkable()?),
                };
                if !supported {
                    continue;
                }
            }
            debug!("relinking {} to {}", record.path, holder);
            writer
                .put_link(&record.path, holder, None)
                .map_err(|e| RetrobakError::transient(record.path.as_path(), e))?;
        }
        Ok(())
    }

    /// Whether the mirror filesystem keeps hard links
    fn linkable(&self) -> Result<bool> {
        let probe = staging_path(&self.layout.tmp_dir());
        self.fs.write(&probe, b"")?;
        let link = staging_path(&self.layout.tmp_dir());
        let supported = self.fs.hard_link(&probe, &link).is_ok();
        if supported {
            self.fs.remove_file(&link)?;
        }
        self.fs.remove_file(&probe)?;
        Ok(supported)
    }
}
