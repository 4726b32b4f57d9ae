//! Reconstructing past states from the mirror and its increments
//!
//! The content of a regular file as of session `S` is found by starting
//! from the current mirror entry and applying the entry's increments newer
//! than `S`, newest first. A `diff` patches the running content; any other
//! increment replaces it with its payload (the full prior content) or
//! clears it when the prior was not a regular file. Hardlinked entries
//! resolve through their group's data holder.

use crate::compression::PayloadCompression;
use crate::delta::DeltaCodec;
use crate::error::{EntryError, Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::increment::IncrementStore;
use crate::layout::RepoLayout;
use crate::manifest::{Manifest, ManifestStore};
use crate::source::MetadataChannel;
use crate::types::{EntryKind, IncrementKind, LinkRole, MirrorRecord, RepoPath, RestoreReport, SessionTime};
use crate::utils::hash_data;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// One entry as it existed at a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstructed {
    /// Session the state belongs to
    pub session: SessionTime,
    /// Recorded state
    pub record: MirrorRecord,
    /// Content for regular files
    pub content: Option<Vec<u8>>,
}

/// Reads historical states out of a repository
#[derive(Debug)]
pub struct Restorer<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
    compression: PayloadCompression,
    codec: DeltaCodec,
}

impl<'a> Restorer<'a> {
    /// Restorer over the repository filesystem
    pub fn new(
        fs: &'a dyn FileSystemAccess,
        layout: &'a RepoLayout,
        compression: PayloadCompression,
        codec: DeltaCodec,
    ) -> Self {
        Self {
            fs,
            layout,
            compression,
            codec,
        }
    }

    fn manifests(&self) -> ManifestStore<'a> {
        ManifestStore::new(self.fs, self.layout)
    }

    /// Latest committed session at or before `as_of`
    pub fn resolve_session(&self, as_of: SessionTime) -> Result<SessionTime> {
        let manifests = self.manifests();
        let current = manifests
            .read_current()?
            .ok_or_else(|| RetrobakError::SessionNotFound("repository has no committed session".to_string()))?;
        manifests
            .list_sessions()?
            .into_iter()
            .filter(|s| *s <= as_of && *s <= current)
            .next_back()
            .ok_or_else(|| RetrobakError::SessionNotFound(format!("no session at or before {as_of}")))
    }

    /// State of one path as of `as_of`, `None` if it did not exist then
    #[instrument(skip(self))]
    pub fn reconstruct(&self, path: &RepoPath, as_of: SessionTime) -> Result<Option<Reconstructed>> {
        let session = self.resolve_session(as_of)?;
        let manifest = self.manifests().load(session)?;
        self.reconstruct_in(&manifest, path)
    }

    fn reconstruct_in(&self, manifest: &Manifest, path: &RepoPath) -> Result<Option<Reconstructed>> {
        let Some(record) = manifest.get(path) else {
            return Ok(None);
        };
        let content = if record.state.kind.is_regular() {
            let source = match &record.link {
                LinkRole::Link { holder } => manifest.get(holder).unwrap_or(record),
                _ => record,
            };
            Some(self.content_at(source, manifest.session)?)
        } else {
            None
        };
        Ok(Some(Reconstructed {
            session: manifest.session,
            record: record.clone(),
            content,
        }))
    }

    /// Content of a regular `record` as of `session`
    fn content_at(&self, record: &MirrorRecord, session: SessionTime) -> Result<Vec<u8>> {
        let path = &record.path;
        let location = self.layout.mirror_path(path);
        let mut content = match self.fs.lstat(&location)? {
            Some(state) if state.kind.is_regular() => Some(self.fs.read(&location)?),
            _ => None,
        };

        let store = IncrementStore::new(self.fs, self.layout, self.compression);
        let mut newer: Vec<_> = store
            .for_path(path)?
            .into_iter()
            .filter(|f| f.session > session)
            .collect();
        newer.reverse();
        for file in &newer {
            let increment = store.read(file)?;
            content = match increment.header.kind {
                IncrementKind::Diff => {
                    let base = content.ok_or_else(|| {
                        RetrobakError::integrity(path.as_path(), format!("no base for diff from {}", file.session))
                    })?;
                    Some(self.codec.patch(&base, &increment.payload)?)
                }
                _ => match &increment.header.prior {
                    Some(prior) if prior.state.kind.is_regular() => Some(increment.payload),
                    _ => None,
                },
            };
        }

        let content = content.ok_or_else(|| {
            RetrobakError::integrity(path.as_path(), format!("no content survives back to {session}"))
        })?;
        if let Some(expected) = &record.content_hash {
            if *expected != hash_data(&content) {
                return Err(RetrobakError::integrity(
                    path.as_path(),
                    format!("reconstructed content does not match the record of {session}"),
                ));
            }
        }
        Ok(content)
    }

    /// Write the tree as of `as_of` into `target`
    ///
    /// Hardlink groups are recreated holder first; directory permissions
    /// and times are applied deepest-first once their contents are in
    /// place. Entries already present in `target` are replaced; entries not
    /// in the restored session are left alone.
    #[instrument(skip(self, target, metadata))]
    pub fn restore(
        &self,
        as_of: SessionTime,
        target: &dyn FileSystemAccess,
        metadata: &dyn MetadataChannel,
        restore_ownership: bool,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let session = self.resolve_session(as_of)?;
        let manifest = self.manifests().load(session)?;
        info!("restoring session {} ({} entries)", session, manifest.len());

        let mut report = RestoreReport {
            session: Some(session),
            ..Default::default()
        };
        let mut fail = |report: &mut RestoreReport, path: &RepoPath, err: RetrobakError| {
            warn!("restore of {} failed: {}", path, err);
            report.errors.push(EntryError::from_error(path, &err));
        };

        // pass 1: everything but links
        let mut links = Vec::new();
        for record in manifest.records.values() {
            if let LinkRole::Link { holder } = &record.link {
                if manifest.get(holder).is_some() {
                    links.push(record);
                    continue;
                }
            }
            if let Err(e) = self.restore_entry(&manifest, record, target, &mut report) {
                fail(&mut report, &record.path, e);
            }
        }

        // pass 2: links onto their holders
        for record in &links {
            if let Err(e) = self.restore_link(&manifest, record, target, &mut report) {
                fail(&mut report, &record.path, e);
            }
        }

        // pass 3: metadata, children before parents
        for record in manifest.records.values().rev() {
            let location = record.path.as_path();
            let result = (|| -> Result<()> {
                if !target.exists(location)? {
                    return Ok(());
                }
                if restore_ownership {
                    target.set_owner(location, record.state.uid, record.state.gid)?;
                }
                if !matches!(record.state.kind, EntryKind::Symlink { .. }) {
                    target.set_permissions(location, record.state.permissions)?;
                }
                target.set_mtime(location, record.state.mtime, record.state.mtime_nanos)?;
                if let Some(blob) = &record.metadata {
                    metadata.write(&record.path, blob)?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                fail(&mut report, &record.path, e);
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "restored {} files, {} directories, {} links, {} special entries ({} errors)",
            report.files_restored,
            report.directories_restored,
            report.links_restored,
            report.specials_restored,
            report.errors.len()
        );
        Ok(report)
    }

    fn restore_entry(
        &self,
        manifest: &Manifest,
        record: &MirrorRecord,
        target: &dyn FileSystemAccess,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let location = record.path.as_path();
        let existing = target.lstat(location)?;
        match &record.state.kind {
            EntryKind::Directory => {
                match existing {
                    Some(state) if state.kind.is_dir() => {}
                    Some(_) => {
                        target.remove_file(location)?;
                        target.create_dir(location)?;
                    }
                    None => target.create_dir(location)?,
                }
                report.directories_restored += 1;
            }
            EntryKind::Regular => {
                let content = self
                    .reconstruct_in(manifest, &record.path)?
                    .and_then(|r| r.content)
                    .unwrap_or_default();
                clear_for_replace(target, location, existing.as_ref().map(|s| &s.kind))?;
                target.write(location, &content)?;
                report.files_restored += 1;
                report.bytes_written += content.len() as u64;
            }
            kind => {
                clear_for_replace(target, location, existing.as_ref().map(|s| &s.kind))?;
                if existing.is_some() && target.exists(location)? {
                    target.remove_file(location)?;
                }
                match kind.symlink_target() {
                    Some(link_target) => target.symlink(&link_target, location)?,
                    None => target.make_special(location, kind, record.state.permissions)?,
                }
                report.specials_restored += 1;
            }
        }
        debug!("restored {}", record.path);
        Ok(())
    }

    fn restore_link(
        &self,
        manifest: &Manifest,
        record: &MirrorRecord,
        target: &dyn FileSystemAccess,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let LinkRole::Link { holder } = &record.link else {
            return Ok(());
        };
        let location = record.path.as_path();
        let existing = target.lstat(location)?;
        clear_for_replace(target, location, existing.as_ref().map(|s| &s.kind))?;
        if existing.is_some() && target.exists(location)? {
            target.remove_file(location)?;
        }
        match target.hard_link(holder.as_path(), location) {
            Ok(()) => report.links_restored += 1,
            Err(e) => {
                debug!("cannot link {} to {} ({}), copying", record.path, holder, e);
                let content = match target.read(holder.as_path()) {
                    Ok(content) => content,
                    Err(_) => self
                        .reconstruct_in(manifest, &record.path)?
                        .and_then(|r| r.content)
                        .unwrap_or_default(),
                };
                target.write(location, &content)?;
                report.files_restored += 1;
                report.bytes_written += content.len() as u64;
            }
        }
        Ok(())
    }
}

/// Make room for a non-directory at `location`
fn clear_for_replace(target: &dyn FileSystemAccess, location: &Path, existing: Option<&EntryKind>) -> Result<()> {
    match existing {
        Some(kind) if kind.is_dir() => target.remove_tree(location)?,
        Some(kind) if !kind.is_regular() => target.remove_file(location)?,
        _ => {}
    }
    Ok(())
}
