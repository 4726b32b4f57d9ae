//! Increment decision and storage
//!
//! [`decide`] is the pure rule choosing an increment type for one entry
//! transition. [`IncrementStore`] materializes increments under the
//! increments area and reads them back for regression and restore.
//!
//! An increment file is a framed (optionally lz4) bincode
//! [`IncrementRecord`]: a header describing the transition and a payload
//! whose meaning depends on the kind:
//!
//! | kind       | payload                                     |
//! |------------|---------------------------------------------|
//! | `diff`     | reverse delta, new content -> old content   |
//! | `snapshot` | full prior content (empty if prior absent)  |
//! | `deleted`  | full prior content for regular files        |
//! | `special`  | full prior content if the prior was regular |

use crate::compression::PayloadCompression;
use crate::error::{Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::layout::RepoLayout;
use crate::types::{Fingerprint, IncrementInfo, IncrementKind, LinkRole, MirrorRecord, RepoPath, SessionTime};
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Describes one entry transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementHeader {
    /// Entry the increment belongs to
    pub path: RepoPath,
    /// Session that produced it
    pub session: SessionTime,
    /// Production order within the session
    pub seq: u64,
    /// Increment type
    pub kind: IncrementKind,
    /// Entry before the session; `None` means it did not exist
    pub prior: Option<MirrorRecord>,
    /// Mirror fingerprint after the session; `None` means removed
    pub target: Option<Fingerprint>,
}

impl IncrementHeader {
    /// Fingerprint the mirror had before the session
    pub fn prior_fingerprint(&self) -> Option<Fingerprint> {
        self.prior.as_ref().map(MirrorRecord::fingerprint)
    }
}

/// Header plus payload, as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRecord {
    /// Transition description
    pub header: IncrementHeader,
    /// Kind-dependent payload
    pub payload: Vec<u8>,
}

/// One increment file found in the increments area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementFile {
    /// Entry it belongs to
    pub path: RepoPath,
    /// Session that produced it
    pub session: SessionTime,
    /// Increment type
    pub kind: IncrementKind,
    /// Whether the payload is lz4 framed
    pub compressed: bool,
    /// Location relative to the repository root
    pub location: PathBuf,
}

fn same_link_relation(old: &LinkRole, new: &LinkRole) -> bool {
    old.holder() == new.holder()
}

/// Whether a transition leaves nothing to record
pub fn unchanged(old: &MirrorRecord, new: &MirrorRecord) -> bool {
    old.state.same_metadata(&new.state)
        && old.metadata == new.metadata
        && same_link_relation(&old.link, &new.link)
}

/// Choose the increment type for a transition, `None` when nothing changed
///
/// `diffable` says whether a signature of the prior content can be
/// obtained. `diff` is only chosen between two regular files, and never
/// when the new entry becomes a hardlink: its content will then follow the
/// holder, so the increment must not depend on it.
pub fn decide(
    old: Option<&MirrorRecord>,
    new: Option<&MirrorRecord>,
    diffable: bool,
) -> Option<IncrementKind> {
    match (old, new) {
        (None, None) => None,
        (None, Some(_)) => Some(IncrementKind::Snapshot),
        (Some(_), None) => Some(IncrementKind::Deleted),
        (Some(old), Some(new)) => {
            if let (Some(a), Some(b)) = (old.link.holder(), new.link.holder()) {
                if a == b {
                    return None;
                }
            }
            if unchanged(old, new) {
                return None;
            }
            if old.state.kind.is_regular() && new.state.kind.is_regular() {
                if diffable && new.link.holder().is_none() {
                    Some(IncrementKind::Diff)
                } else {
                    Some(IncrementKind::Snapshot)
                }
            } else {
                Some(IncrementKind::Special)
            }
        }
    }
}

/// Reads and writes increment files through a [`FileSystemAccess`]
#[derive(Debug)]
pub struct IncrementStore<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
    compression: PayloadCompression,
}

impl<'a> IncrementStore<'a> {
    /// Store rooted at the repository filesystem
    pub fn new(fs: &'a dyn FileSystemAccess, layout: &'a RepoLayout, compression: PayloadCompression) -> Self {
        Self { fs, layout, compression }
    }

    /// Serialize and frame a record without writing it
    pub fn encode(&self, record: &IncrementRecord) -> Result<(Vec<u8>, bool)> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        Ok(self.compression.encode(&bytes))
    }

    /// Write an already encoded record atomically, returning its file
    pub fn write_encoded(&self, header: &IncrementHeader, framed: &[u8], compressed: bool) -> Result<IncrementFile> {
        let location = self
            .layout
            .increment_path(&header.path, header.session, header.kind, compressed);
        let dir = self.layout.increment_dir(&header.path);
        self.fs
            .create_dir_all(&dir)
            .map_err(|e| RetrobakError::transient(header.path.as_path(), e))?;
        atomic_write(self.fs, &self.layout.tmp_dir(), &location, framed)
            .map_err(|e| RetrobakError::transient(header.path.as_path(), e))?;
        debug!("wrote {} increment #{} for {} ({} bytes)", header.kind, header.seq, header.path, framed.len());
        Ok(IncrementFile {
            path: header.path.clone(),
            session: header.session,
            kind: header.kind,
            compressed,
            location,
        })
    }

    /// Read and decode an increment file
    pub fn read(&self, file: &IncrementFile) -> Result<IncrementRecord> {
        let framed = self
            .fs
            .read(&file.location)
            .map_err(|e| RetrobakError::transient(file.path.as_path(), e))?;
        let bytes = PayloadCompression::decode(&framed)?;
        let (record, _): (IncrementRecord, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(record)
    }

    /// Delete an increment file
    pub fn remove(&self, file: &IncrementFile) -> Result<()> {
        trace!("removing increment {:?}", file.location);
        self.fs
            .remove_file(&file.location)
            .map_err(|e| RetrobakError::transient(file.path.as_path(), e))
    }

    /// Increments of one entry, oldest first
    pub fn for_path(&self, path: &RepoPath) -> Result<Vec<IncrementFile>> {
        let dir = self.layout.increment_dir(path);
        let stem = self.layout.increment_stem(path);
        let mut files = Vec::new();
        if !self.fs.exists(&dir)? {
            return Ok(files);
        }
        for name in self.fs.list_dir(&dir)? {
            let Some(name) = name.to_str() else { continue };
            let Some(parsed) = RepoLayout::parse_increment_name(name) else { continue };
            if parsed.encoded != stem {
                continue;
            }
            let location = dir.join(name);
            if self.fs.lstat(&location)?.is_some_and(|s| s.kind.is_dir()) {
                continue;
            }
            files.push(IncrementFile {
                path: path.clone(),
                session: parsed.session,
                kind: parsed.kind,
                compressed: parsed.compressed,
                location,
            });
        }
        files.sort_by_key(|f| f.session);
        Ok(files)
    }

    /// Every increment in the repository, in path then session order
    pub fn all(&self) -> Result<Vec<IncrementFile>> {
        let mut files = Vec::new();
        let root = self.layout.increments_root();
        if self.fs.exists(&root)? {
            self.walk(&root, &RepoPath::root(), &mut files)?;
        }
        files.sort_by(|a, b| a.path.cmp(&b.path).then(a.session.cmp(&b.session)));
        Ok(files)
    }

    fn walk(&self, dir: &Path, parent: &RepoPath, out: &mut Vec<IncrementFile>) -> Result<()> {
        for name in self.fs.list_dir(dir)? {
            let location = dir.join(&name);
            let is_dir = self.fs.lstat(&location)?.is_some_and(|s| s.kind.is_dir());
            let name = name.to_str().ok_or_else(|| {
                RetrobakError::PathCodec(format!("increment name is not UTF-8: {location:?}"))
            })?;
            if is_dir {
                let child = parent.join(self.layout.codec().decode_segment(name)?);
                self.walk(&location, &child, out)?;
                continue;
            }
            let Some(parsed) = RepoLayout::parse_increment_name(name) else {
                debug!("ignoring stray file in increments area: {:?}", location);
                continue;
            };
            let path = if parsed.encoded.is_empty() {
                parent.clone()
            } else {
                parent.join(self.layout.codec().decode_segment(&parsed.encoded)?)
            };
            out.push(IncrementFile {
                path,
                session: parsed.session,
                kind: parsed.kind,
                compressed: parsed.compressed,
                location,
            });
        }
        Ok(())
    }

    /// Remove directories left empty below the increments root
    pub fn prune_empty_dirs(&self) -> Result<()> {
        let root = self.layout.increments_root();
        if self.fs.exists(&root)? {
            self.prune(&root, true)?;
        }
        Ok(())
    }

    fn prune(&self, dir: &Path, is_root: bool) -> Result<bool> {
        let mut empty = true;
        for name in self.fs.list_dir(dir)? {
            let child = dir.join(name);
            if self.fs.lstat(&child)?.is_some_and(|s| s.kind.is_dir()) {
                if !self.prune(&child, false)? {
                    empty = false;
                }
            } else {
                empty = false;
            }
        }
        if empty && !is_root {
            self.fs.remove_dir(dir)?;
        }
        Ok(empty)
    }

    /// Listing form of an increment file
    pub fn info(&self, file: &IncrementFile) -> Result<IncrementInfo> {
        let size = self.fs.lstat(&file.location)?.map(|s| s.size).unwrap_or(0);
        Ok(IncrementInfo {
            path: file.path.clone(),
            session: file.session,
            kind: file.kind,
            compressed: file.compressed,
            size,
            file: file.location.clone(),
        })
    }
}
