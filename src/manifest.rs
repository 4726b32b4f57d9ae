//! Per-session manifests and the current-mirror pointer
//!
//! A manifest is the full set of [`MirrorRecord`]s after a session
//! committed. It is what the next session compares the source against and
//! what restore reads to know which entries existed at a point in time.
//! Manifests are bincode encoded and framed like increment payloads.

use crate::compression::PayloadCompression;
use crate::error::{EntryError, Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::layout::RepoLayout;
use crate::types::{EntryKind, LinkRole, MirrorRecord, RepoPath, SessionStats, SessionTime};
use crate::utils::{atomic_write, hash_data};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Mirror records of one committed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Session the records belong to
    pub session: SessionTime,
    /// Records in component order
    pub records: BTreeMap<RepoPath, MirrorRecord>,
}

impl Manifest {
    /// Empty manifest for a session
    pub fn new(session: SessionTime) -> Self {
        Self {
            session,
            records: BTreeMap::new(),
        }
    }

    /// Record of one path
    pub fn get(&self, path: &RepoPath) -> Option<&MirrorRecord> {
        self.records.get(path)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reads and writes manifests, statistics and `current_mirror`
#[derive(Debug)]
pub struct ManifestStore<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
}

impl<'a> ManifestStore<'a> {
    /// Store over the repository filesystem
    pub fn new(fs: &'a dyn FileSystemAccess, layout: &'a RepoLayout) -> Self {
        Self { fs, layout }
    }

    /// Persist a manifest atomically
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(manifest, bincode::config::standard())?;
        let (framed, _) = PayloadCompression::Lz4.encode(&bytes);
        atomic_write(self.fs, &self.layout.tmp_dir(), &self.layout.manifest(manifest.session), &framed)?;
        debug!(
            "stored manifest for {} ({} entries, {} bytes)",
            manifest.session,
            manifest.len(),
            framed.len()
        );
        Ok(())
    }

    /// Load the manifest of a session
    pub fn load(&self, session: SessionTime) -> Result<Manifest> {
        let path = self.layout.manifest(session);
        if !self.fs.exists(&path)? {
            return Err(RetrobakError::SessionNotFound(session.stamp()));
        }
        let framed = self.fs.read(&path)?;
        let bytes = PayloadCompression::decode(&framed)?;
        let (manifest, _): (Manifest, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(manifest)
    }

    /// Whether a manifest exists for a session
    pub fn exists(&self, session: SessionTime) -> Result<bool> {
        Ok(self.fs.exists(&self.layout.manifest(session))?)
    }

    /// Delete a session's manifest and statistics, ignoring absent files
    pub fn remove(&self, session: SessionTime) -> Result<()> {
        for path in self.session_files(session) {
            if self.fs.exists(&path)? {
                self.fs.remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Bookkeeping files that belong to one session
    pub fn session_files(&self, session: SessionTime) -> [std::path::PathBuf; 3] {
        [
            self.layout.manifest(session),
            self.layout.statistics(session),
            self.layout.error_log(session),
        ]
    }

    /// Sessions that have a manifest, oldest first
    pub fn list_sessions(&self) -> Result<Vec<SessionTime>> {
        let data = self.layout.data_dir();
        if !self.fs.exists(&data)? {
            return Ok(Vec::new());
        }
        let mut sessions: Vec<SessionTime> = self
            .fs
            .list_dir(&data)?
            .iter()
            .filter_map(|name| name.to_str().and_then(RepoLayout::parse_manifest_name))
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    /// Last committed session according to `current_mirror`
    pub fn read_current(&self) -> Result<Option<SessionTime>> {
        let path = self.layout.current_mirror();
        if !self.fs.exists(&path)? {
            return Ok(None);
        }
        let bytes = self.fs.read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        SessionTime::parse(text.trim())
            .map(Some)
            .map_err(|_| RetrobakError::fatal(format!("current_mirror is corrupt: {:?}", text.trim())))
    }

    /// Point `current_mirror` at a session, or remove it
    pub fn write_current(&self, session: Option<SessionTime>) -> Result<()> {
        let path = self.layout.current_mirror();
        match session {
            Some(session) => {
                atomic_write(self.fs, &self.layout.tmp_dir(), &path, session.stamp().as_bytes())?;
            }
            None => {
                if self.fs.exists(&path)? {
                    self.fs.remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Persist session statistics as pretty JSON
    pub fn save_statistics(&self, stats: &SessionStats, session: SessionTime) -> Result<()> {
        let json = serde_json::to_string_pretty(stats)?;
        atomic_write(self.fs, &self.layout.tmp_dir(), &self.layout.statistics(session), json.as_bytes())?;
        Ok(())
    }

    /// Load session statistics
    pub fn load_statistics(&self, session: SessionTime) -> Result<SessionStats> {
        let path = self.layout.statistics(session);
        if !self.fs.exists(&path)? {
            return Err(RetrobakError::SessionNotFound(session.stamp()));
        }
        let bytes = self.fs.read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist the entries that failed during a session
    pub fn save_error_log(&self, errors: &[EntryError], session: SessionTime) -> Result<()> {
        let json = serde_json::to_string_pretty(errors)?;
        atomic_write(self.fs, &self.layout.tmp_dir(), &self.layout.error_log(session), json.as_bytes())?;
        debug!("logged {} entry errors for session {}", errors.len(), session);
        Ok(())
    }

    /// Entries that failed during a session; empty when it logged none
    pub fn load_error_log(&self, session: SessionTime) -> Result<Vec<EntryError>> {
        let path = self.layout.error_log(session);
        if !self.fs.exists(&path)? {
            return Ok(Vec::new());
        }
        let bytes = self.fs.read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Manifest of `session`, rebuilt from the mirror if the file is gone
    ///
    /// Rebuilt records carry the mirror's own metadata and no hardlink or
    /// metadata-blob annotations, so the next session may see spurious
    /// changes. Content is never lost.
    pub fn load_or_rebuild(&self, session: SessionTime) -> Result<Manifest> {
        match self.load(session) {
            Ok(manifest) => Ok(manifest),
            Err(RetrobakError::SessionNotFound(_)) => {
                warn!("manifest for {} is missing, rebuilding from the mirror", session);
                self.rebuild_from_mirror(session)
            }
            Err(e) => Err(e),
        }
    }

    /// Scan the mirror into a manifest
    pub fn rebuild_from_mirror(&self, session: SessionTime) -> Result<Manifest> {
        let mut manifest = Manifest::new(session);
        let root = self.layout.mirror_root();
        if self.fs.exists(&root)? {
            self.scan(&root, &RepoPath::root(), &mut manifest)?;
        }
        Ok(manifest)
    }

    fn scan(&self, location: &Path, path: &RepoPath, manifest: &mut Manifest) -> Result<()> {
        let Some(state) = self.fs.lstat(location)? else {
            return Ok(());
        };
        let content_hash = match state.kind {
            EntryKind::Regular => Some(hash_data(&self.fs.read(location)?)),
            _ => None,
        };
        let is_dir = state.kind.is_dir();
        manifest.records.insert(
            path.clone(),
            MirrorRecord {
                path: path.clone(),
                state,
                content_hash,
                metadata: None,
                link: LinkRole::Standalone,
            },
        );
        if is_dir {
            for name in self.fs.list_dir(location)? {
                let raw = self
                    .layout
                    .codec()
                    .decode_segment(&name.to_string_lossy())?;
                self.scan(&location.join(&name), &path.join(raw), manifest)?;
            }
        }
        Ok(())
    }
}
