//! Where things live inside a repository
//!
//! ```text
//! <repo>/
//! ├── mirror/                          1:1 mirror, segments encoded
//! ├── increments/                      <encoded dir>/<encoded name>.<stamp>.<kind>[.lz4]
//! └── data/
//!     ├── metadata.json
//!     ├── config.json
//!     ├── current_mirror               stamp of the last committed session
//!     ├── session.marker               present only while a session runs
//!     ├── mirror_metadata.<stamp>.bin
//!     ├── session_statistics.<stamp>.json
//!     └── tmp/
//! ```
//!
//! Increments of the root entry have an empty name part (`.<stamp>.<kind>`),
//! which no encoded segment can produce.

use crate::path_codec::PathCodec;
use crate::types::{IncrementKind, RepoPath, SessionTime};
use std::path::PathBuf;

const MIRROR_DIR: &str = "mirror";
const INCREMENTS_DIR: &str = "increments";
const DATA_DIR: &str = "data";
const MANIFEST_PREFIX: &str = "mirror_metadata.";
const MANIFEST_SUFFIX: &str = ".bin";
const STATS_PREFIX: &str = "session_statistics.";
const STATS_SUFFIX: &str = ".json";
const ERROR_LOG_PREFIX: &str = "error_log.";
const COMPRESSED_SUFFIX: &str = ".lz4";

/// Parsed increment file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementName {
    /// Encoded entry name, empty for the root
    pub encoded: String,
    /// Session stamp
    pub session: SessionTime,
    /// Increment type
    pub kind: IncrementKind,
    /// Whether the file carries the `.lz4` suffix
    pub compressed: bool,
}

/// Path computations for one repository
#[derive(Debug, Clone)]
pub struct RepoLayout {
    codec: PathCodec,
}

impl RepoLayout {
    /// Layout using `codec` for every entry name
    pub fn new(codec: PathCodec) -> Self {
        Self { codec }
    }

    /// Codec in use
    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    /// Mirror area root
    pub fn mirror_root(&self) -> PathBuf {
        PathBuf::from(MIRROR_DIR)
    }

    /// Mirror location of an entry
    pub fn mirror_path(&self, path: &RepoPath) -> PathBuf {
        self.mirror_root().join(self.codec.encode_path(path))
    }

    /// Increments area root
    pub fn increments_root(&self) -> PathBuf {
        PathBuf::from(INCREMENTS_DIR)
    }

    /// Directory holding the increments of an entry
    pub fn increment_dir(&self, path: &RepoPath) -> PathBuf {
        match path.parent() {
            Some(parent) => self.increments_root().join(self.codec.encode_path(&parent)),
            None => self.increments_root(),
        }
    }

    /// Encoded name part used in increment file names
    pub fn increment_stem(&self, path: &RepoPath) -> String {
        path.file_name()
            .map(|name| self.codec.encode_segment(name))
            .unwrap_or_default()
    }

    /// Full location of one increment file
    pub fn increment_path(
        &self,
        path: &RepoPath,
        session: SessionTime,
        kind: IncrementKind,
        compressed: bool,
    ) -> PathBuf {
        let mut name = format!("{}.{}.{}", self.increment_stem(path), session.stamp(), kind);
        if compressed {
            name.push_str(COMPRESSED_SUFFIX);
        }
        self.increment_dir(path).join(name)
    }

    /// Parse an increment file name
    pub fn parse_increment_name(name: &str) -> Option<IncrementName> {
        let (rest, compressed) = match name.strip_suffix(COMPRESSED_SUFFIX) {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let (rest, kind) = rest.rsplit_once('.')?;
        let kind = IncrementKind::parse(kind)?;
        let (encoded, stamp) = rest.rsplit_once('.')?;
        let session = SessionTime::parse(stamp).ok()?;
        Some(IncrementName {
            encoded: encoded.to_string(),
            session,
            kind,
            compressed,
        })
    }

    /// Bookkeeping directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(DATA_DIR)
    }

    /// Staging area for atomic writes
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    /// Transaction marker
    pub fn marker(&self) -> PathBuf {
        self.data_dir().join("session.marker")
    }

    /// Pointer to the last committed session
    pub fn current_mirror(&self) -> PathBuf {
        self.data_dir().join("current_mirror")
    }

    /// Repository metadata
    pub fn metadata(&self) -> PathBuf {
        self.data_dir().join("metadata.json")
    }

    /// Persisted configuration
    pub fn config(&self) -> PathBuf {
        self.data_dir().join("config.json")
    }

    /// Manifest of a session
    pub fn manifest(&self, session: SessionTime) -> PathBuf {
        self.data_dir()
            .join(format!("{MANIFEST_PREFIX}{}{MANIFEST_SUFFIX}", session.stamp()))
    }

    /// Statistics of a session
    pub fn statistics(&self, session: SessionTime) -> PathBuf {
        self.data_dir()
            .join(format!("{STATS_PREFIX}{}{STATS_SUFFIX}", session.stamp()))
    }

    /// Entries that failed during a session
    pub fn error_log(&self, session: SessionTime) -> PathBuf {
        self.data_dir()
            .join(format!("{ERROR_LOG_PREFIX}{}{STATS_SUFFIX}", session.stamp()))
    }

    /// Session stamp of a manifest file name
    pub fn parse_manifest_name(name: &str) -> Option<SessionTime> {
        let stamp = name.strip_prefix(MANIFEST_PREFIX)?.strip_suffix(MANIFEST_SUFFIX)?;
        SessionTime::parse(stamp).ok()
    }

    /// Session stamp of a statistics file name
    pub fn parse_statistics_name(name: &str) -> Option<SessionTime> {
        let stamp = name.strip_prefix(STATS_PREFIX)?.strip_suffix(STATS_SUFFIX)?;
        SessionTime::parse(stamp).ok()
    }
}
