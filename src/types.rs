//! Core data types shared by the session, regression and restore paths
//!
//! ## Overview
//!
//! - **Identity**: [`RepoPath`], [`SessionTime`], [`FileIdentity`]
//! - **Entry state**: [`EntryKind`], [`EntryState`], [`SourceEntry`], [`MirrorRecord`],
//!   [`LinkRole`], [`Fingerprint`]
//! - **Increments**: [`IncrementKind`], [`IncrementInfo`]
//! - **Reports**: [`SessionStats`], [`SessionReport`], [`RestoreReport`], [`PruneReport`]

use crate::error::{EntryError, Result, RetrobakError};
use crate::path_codec::{bytes_to_os, os_to_bytes, PathCodec};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Timestamp identifying one backup session
///
/// Millisecond resolution, UTC. The on-disk form `YYYYMMDDTHHMMSSmmmZ` is
/// fixed width so lexicographic order equals chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionTime(DateTime<Utc>);

impl SessionTime {
    /// Current wall-clock time truncated to milliseconds
    pub fn now() -> Self {
        let ms = Utc::now().timestamp_millis();
        // a millisecond count taken from a valid DateTime always converts back
        Self(DateTime::from_timestamp_millis(ms).unwrap_or_default())
    }

    /// Build from milliseconds since the Unix epoch
    pub fn from_millis(ms: i64) -> Result<Self> {
        DateTime::from_timestamp_millis(ms)
            .map(Self)
            .ok_or_else(|| RetrobakError::InvalidConfiguration(format!("timestamp out of range: {ms}")))
    }

    /// Build from a chrono value, dropping sub-millisecond precision
    pub fn from_datetime(dt: DateTime<Utc>) -> Result<Self> {
        Self::from_millis(dt.timestamp_millis())
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Underlying chrono value
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Fixed-width on-disk stamp
    pub fn stamp(&self) -> String {
        self.0.format("%Y%m%dT%H%M%S%3fZ").to_string()
    }

    /// Parse an on-disk stamp
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || RetrobakError::InvalidConfiguration(format!("invalid session stamp: {s:?}"));
        let b = s.as_bytes();
        if !s.is_ascii() || b.len() != 19 || b[8] != b'T' || b[18] != b'Z' {
            return Err(bad());
        }
        let digits = |from: usize, to: usize| -> Result<u32> {
            let part = &s[from..to];
            if !part.bytes().all(|c| c.is_ascii_digit()) {
                return Err(bad());
            }
            part.parse::<u32>().map_err(|_| bad())
        };
        let (year, month, day) = (digits(0, 4)? as i32, digits(4, 6)?, digits(6, 8)?);
        let (hour, min, sec, milli) = (digits(9, 11)?, digits(11, 13)?, digits(13, 15)?, digits(15, 18)?);
        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_milli_opt(hour, min, sec, milli))
            .ok_or_else(bad)?;
        Ok(Self(Utc.from_utc_datetime(&naive)))
    }
}

impl fmt::Display for SessionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stamp())
    }
}

impl FromStr for SessionTime {
    type Err = RetrobakError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SessionTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.stamp())
    }
}

impl<'de> Deserialize<'de> for SessionTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Path of an entry relative to the backup root
///
/// Ordering is component-wise, which is the order the session consumes
/// source entries in: a directory sorts before its descendants and its
/// descendants sort before the directory's next sibling. The empty path is
/// the root itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RepoPath(PathBuf);

impl RepoPath {
    /// The backup root
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    /// Validate and wrap a relative path (no root, no `.`/`..`)
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut clean = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(seg) => clean.push(seg),
                Component::CurDir => {}
                _ => {
                    return Err(RetrobakError::PathCodec(format!(
                        "not a relative entry path: {path:?}"
                    )))
                }
            }
        }
        Ok(Self(clean))
    }

    /// Child entry of this path
    pub fn join(&self, name: impl AsRef<OsStr>) -> Self {
        Self(self.0.join(name.as_ref()))
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Last segment, `None` for the root
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    /// Whether this is the backup root
    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Whether `self` lies under (or equals) `base`
    pub fn starts_with(&self, base: &RepoPath) -> bool {
        self.0.starts_with(&base.0)
    }

    /// Raw segments in order
    pub fn segments(&self) -> impl Iterator<Item = &OsStr> {
        self.0.iter()
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.0.iter().count()
    }

    /// Borrow as a std path
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            write!(f, "{}", self.0.display())
        }
    }
}

impl FromStr for RepoPath {
    type Err = RetrobakError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<Path> for RepoPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// Serialized paths go through the minimal codec so non-UTF-8 names survive
// JSON and bincode alike.
impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let codec = PathCodec::minimal();
        let encoded: Vec<String> = self.segments().map(|s| codec.encode_segment(s)).collect();
        serializer.serialize_str(&encoded.join("/"))
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self::root());
        }
        let codec = PathCodec::minimal();
        let mut path = PathBuf::new();
        for seg in s.split('/') {
            path.push(codec.decode_segment(seg).map_err(serde::de::Error::custom)?);
        }
        Ok(Self(path))
    }
}

/// Source-side identity of a file: (device id, inode number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Device id
    pub device: u64,
    /// Inode number
    pub inode: u64,
}

/// Type of a filesystem entry
///
/// A missing entry is represented by the absence of a state, not a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link with its raw target bytes
    Symlink {
        /// Link target as stored by the OS
        target: Vec<u8>,
    },
    /// Named pipe
    Fifo,
    /// Character device
    CharDevice {
        /// Major device number
        major: u64,
        /// Minor device number
        minor: u64,
    },
    /// Block device
    BlockDevice {
        /// Major device number
        major: u64,
        /// Minor device number
        minor: u64,
    },
    /// Unix domain socket
    Socket,
}

impl EntryKind {
    /// Symlink pointing at `target`
    pub fn symlink(target: impl AsRef<Path>) -> Self {
        EntryKind::Symlink {
            target: os_to_bytes(target.as_ref().as_os_str()),
        }
    }

    /// Whether this is a regular file
    pub fn is_regular(&self) -> bool {
        matches!(self, EntryKind::Regular)
    }

    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    /// Symlink target as a path
    pub fn symlink_target(&self) -> Option<PathBuf> {
        match self {
            EntryKind::Symlink { target } => Some(PathBuf::from(bytes_to_os(target))),
            _ => None,
        }
    }

    /// Short label for logs and listings
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Regular => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::Fifo => "fifo",
            EntryKind::CharDevice { .. } => "chardev",
            EntryKind::BlockDevice { .. } => "blockdev",
            EntryKind::Socket => "socket",
        }
    }
}

/// Stat-level state of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    /// Entry type
    pub kind: EntryKind,
    /// Size in bytes (0 for directories and special files)
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Sub-second part of the modification time
    pub mtime_nanos: u32,
    /// Permission bits
    pub permissions: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Hard link count
    pub nlink: u64,
    /// Device/inode identity when the filesystem exposes one
    pub identity: Option<FileIdentity>,
}

impl EntryState {
    /// Plain state with the given kind and zeroed metadata
    pub fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            size: 0,
            mtime: 0,
            mtime_nanos: 0,
            permissions: 0o644,
            uid: 0,
            gid: 0,
            nlink: 1,
            identity: None,
        }
    }

    /// Whether the metadata used for change detection matches
    ///
    /// Size, modification time, type and permissions, plus ownership.
    /// Link count and inode identity are deliberately not compared.
    pub fn same_metadata(&self, other: &EntryState) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && self.mtime == other.mtime
            && self.mtime_nanos == other.mtime_nanos
            && self.permissions == other.permissions
            && self.uid == other.uid
            && self.gid == other.gid
    }
}

/// One entry yielded by the selection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Path relative to the source root
    pub path: RepoPath,
    /// Current state
    pub state: EntryState,
    /// Opaque extended attribute / ACL blob
    pub metadata: Option<Vec<u8>>,
}

/// Hardlink annotation persisted on a mirror record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LinkRole {
    /// Not part of a hardlink group
    #[default]
    Standalone,
    /// Owns the stored content of its group
    Holder,
    /// Shares the holder's content
    Link {
        /// Data holder of the group
        holder: RepoPath,
    },
}

impl LinkRole {
    /// Holder path when this is a link
    pub fn holder(&self) -> Option<&RepoPath> {
        match self {
            LinkRole::Link { holder } => Some(holder),
            _ => None,
        }
    }
}

/// Manifest entry describing one mirror path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    /// Path relative to the backup root
    pub path: RepoPath,
    /// Source state at the time the entry was committed
    pub state: EntryState,
    /// SHA-256 of the content for regular files
    pub content_hash: Option<String>,
    /// Opaque metadata blob copied from the source
    pub metadata: Option<Vec<u8>>,
    /// Hardlink annotation
    pub link: LinkRole,
}

impl MirrorRecord {
    /// Fingerprint the mirror should show for this record
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(
            self.state.kind.clone(),
            self.state.size,
            self.content_hash.clone(),
        )
    }
}

/// Content-level identity of a mirror entry
///
/// Regression compares the live mirror against recorded fingerprints to
/// decide whether an increment was applied. Permissions and times are not
/// part of it: mirror files carry adjusted permission bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Entry type
    pub kind: EntryKind,
    /// Content size (regular files only)
    pub size: u64,
    /// Content hash (regular files only)
    pub content_hash: Option<String>,
}

impl Fingerprint {
    /// Normalized fingerprint; size and hash only count for regular files
    pub fn new(kind: EntryKind, size: u64, content_hash: Option<String>) -> Self {
        if kind.is_regular() {
            Self { kind, size, content_hash }
        } else {
            Self { kind, size: 0, content_hash: None }
        }
    }
}

/// Type of an increment artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncrementKind {
    /// Reverse delta from the new content back to the old
    Diff,
    /// Full prior content, or "did not exist"
    Snapshot,
    /// Entry existed before and was removed
    Deleted,
    /// Non-regular transition (type change, metadata on special entries)
    Special,
}

impl IncrementKind {
    /// On-disk suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementKind::Diff => "diff",
            IncrementKind::Snapshot => "snapshot",
            IncrementKind::Deleted => "deleted",
            IncrementKind::Special => "special",
        }
    }

    /// Parse an on-disk suffix
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "diff" => Some(IncrementKind::Diff),
            "snapshot" => Some(IncrementKind::Snapshot),
            "deleted" => Some(IncrementKind::Deleted),
            "special" => Some(IncrementKind::Special),
            _ => None,
        }
    }
}

impl fmt::Display for IncrementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing entry for one increment file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementInfo {
    /// Entry the increment belongs to
    pub path: RepoPath,
    /// Session that produced it
    pub session: SessionTime,
    /// Increment type
    pub kind: IncrementKind,
    /// Whether the payload is lz4 compressed
    pub compressed: bool,
    /// File size on disk
    pub size: u64,
    /// Location relative to the repository root
    pub file: PathBuf,
}

/// Running statistics of one backup session, persisted as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Session stamp
    pub session: Option<SessionTime>,
    /// Entries seen in the source
    pub source_files: u64,
    /// Bytes of regular files seen in the source
    pub source_file_size: u64,
    /// Entries in the mirror after the session
    pub mirror_files: u64,
    /// Entries created
    pub new_files: u64,
    /// Bytes of created regular files
    pub new_file_size: u64,
    /// Entries removed
    pub deleted_files: u64,
    /// Bytes of removed regular files
    pub deleted_file_size: u64,
    /// Entries changed in place
    pub changed_files: u64,
    /// New size of changed regular files
    pub changed_source_size: u64,
    /// Old size of changed regular files
    pub changed_mirror_size: u64,
    /// Increments written
    pub increment_files: u64,
    /// Bytes of increments written
    pub increment_file_size: u64,
    /// Bytes copied or patched into the mirror
    pub bytes_transferred: u64,
    /// Entries that failed
    pub errors: u64,
    /// Wall-clock start
    pub start_time: Option<DateTime<Utc>>,
    /// Wall-clock end
    pub end_time: Option<DateTime<Utc>>,
    /// Duration in milliseconds
    pub elapsed_ms: u64,
}

impl SessionStats {
    /// Net growth of the increments area
    pub fn total_destination_change(&self) -> i64 {
        self.new_file_size as i64 - self.deleted_file_size as i64
            + self.changed_source_size as i64
            - self.changed_mirror_size as i64
            + self.increment_file_size as i64
    }
}

/// Outcome of one committed backup session
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Session stamp
    pub session: SessionTime,
    /// Final statistics
    pub stats: SessionStats,
    /// Per-entry failures; the session still committed
    pub errors: Vec<EntryError>,
}

impl SessionReport {
    /// Whether every entry was processed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of restoring a session into a target tree
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Session that was restored
    pub session: Option<SessionTime>,
    /// Regular files written
    pub files_restored: usize,
    /// Directories created or updated
    pub directories_restored: usize,
    /// Hard links recreated
    pub links_restored: usize,
    /// Symlinks and special files created
    pub specials_restored: usize,
    /// Content bytes written
    pub bytes_written: u64,
    /// Entries that could not be restored
    pub errors: Vec<EntryError>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Sessions no longer restorable
    pub sessions_removed: Vec<SessionTime>,
    /// Increment files deleted
    pub increments_removed: usize,
    /// Bytes freed
    pub bytes_freed: u64,
}
