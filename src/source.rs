//! Selection layer: ordered source entries and metadata blobs
//!
//! A session consumes an iterator of [`SourceEntry`] values in component
//! order and never reads one twice. [`SourceScanner`] is the stock
//! producer: a depth-first walk of a [`FileSystemAccess`] tree with
//! glob-based exclusion, attaching opaque metadata blobs from a
//! [`MetadataChannel`].
//!
//! ```rust
//! use retrobak::memory_fs::MemoryFs;
//! use retrobak::source::SourceScanner;
//!
//! let fs = MemoryFs::new();
//! fs.write_file("src/main.rs", "fn main() {}").unwrap();
//! fs.write_file("target/debug/app", "elf").unwrap();
//!
//! let scanner = SourceScanner::new(&fs)
//!     .with_exclude_patterns(&["target"])
//!     .unwrap();
//! let paths: Vec<String> = scanner.map(|e| e.unwrap().path.to_string()).collect();
//! assert_eq!(paths, vec![".", "src", "src/main.rs"]);
//! ```

use crate::error::{Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::types::{RepoPath, SourceEntry};
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Side channel for extended attributes, ACLs and ownership blobs
///
/// Blobs are opaque: the engine copies them next to content and hands them
/// back on restore without looking inside.
pub trait MetadataChannel: Send + Sync + fmt::Debug {
    /// Blob for `path`, if it has one
    fn read(&self, path: &RepoPath) -> Result<Option<Vec<u8>>>;

    /// Apply a blob to `path`
    fn write(&self, path: &RepoPath, blob: &[u8]) -> Result<()>;
}

/// Channel that has no metadata and discards writes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

impl MetadataChannel for NoMetadata {
    fn read(&self, _path: &RepoPath) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn write(&self, _path: &RepoPath, _blob: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// In-memory channel keyed by path
#[derive(Debug, Default)]
pub struct MapMetadata {
    blobs: RwLock<BTreeMap<RepoPath, Vec<u8>>>,
}

impl MapMetadata {
    /// Empty channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the blob of a path
    pub fn insert(&self, path: RepoPath, blob: impl Into<Vec<u8>>) {
        self.blobs.write().insert(path, blob.into());
    }

    /// Drop the blob of a path
    pub fn remove(&self, path: &RepoPath) {
        self.blobs.write().remove(path);
    }

    /// Copy of every stored blob
    pub fn snapshot(&self) -> BTreeMap<RepoPath, Vec<u8>> {
        self.blobs.read().clone()
    }
}

impl MetadataChannel for MapMetadata {
    fn read(&self, path: &RepoPath) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(path).cloned())
    }

    fn write(&self, path: &RepoPath, blob: &[u8]) -> Result<()> {
        self.blobs.write().insert(path.clone(), blob.to_vec());
        Ok(())
    }
}

/// Depth-first walk of a source tree in component order
///
/// Excluded directories are not descended into. Entries that vanish
/// between listing and stat are skipped silently; anything else that
/// fails is yielded as an error and the walk continues.
pub struct SourceScanner<'a> {
    fs: &'a dyn FileSystemAccess,
    metadata: &'a dyn MetadataChannel,
    excludes: GlobSet,
    stack: Vec<RepoPath>,
}

impl fmt::Debug for SourceScanner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceScanner")
            .field("fs", &self.fs)
            .field("excludes", &self.excludes.len())
            .field("pending", &self.stack.len())
            .finish()
    }
}

static NO_METADATA: NoMetadata = NoMetadata;

impl<'a> SourceScanner<'a> {
    /// Walk `fs` from its root with no excludes and no metadata
    pub fn new(fs: &'a dyn FileSystemAccess) -> Self {
        Self {
            fs,
            metadata: &NO_METADATA,
            excludes: GlobSet::empty(),
            stack: vec![RepoPath::root()],
        }
    }

    /// Skip paths matching any of `patterns` (and everything below them)
    pub fn with_exclude_patterns(mut self, patterns: &[&str]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                RetrobakError::InvalidConfiguration(format!("bad exclude pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        self.excludes = builder
            .build()
            .map_err(|e| RetrobakError::InvalidConfiguration(e.to_string()))?;
        Ok(self)
    }

    /// Attach blobs from `channel` to every entry
    pub fn with_metadata(mut self, channel: &'a dyn MetadataChannel) -> Self {
        self.metadata = channel;
        self
    }

    fn excluded(&self, path: &RepoPath) -> bool {
        !path.is_root() && self.excludes.is_match(path.as_path())
    }

    /// Whether the walk skips `path`, either directly or through an excluded ancestor
    pub fn is_excluded(&self, path: &RepoPath) -> bool {
        path.as_path()
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .any(|p| self.excludes.is_match(p))
    }

    fn visit(&mut self, path: RepoPath) -> Result<Option<SourceEntry>> {
        let Some(state) = self
            .fs
            .lstat(path.as_path())
            .map_err(|e| RetrobakError::transient(path.as_path(), e))?
        else {
            trace!("{} vanished before it could be scanned", path);
            return Ok(None);
        };
        if state.kind.is_dir() {
            let names = self
                .fs
                .list_dir(path.as_path())
                .map_err(|e| RetrobakError::transient(path.as_path(), e))?;
            for name in names.into_iter().rev() {
                let child = path.join(name);
                if self.excluded(&child) {
                    trace!("excluding {}", child);
                    continue;
                }
                self.stack.push(child);
            }
        }
        let metadata = self.metadata.read(&path)?;
        Ok(Some(SourceEntry { path, state, metadata }))
    }
}

impl Iterator for SourceScanner<'_> {
    type Item = Result<SourceEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(path) = self.stack.pop() {
            match self.visit(path) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_fs::MemoryFs;
    use std::path::Path;

    fn paths(scanner: SourceScanner<'_>) -> Vec<String> {
        scanner.map(|e| e.unwrap().path.to_string()).collect()
    }

    #[test]
    fn test_component_order() {
        let fs = MemoryFs::new();
        fs.write_file("a.b", "1").unwrap();
        fs.write_file("a/z", "2").unwrap();
        fs.write_file("a/c/d", "3").unwrap();
        assert_eq!(
            paths(SourceScanner::new(&fs)),
            vec![".", "a", "a/c", "a/c/d", "a/z", "a.b"]
        );
    }

    #[test]
    fn test_output_is_sorted() {
        let fs = MemoryFs::new();
        for p in ["x/1", "x/2/3", "y", "x-y/z", "x.y"] {
            fs.write_file(p, p).unwrap();
        }
        let entries: Vec<RepoPath> = SourceScanner::new(&fs).map(|e| e.unwrap().path).collect();
        let mut sorted = entries.clone();
        sorted.sort();
        assert_eq!(entries, sorted);
    }

    #[test]
    fn test_excludes_prune_directories() {
        let fs = MemoryFs::new();
        fs.write_file("keep/file.rs", "").unwrap();
        fs.write_file("keep/file.tmp", "").unwrap();
        fs.write_file("cache/deep/x", "").unwrap();
        let scanner = SourceScanner::new(&fs)
            .with_exclude_patterns(&["cache", "**/*.tmp"])
            .unwrap();
        assert_eq!(paths(scanner), vec![".", "keep", "keep/file.rs"]);
    }

    #[test]
    fn test_excluded_ancestor_covers_descendants() {
        let fs = MemoryFs::new();
        let scanner = SourceScanner::new(&fs)
            .with_exclude_patterns(&["backups"])
            .unwrap();
        assert!(scanner.is_excluded(&RepoPath::new("backups/repo").unwrap()));
        assert!(!scanner.is_excluded(&RepoPath::new("other/backups2").unwrap()));
        assert!(!scanner.is_excluded(&RepoPath::root()));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let fs = MemoryFs::new();
        assert!(SourceScanner::new(&fs).with_exclude_patterns(&["a[b"]).is_err());
    }

    #[test]
    fn test_metadata_attached() {
        let fs = MemoryFs::new();
        fs.write_file("f", "x").unwrap();
        let channel = MapMetadata::new();
        channel.insert(RepoPath::new("f").unwrap(), b"user.k=v".to_vec());
        let entries: Vec<SourceEntry> = SourceScanner::new(&fs)
            .with_metadata(&channel)
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries[0].metadata, None);
        assert_eq!(entries[1].metadata.as_deref(), Some(&b"user.k=v"[..]));
        assert!(fs.exists(Path::new("f")).unwrap());
    }
}
