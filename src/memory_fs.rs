//! In-memory [`FileSystemAccess`] with inode identity and fault injection
//!
//! `MemoryFs` behaves like a small POSIX tree: entries point at inodes,
//! hard links share an inode, renames replace non-directory targets and
//! writes to an existing file go through to every link. It is used as a
//! source tree in tests and as a repository filesystem for crash simulation:
//!
//! ```rust
//! use retrobak::memory_fs::MemoryFs;
//! use retrobak::fs_access::FileSystemAccess;
//! use std::path::Path;
//!
//! let fs = MemoryFs::new();
//! fs.crash_after(1);
//! assert!(fs.write(Path::new("a"), b"1").is_ok());
//! assert!(fs.write(Path::new("b"), b"2").is_err()); // the "process" died here
//! fs.revive();
//! assert!(fs.write(Path::new("b"), b"2").is_ok());
//! ```

use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt};
use crate::fs_access::FileSystemAccess;
use crate::path_codec::os_to_bytes;
use crate::types::{EntryKind, EntryState, FileIdentity};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

const DEVICE: u64 = 1;

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    data: Vec<u8>,
    permissions: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    mtime_nanos: u32,
    nlink: u64,
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<PathBuf, u64>,
    nodes: HashMap<u64, Node>,
    next_inode: u64,
    clock: i64,
    mutations: u64,
    remaining: Option<u64>,
    crashed: bool,
    hard_links: bool,
    failing_reads: HashSet<PathBuf>,
}

/// Snapshot of one entry, for comparing whole trees in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    /// Entry type
    pub kind: EntryKind,
    /// File content (empty for non-regular entries)
    pub data: Vec<u8>,
    /// Permission bits
    pub permissions: u32,
    /// Modification time in seconds
    pub mtime: i64,
    /// Link count
    pub nlink: u64,
}

/// In-memory filesystem
#[derive(Debug)]
pub struct MemoryFs {
    state: Mutex<State>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path:?} does not exist"))
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("{path:?} already exists"))
}

fn invalid(path: &Path, what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{path:?}: {what}"))
}

impl MemoryFs {
    /// Empty filesystem containing only the root directory
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            0,
            Node {
                kind: EntryKind::Directory,
                data: Vec::new(),
                permissions: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                mtime_nanos: 0,
                nlink: 1,
            },
        );
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::new(), 0);
        Self {
            state: Mutex::new(State {
                entries,
                nodes,
                next_inode: 1,
                clock: 1,
                mutations: 0,
                remaining: None,
                crashed: false,
                hard_links: true,
                failing_reads: HashSet::new(),
            }),
        }
    }

    /// Allow `n` more mutating operations, then fail every later one
    pub fn crash_after(&self, n: u64) {
        let mut state = self.state.lock();
        state.remaining = Some(n);
        state.crashed = false;
    }

    /// Clear any pending or triggered crash
    pub fn revive(&self) {
        let mut state = self.state.lock();
        state.remaining = None;
        state.crashed = false;
    }

    /// Whether a crash was triggered
    pub fn has_crashed(&self) -> bool {
        self.state.lock().crashed
    }

    /// Number of successful mutating operations so far
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutations
    }

    /// Toggle hard link support (`hard_link` fails with `Unsupported` when off)
    pub fn set_hard_links_supported(&self, supported: bool) {
        self.state.lock().hard_links = supported;
    }

    /// Make reads of `path` fail with `PermissionDenied`
    pub fn fail_reads(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_reads.insert(path.into());
    }

    /// Let reads of `path` succeed again
    pub fn allow_reads(&self, path: &Path) {
        self.state.lock().failing_reads.remove(path);
    }

    /// Write a file, creating missing parent directories
    pub fn write_file(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        self.write(path, data.as_ref())
    }

    /// Every entry at or below `under`, keyed by path relative to `under`
    pub fn dump(&self, under: &Path) -> BTreeMap<PathBuf, DumpEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(under))
            .filter_map(|(path, inode)| {
                let node = state.nodes.get(inode)?;
                let rel = path.strip_prefix(under).ok()?.to_path_buf();
                Some((
                    rel,
                    DumpEntry {
                        kind: node.kind.clone(),
                        data: node.data.clone(),
                        permissions: node.permissions,
                        mtime: node.mtime,
                        nlink: node.nlink,
                    },
                ))
            })
            .collect()
    }
}

impl State {
    fn mutate(&mut self) -> io::Result<()> {
        if self.crashed {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated crash"));
        }
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                self.crashed = true;
                return Err(io::Error::new(io::ErrorKind::Other, "simulated crash"));
            }
            self.remaining = Some(remaining - 1);
        }
        self.mutations += 1;
        self.clock += 1;
        Ok(())
    }

    fn node(&self, path: &Path) -> Option<(u64, &Node)> {
        let inode = *self.entries.get(path)?;
        self.nodes.get(&inode).map(|n| (inode, n))
    }

    fn node_mut(&mut self, path: &Path) -> io::Result<&mut Node> {
        let inode = *self.entries.get(path).ok_or_else(|| not_found(path))?;
        self.nodes.get_mut(&inode).ok_or_else(|| not_found(path))
    }

    fn require_parent_dir(&self, path: &Path) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| invalid(path, "no parent"))?;
        match self.node(parent) {
            Some((_, node)) if node.kind.is_dir() => Ok(()),
            Some(_) => Err(invalid(parent, "not a directory")),
            None => Err(not_found(parent)),
        }
    }

    fn has_children(&self, path: &Path) -> bool {
        self.entries
            .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
            .next()
            .is_some_and(|(p, _)| p.starts_with(path))
    }

    fn create(&mut self, path: &Path, kind: EntryKind, permissions: u32, data: Vec<u8>) -> io::Result<()> {
        if self.entries.contains_key(path) {
            return Err(already_exists(path));
        }
        self.require_parent_dir(path)?;
        self.mutate()?;
        let inode = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(
            inode,
            Node {
                kind,
                data,
                permissions,
                uid: 0,
                gid: 0,
                mtime: self.clock,
                mtime_nanos: 0,
                nlink: 1,
            },
        );
        self.entries.insert(path.to_path_buf(), inode);
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        let (inode, from_is_dir) = match self.node(from) {
            Some((inode, node)) => (inode, node.kind.is_dir()),
            None => return Err(not_found(from)),
        };
        if from == to {
            return Ok(());
        }
        if from_is_dir && to.starts_with(from) {
            return Err(invalid(to, "cannot move a directory into itself"));
        }
        self.require_parent_dir(to)?;
        let target_is_dir = self.node(to).map(|(_, n)| n.kind.is_dir());
        match (from_is_dir, target_is_dir) {
            (false, Some(true)) => return Err(invalid(to, "is a directory")),
            (true, Some(false)) => return Err(invalid(to, "not a directory")),
            (true, Some(true)) if self.has_children(to) => {
                return Err(invalid(to, "directory not empty"))
            }
            _ => {}
        }
        self.mutate()?;
        if target_is_dir.is_some() {
            self.unlink(to);
        }
        let moved: Vec<(PathBuf, u64)> = self
            .entries
            .range::<Path, _>((Bound::Excluded(from), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(from))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        self.entries.remove(from);
        self.entries.insert(to.to_path_buf(), inode);
        for (path, child) in moved {
            self.entries.remove(&path);
            if let Ok(rest) = path.strip_prefix(from) {
                self.entries.insert(to.join(rest), child);
            }
        }
        Ok(())
    }

    fn unlink(&mut self, path: &Path) {
        if let Some(inode) = self.entries.remove(path) {
            let drop_node = match self.nodes.get_mut(&inode) {
                Some(node) => {
                    node.nlink = node.nlink.saturating_sub(1);
                    node.nlink == 0
                }
                None => false,
            };
            if drop_node {
                self.nodes.remove(&inode);
            }
        }
    }
}

impl FileSystemAccess for MemoryFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<EntryState>> {
        let state = self.state.lock();
        Ok(state.node(path).map(|(inode, node)| EntryState {
            kind: node.kind.clone(),
            size: if node.kind.is_regular() { node.data.len() as u64 } else { 0 },
            mtime: node.mtime,
            mtime_nanos: node.mtime_nanos,
            permissions: node.permissions,
            uid: node.uid,
            gid: node.gid,
            nlink: node.nlink,
            identity: Some(FileIdentity { device: DEVICE, inode }),
        }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.state.lock();
        if state.failing_reads.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("{path:?}: permission denied")));
        }
        match state.node(path) {
            Some((_, node)) if node.kind.is_regular() => Ok(node.data.clone()),
            Some(_) => Err(invalid(path, "not a regular file")),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.node(path).map(|(_, n)| n.kind.is_regular()) {
            Some(true) => {
                state.mutate()?;
                let clock = state.clock;
                let node = state.node_mut(path)?;
                node.data = data.to_vec();
                node.mtime = clock;
                node.mtime_nanos = 0;
                Ok(())
            }
            Some(false) => Err(invalid(path, "not a regular file")),
            None => state.create(path, EntryKind::Regular, 0o644, data.to_vec()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.state.lock().rename(from, to)
    }

    fn rename_noreplace(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.node(to).is_some() {
            return Err(already_exists(to));
        }
        state.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.node(path) {
            Some((_, node)) if node.kind.is_dir() => Err(invalid(path, "is a directory")),
            Some(_) => {
                state.mutate()?;
                state.unlink(path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        if path.as_os_str().is_empty() {
            return Err(invalid(path, "cannot remove the root"));
        }
        match state.node(path) {
            Some((_, node)) if !node.kind.is_dir() => Err(invalid(path, "not a directory")),
            Some(_) if state.has_children(path) => Err(invalid(path, "directory not empty")),
            Some(_) => {
                state.mutate()?;
                state.unlink(path);
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .create(path, EntryKind::Directory, 0o755, Vec::new())
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let kind = EntryKind::Symlink {
            target: os_to_bytes(target.as_os_str()),
        };
        self.state.lock().create(link, kind, 0o777, Vec::new())
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.hard_links {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "hard links are disabled"));
        }
        let inode = match state.node(original) {
            Some((_, node)) if node.kind.is_dir() => return Err(invalid(original, "is a directory")),
            Some((inode, _)) => inode,
            None => return Err(not_found(original)),
        };
        if state.entries.contains_key(link) {
            return Err(already_exists(link));
        }
        state.require_parent_dir(link)?;
        state.mutate()?;
        if let Some(node) = state.nodes.get_mut(&inode) {
            node.nlink += 1;
        }
        state.entries.insert(link.to_path_buf(), inode);
        Ok(())
    }

    fn make_special(&self, path: &Path, kind: &EntryKind, permissions: u32) -> io::Result<()> {
        match kind {
            EntryKind::Fifo
            | EntryKind::Socket
            | EntryKind::CharDevice { .. }
            | EntryKind::BlockDevice { .. } => {
                self.state.lock().create(path, kind.clone(), permissions, Vec::new())
            }
            other => Err(invalid(path, &format!("{} is not a special file type", other.label()))),
        }
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.node_mut(path)?;
        state.mutate()?;
        state.node_mut(path)?.permissions = mode & 0o7777;
        Ok(())
    }

    fn set_mtime(&self, path: &Path, secs: i64, nanos: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.node_mut(path)?;
        state.mutate()?;
        let node = state.node_mut(path)?;
        node.mtime = secs;
        node.mtime_nanos = nanos;
        Ok(())
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.node_mut(path)?;
        state.mutate()?;
        let node = state.node_mut(path)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let state = self.state.lock();
        match state.node(path) {
            Some((_, node)) if node.kind.is_dir() => {}
            Some(_) => return Err(invalid(path, "not a directory")),
            None => return Err(not_found(path)),
        }
        // BTreeMap order is component order, so children come out sorted
        Ok(state
            .entries
            .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(path))
            .filter(|(p, _)| p.parent() == Some(path))
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_os_string()))
            .collect())
    }
}
