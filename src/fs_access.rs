//! Filesystem capability used by every component
//!
//! The engine never touches `std::fs` directly. Source trees, the repository
//! and restore targets are all reached through [`FileSystemAccess`], so a
//! proxied (remote) implementation or the in-memory
//! [`MemoryFs`](crate::memory_fs::MemoryFs) can be injected without the
//! engine branching on where the bytes live.
//!
//! All paths are relative to the implementation's root; the empty path is
//! the root itself. Methods return plain `io::Result` so callers can attach
//! the entry path when turning failures into [`RetrobakError`](crate::RetrobakError)s.

use crate::types::{EntryKind, EntryState};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Filesystem-shaped operations the engine issues
pub trait FileSystemAccess: Send + Sync + fmt::Debug {
    /// State of the entry without following symlinks, `None` if absent
    fn lstat(&self, path: &Path) -> io::Result<Option<EntryState>>;

    /// Whole content of a regular file
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create or truncate a regular file with `data`
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Rename, replacing a non-directory target
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Rename, failing with `AlreadyExists` when anything is at `to`
    fn rename_noreplace(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a non-directory entry
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Create one directory; the parent must exist
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Create a symlink at `link` pointing to `target`
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Create a hard link at `link` to `original`
    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Create a fifo, device node or socket
    fn make_special(&self, path: &Path, kind: &EntryKind, permissions: u32) -> io::Result<()>;

    /// Set permission bits
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Set the modification time without following symlinks
    fn set_mtime(&self, path: &Path, secs: i64, nanos: u32) -> io::Result<()>;

    /// Set ownership without following symlinks
    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Names in a directory, sorted bytewise
    fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>>;

    /// Whether anything exists at `path`
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.lstat(path)?.is_some())
    }

    /// Create a directory and any missing parents
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut current = PathBuf::new();
        for component in path.iter() {
            current.push(component);
            match self.lstat(&current)? {
                Some(state) if state.kind.is_dir() => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{current:?} exists and is not a directory"),
                    ))
                }
                None => self.create_dir(&current)?,
            }
        }
        Ok(())
    }

    /// Remove an entry and, for directories, everything below it
    fn remove_tree(&self, path: &Path) -> io::Result<()> {
        match self.lstat(path)? {
            None => Ok(()),
            Some(state) if state.kind.is_dir() => {
                self.clear_dir(path)?;
                self.remove_dir(path)
            }
            Some(_) => self.remove_file(path),
        }
    }

    /// Remove everything inside a directory, keeping the directory
    fn clear_dir(&self, path: &Path) -> io::Result<()> {
        for name in self.list_dir(path)? {
            self.remove_tree(&path.join(name))?;
        }
        Ok(())
    }

    /// Whether two paths are the same inode
    fn same_file(&self, a: &Path, b: &Path) -> io::Result<bool> {
        let (Some(sa), Some(sb)) = (self.lstat(a)?, self.lstat(b)?) else {
            return Ok(false);
        };
        Ok(sa.identity.is_some() && sa.identity == sb.identity)
    }
}

/// [`FileSystemAccess`] over the local filesystem, rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Operate below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl FileSystemAccess for LocalFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<EntryState>> {
        let full = self.full(path);
        let metadata = match std::fs::symlink_metadata(&full) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let kind = if metadata.file_type().is_symlink() {
            EntryKind::symlink(std::fs::read_link(&full)?)
        } else {
            local::kind_of(&metadata)
        };
        Ok(Some(local::state_of(kind, &metadata)))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.full(path))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(self.full(path), data)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(self.full(from), self.full(to))
    }

    fn rename_noreplace(&self, from: &Path, to: &Path) -> io::Result<()> {
        let (from, to) = (self.full(from), self.full(to));
        // linking never replaces an existing name
        match std::fs::hard_link(&from, &to) {
            Ok(()) => std::fs::remove_file(&from),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
            Err(_) => {
                if std::fs::symlink_metadata(&to).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{to:?} already exists"),
                    ));
                }
                std::fs::rename(from, to)
            }
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(self.full(path))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(self.full(path))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(self.full(path))
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        local::symlink(target, &self.full(link))
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(self.full(original), self.full(link))
    }

    fn make_special(&self, path: &Path, kind: &EntryKind, permissions: u32) -> io::Result<()> {
        local::make_special(&self.full(path), kind, permissions)
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        local::set_permissions(&self.full(path), mode)
    }

    fn set_mtime(&self, path: &Path, secs: i64, nanos: u32) -> io::Result<()> {
        let time = filetime::FileTime::from_unix_time(secs, nanos);
        filetime::set_symlink_file_times(self.full(path), time, time)
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        local::set_owner(&self.full(path), uid, gid)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut names = std::fs::read_dir(self.full(path))?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }
}

#[cfg(unix)]
mod local {
    use crate::types::{EntryKind, EntryState, FileIdentity};
    use nix::sys::stat::{major, makedev, minor, mknod, Mode, SFlag};
    use std::fs::Metadata;
    use std::io;
    use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
    use std::path::Path;

    pub(super) fn kind_of(metadata: &Metadata) -> EntryKind {
        let ft = metadata.file_type();
        let dev = metadata.rdev() as nix::libc::dev_t;
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_char_device() {
            EntryKind::CharDevice {
                major: major(dev) as u64,
                minor: minor(dev) as u64,
            }
        } else if ft.is_block_device() {
            EntryKind::BlockDevice {
                major: major(dev) as u64,
                minor: minor(dev) as u64,
            }
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::Regular
        }
    }

    pub(super) fn state_of(kind: EntryKind, metadata: &Metadata) -> EntryState {
        let size = if kind.is_regular() { metadata.size() } else { 0 };
        EntryState {
            kind,
            size,
            mtime: metadata.mtime(),
            mtime_nanos: metadata.mtime_nsec() as u32,
            permissions: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            nlink: metadata.nlink(),
            identity: Some(FileIdentity {
                device: metadata.dev(),
                inode: metadata.ino(),
            }),
        }
    }

    pub(super) fn symlink(target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    pub(super) fn make_special(path: &Path, kind: &EntryKind, permissions: u32) -> io::Result<()> {
        let mode = Mode::from_bits_truncate(permissions as _);
        match kind {
            EntryKind::Fifo => nix::unistd::mkfifo(path, mode)?,
            EntryKind::CharDevice { major, minor } => {
                mknod(path, SFlag::S_IFCHR, mode, makedev(*major as _, *minor as _))?
            }
            EntryKind::BlockDevice { major, minor } => {
                mknod(path, SFlag::S_IFBLK, mode, makedev(*major as _, *minor as _))?
            }
            EntryKind::Socket => {
                std::os::unix::net::UnixListener::bind(path)?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a special file type", other.label()),
                ))
            }
        }
        Ok(())
    }

    pub(super) fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    pub(super) fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }
}

#[cfg(not(unix))]
mod local {
    use crate::types::{EntryKind, EntryState};
    use std::fs::Metadata;
    use std::io;
    use std::path::Path;

    fn unsupported(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, format!("{what} is not supported on this platform"))
    }

    pub(super) fn kind_of(metadata: &Metadata) -> EntryKind {
        if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Regular
        }
    }

    pub(super) fn state_of(kind: EntryKind, metadata: &Metadata) -> EntryState {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .unwrap_or_default();
        let mut state = EntryState::new(kind);
        state.size = if state.kind.is_regular() { metadata.len() } else { 0 };
        state.mtime = mtime.as_secs() as i64;
        state.mtime_nanos = mtime.subsec_nanos();
        state.permissions = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
        state
    }

    pub(super) fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
        Err(unsupported("symlink"))
    }

    pub(super) fn make_special(_path: &Path, kind: &EntryKind, _permissions: u32) -> io::Result<()> {
        Err(unsupported(kind.label()))
    }

    pub(super) fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o200 == 0);
        std::fs::set_permissions(path, perms)
    }

    pub(super) fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
        Err(unsupported("chown"))
    }
}
