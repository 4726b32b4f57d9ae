//! Small helpers shared by the session, regression and restore code.

use crate::fs_access::FileSystemAccess;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Hash arbitrary data using SHA-256, returned as lowercase hex
///
/// Content hashes recorded in manifests and fingerprints all come from here,
/// so two entries compare equal exactly when their bytes do.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Format a byte count with binary units (`1.50 KB`, `3.00 GB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

/// Fresh staging path under `tmp_dir`
pub fn staging_path(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(uuid::Uuid::new_v4().simple().to_string())
}

/// Write `content` to `path` through a staging file and a rename
///
/// The target is either absent/old or complete; a crash in between only
/// leaves an orphan under `tmp_dir`, which regression clears.
pub fn atomic_write(
    fs: &dyn FileSystemAccess,
    tmp_dir: &Path,
    path: &Path,
    content: &[u8],
) -> io::Result<()> {
    let staged = staging_path(tmp_dir);
    trace!("staging {} bytes for {:?} at {:?}", content.len(), path, staged);
    fs.write(&staged, content)?;
    if let Err(e) = fs.rename(&staged, path) {
        let _ = fs.remove_file(&staged);
        return Err(e);
    }
    Ok(())
}

/// Where `inner` sits below `outer` on the local filesystem, if it does
///
/// Both paths are canonicalized first; a path that cannot be resolved is
/// treated as unrelated. `Some` of an empty path means they are the same.
pub fn nested_within(inner: &Path, outer: &Path) -> Option<PathBuf> {
    let inner = std::fs::canonicalize(inner).ok()?;
    let outer = std::fs::canonicalize(outer).ok()?;
    inner.strip_prefix(&outer).ok().map(Path::to_path_buf)
}
