//! Session transaction marker and liveness checks
//!
//! The marker file exists exactly while a session is between its start and
//! its commit. Removing it is the only commit signal. Its liveness token
//! (host, pid and a per-session uuid) lets the next start tell a crashed
//! session from one that is still running.

use crate::error::{Result, RetrobakError};
use crate::fs_access::FileSystemAccess;
use crate::layout::RepoLayout;
use crate::types::SessionTime;
use crate::utils::staging_path;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};
use uuid::Uuid;

/// Sessions running in this process
static LIVE_SESSIONS: Mutex<Vec<Uuid>> = Mutex::new(Vec::new());

/// Contents of `data/session.marker`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    /// Session in progress
    pub session: SessionTime,
    /// Last committed session before it, `None` for the initial session
    pub previous: Option<SessionTime>,
    /// Unique id of the run
    pub session_id: Uuid,
    /// Process that owns the session
    pub pid: u32,
    /// Host the process runs on
    pub hostname: String,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
}

impl SessionMarker {
    /// Marker for a session started by this process
    pub fn for_current_process(session: SessionTime, previous: Option<SessionTime>) -> Self {
        Self {
            session,
            previous,
            session_id: Uuid::new_v4(),
            pid: std::process::id(),
            hostname: current_hostname(),
            started_at: Utc::now(),
        }
    }

    /// Conflict error naming this marker's owner
    pub fn conflict(&self) -> RetrobakError {
        RetrobakError::Conflict {
            session: self.session.stamp(),
            pid: self.pid,
            hostname: self.hostname.clone(),
        }
    }
}

/// Host name of this machine, empty if unavailable
pub fn current_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decides whether the owner of a marker is still running
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    /// `true` if the session described by `marker` may still be live
    fn is_alive(&self, marker: &SessionMarker) -> bool;
}

/// Probe based on host name, process id and in-process registration
///
/// A marker from another host is treated as stale; the check only guards
/// against double regression on one machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, marker: &SessionMarker) -> bool {
        if marker.hostname != current_hostname() {
            return false;
        }
        if marker.pid == std::process::id() {
            return LIVE_SESSIONS.lock().contains(&marker.session_id);
        }
        process_exists(marker.pid)
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    // without a portable probe, a foreign pid is assumed alive
    true
}

/// Registers a session as live in this process until dropped
#[derive(Debug)]
pub struct SessionGuard {
    id: Uuid,
}

impl SessionGuard {
    /// Mark `marker`'s session as live
    pub fn register(marker: &SessionMarker) -> Self {
        LIVE_SESSIONS.lock().push(marker.session_id);
        trace!("session {} registered live", marker.session_id);
        Self { id: marker.session_id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        LIVE_SESSIONS.lock().retain(|id| *id != self.id);
    }
}

/// Reads and writes the marker file
#[derive(Debug)]
pub struct MarkerStore<'a> {
    fs: &'a dyn FileSystemAccess,
    layout: &'a RepoLayout,
}

impl<'a> MarkerStore<'a> {
    /// Store over the repository filesystem
    pub fn new(fs: &'a dyn FileSystemAccess, layout: &'a RepoLayout) -> Self {
        Self { fs, layout }
    }

    /// Current marker, `None` when the repository is clean
    ///
    /// An unreadable or unparseable marker is fatal: the repository cannot
    /// tell which session to undo.
    pub fn read(&self) -> Result<Option<SessionMarker>> {
        let path = self.layout.marker();
        if !self.fs.exists(&path)? {
            return Ok(None);
        }
        let bytes = self
            .fs
            .read(&path)
            .map_err(|e| RetrobakError::fatal(format!("session marker unreadable: {e}")))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RetrobakError::fatal(format!("session marker corrupt: {e}")))
    }

    /// Place the marker
    ///
    /// Placement never replaces a marker that is already there. When two
    /// sessions race past the clean check, the later one gets the earlier
    /// one's [`RetrobakError::Conflict`].
    pub fn write(&self, marker: &SessionMarker) -> Result<()> {
        let json = serde_json::to_vec_pretty(marker)?;
        let staged = staging_path(&self.layout.tmp_dir());
        self.fs.write(&staged, &json)?;
        if let Err(e) = self.fs.rename_noreplace(&staged, &self.layout.marker()) {
            let _ = self.fs.remove_file(&staged);
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                if let Some(existing) = self.read()? {
                    return Err(existing.conflict());
                }
            }
            return Err(e.into());
        }
        debug!("placed marker for session {} (pid {})", marker.session, marker.pid);
        Ok(())
    }

    /// Remove the marker; this commits the session it described
    pub fn remove(&self) -> Result<()> {
        self.fs.remove_file(&self.layout.marker())?;
        Ok(())
    }
}
