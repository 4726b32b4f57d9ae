//! Error types for the retrobak engine
//!
//! Errors fall into four families that callers act on differently:
//!
//! - **Transient** ([`RetrobakError::TransientIo`]): a single entry could not be
//!   read or written. Sessions collect these and keep going.
//! - **Fatal** ([`RetrobakError::FatalRepository`]): the repository itself is
//!   unusable (mirror root unreachable, marker unparseable). The session stops
//!   and leaves its marker for the next regression pass.
//! - **Conflict** ([`RetrobakError::Conflict`]): another live session owns the
//!   repository. Nothing is mutated.
//! - **Integrity** ([`RetrobakError::Integrity`]): regression found a mirror
//!   entry in neither its recorded prior nor its recorded target state.
//!   Regression halts instead of guessing.

use crate::types::RepoPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the retrobak crate
pub type Result<T> = std::result::Result<T, RetrobakError>;

/// Main error type for all repository operations
#[derive(Debug, Error)]
pub enum RetrobakError {
    /// I/O errors outside of per-entry processing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error scoped to one entry; retry is up to the caller
    #[error("transient I/O error on {path:?}: {source}")]
    TransientIo {
        /// Repository-relative path of the entry
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The repository cannot be used in its current state
    #[error("fatal repository error: {0}")]
    FatalRepository(String),

    /// Another session appears to be live
    #[error("repository is locked by live session {session} (pid {pid} on {hostname})")]
    Conflict {
        /// Session stamp recorded in the marker
        session: String,
        /// Process id recorded in the marker
        pid: u32,
        /// Host recorded in the marker
        hostname: String,
    },

    /// Mirror entry matches neither side of an increment during regression
    #[error("integrity error on {path:?}: {reason}")]
    Integrity {
        /// Repository-relative path of the entry
        path: PathBuf,
        /// What did not match
        reason: String,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Signature, delta or patch failure
    #[error("Delta error: {0}")]
    Delta(String),

    /// Malformed or non-canonical encoded path segment
    #[error("Path codec error: {0}")]
    PathCodec(String),

    /// Increment payload could not be (de)compressed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Repository has not been initialized
    #[error("Repository not initialized at path: {0:?}")]
    NotInitialized(PathBuf),

    /// Repository already exists
    #[error("Repository already exists at path: {0:?}")]
    AlreadyInitialized(PathBuf),

    /// New session would not be strictly after the last committed one
    #[error("the last backup ({previous}) is not in the past relative to {requested}")]
    SessionNotAfter {
        /// Stamp of the last committed session
        previous: String,
        /// Stamp requested for the new session
        requested: String,
    },

    /// The selection layer yielded entries out of component order
    #[error("source entries out of order: {current:?} after {previous:?}")]
    SourceOrder {
        /// Previously yielded path
        previous: PathBuf,
        /// Offending path
        current: PathBuf,
    },

    /// No committed session matches the request
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for RetrobakError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RetrobakError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RetrobakError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RetrobakError::Bincode(err.to_string())
    }
}

impl RetrobakError {
    /// Create a fatal repository error with a custom message
    pub fn fatal(msg: impl Into<String>) -> Self {
        RetrobakError::FatalRepository(msg.into())
    }

    /// Create an integrity error for a path
    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RetrobakError::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a delta error with a custom message
    pub fn delta(msg: impl Into<String>) -> Self {
        RetrobakError::Delta(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RetrobakError::Internal(msg.into())
    }

    /// Attach an entry path to a bare I/O error
    pub fn transient(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RetrobakError::TransientIo {
            path: path.into(),
            source,
        }
    }

    /// Check if the caller may reasonably retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RetrobakError::TransientIo { .. } | RetrobakError::Conflict { .. }
        )
    }

    /// Check if this error must leave the marker in place
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RetrobakError::FatalRepository(_) | RetrobakError::Integrity { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RetrobakError::Conflict { pid, hostname, .. } => format!(
                "Another backup session (pid {} on {}) is still running against this repository. \
                 Wait for it to finish before starting a new one.",
                pid, hostname
            ),
            RetrobakError::Integrity { path, reason } => format!(
                "Regression stopped at {:?}: {}. The repository was left untouched from this point on; \
                 inspect the mirror entry and its increments before retrying.",
                path, reason
            ),
            RetrobakError::FatalRepository(msg) => format!(
                "{}. The session marker was kept, so the next run will regress the repository first.",
                msg
            ),
            RetrobakError::NotInitialized(path) => {
                format!("No repository at {:?}. Run a first backup to create one.", path)
            }
            RetrobakError::SessionNotAfter { previous, .. } => format!(
                "The last backup ({}) is not in the past. Check the system clock.",
                previous
            ),
            _ => self.to_string(),
        }
    }
}

/// Broad class of a per-entry failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryErrorKind {
    /// Entry could not be read or written
    Transient,
    /// Signature, delta or patch failed
    Delta,
    /// Name could not be encoded or decoded
    Codec,
    /// Anything else
    Other,
}

/// Failure recorded against one entry while a session or restore kept going
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    /// Entry that failed
    pub path: RepoPath,
    /// Error class
    pub kind: EntryErrorKind,
    /// Rendered error message
    pub message: String,
}

impl EntryError {
    /// Classify `err` against `path`
    pub fn from_error(path: &RepoPath, err: &RetrobakError) -> Self {
        let kind = match err {
            RetrobakError::TransientIo { .. } | RetrobakError::Io(_) => EntryErrorKind::Transient,
            RetrobakError::Delta(_) => EntryErrorKind::Delta,
            RetrobakError::PathCodec(_) => EntryErrorKind::Codec,
            _ => EntryErrorKind::Other,
        };
        Self {
            path: path.clone(),
            kind,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}
