//! # Retrobak - Incremental backups with reverse increments
//!
//! An incremental backup engine that keeps a complete mirror of the latest
//! source state plus, for every earlier session, reverse increments that
//! turn the newer state back into the older one.
//!
//! ## Overview
//!
//! Retrobak keeps exactly one full copy of the data, the mirror, and lets you:
//! - Run backup sessions that bring the mirror up to date with a source tree
//! - Reconstruct any file, or the whole tree, as it was at any past session
//! - Survive interruption at any point: the next start regresses the
//!   repository to the last committed session
//! - Preserve hard link groups, symlinks and special files
//! - Mirror arbitrary file names onto restrictive filesystems via a
//!   reversible path codec
//! - Expire old sessions without touching the mirror
//!
//! ## Architecture
//!
//! - **Mirror**: `mirror/` holds the newest state, one entry per source entry
//! - **Increments**: `increments/` holds one file per changed entry per session;
//!   a `diff` is an rsync-style reverse delta, `snapshot`/`deleted` carry the
//!   full prior content, `special` covers type and special-file transitions
//! - **Manifests**: `data/mirror_metadata.<stamp>.bin` records what every
//!   committed session looked like, including hard link annotations
//! - **Marker**: `data/session.marker` exists while a session runs; its
//!   presence at start-up triggers regression
//! - **Parallel preparation**: hashing and delta computation run on a rayon
//!   pool; increments and mirror updates are committed in order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retrobak::{RepositoryBuilder, SessionTime};
//! use retrobak::fs_access::LocalFs;
//! use retrobak::source::NoMetadata;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = RepositoryBuilder::new()
//!     .parallel_workers(8)
//!     .build_local("/backups/home")?;
//!
//! // back up the source tree, skipping caches
//! let source = LocalFs::new("/home/user");
//! let report = repo.backup_tree(&source, &["**/.cache"])?;
//! println!("session {}: {} files changed", report.session, report.stats.changed_files);
//!
//! // bring back yesterday's tree
//! let yesterday = SessionTime::from_datetime(chrono::Utc::now() - chrono::Duration::days(1))?;
//! let target = LocalFs::new("/tmp/restored");
//! repo.restore(yesterday, &target, &NoMetadata)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crash Safety
//!
//! Every mutation of the mirror is preceded by the durable write of the
//! increment that undoes it, and every repository file is written through a
//! staging file and a rename. A crash therefore leaves the repository in a
//! state regression can always walk back. See [`regress`].
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RetrobakError>`. Per-entry problems
//! (unreadable files, failed deltas) do not abort a session; they are
//! collected in [`SessionReport::errors`]. Repository-level problems abort
//! the operation and leave the repository for regression.
//!
//! ## Module Organization
//!
//! - [`repository`]: Public facade, configuration and builder
//! - [`shadow`]: One backup session against the mirror
//! - [`regress`]: Undoing an unterminated session
//! - [`restore`]: Reconstructing past states
//! - [`increment`]: Increment records and their storage
//! - [`manifest`]: Per-session manifests and statistics
//! - [`marker`]: Session marker and liveness checks
//! - [`hardlink`]: Hard link group tracking
//! - [`path_codec`]: Reversible mirror name encoding
//! - [`delta`]: rsync-style signatures and deltas
//! - [`fs_access`] / [`memory_fs`]: Filesystem capability and its in-memory form
//! - [`source`]: Source scanning and metadata channels
//! - [`types`] / [`error`]: Shared types and errors

// Public API modules
pub mod compression;
pub mod delta;
pub mod error;
pub mod fs_access;
pub mod hardlink;
pub mod increment;
pub mod layout;
pub mod manifest;
pub mod marker;
pub mod memory_fs;
pub mod path_codec;
pub mod regress;
pub mod repository;
pub mod restore;
pub mod shadow;
pub mod source;
pub mod types;

// Support modules
pub mod collections;
pub mod utils;

// Re-export main types for convenience
pub use compression::PayloadCompression;
pub use error::{EntryError, EntryErrorKind, Result, RetrobakError};
pub use fs_access::{FileSystemAccess, LocalFs};
pub use memory_fs::MemoryFs;
pub use path_codec::PathCodec;
pub use regress::RegressOutcome;
pub use repository::{Repository, RepositoryBuilder, RepositoryConfig, RepositoryMetadata};
pub use restore::Reconstructed;
pub use source::{MapMetadata, MetadataChannel, NoMetadata, SourceScanner};
pub use types::*;
