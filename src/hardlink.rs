//! Session-scoped hardlink tracking
//!
//! Source entries sharing one (device, inode) identity form a group. The
//! first member seen in iteration order becomes the data holder; later
//! members resolve to links onto it. The tracker is created per session,
//! shared by reference, and dropped when the session ends; afterwards the
//! grouping survives only as [`LinkRole`] annotations on mirror records.

use crate::collections::{HashMap, HashMapExt};
use crate::types::{EntryState, FileIdentity, LinkRole, MirrorRecord, RepoPath};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

/// How a source path participates in hardlinking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Not hardlinked (or hardlink tracking is off)
    Standalone,
    /// First member of its group; content is stored here
    DataHolder,
    /// Later member; mirror entry links to the holder
    LinkTo(RepoPath),
}

impl Resolution {
    /// Annotation to persist on the mirror record
    pub fn link_role(&self) -> LinkRole {
        match self {
            Resolution::Standalone => LinkRole::Standalone,
            Resolution::DataHolder => LinkRole::Holder,
            Resolution::LinkTo(holder) => LinkRole::Link {
                holder: holder.clone(),
            },
        }
    }
}

/// Groups source paths by identity during one session
#[derive(Debug)]
pub struct HardlinkTracker {
    enabled: bool,
    holders: DashMap<FileIdentity, RepoPath>,
}

impl HardlinkTracker {
    /// Tracker for one session; a disabled tracker resolves everything standalone
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            holders: DashMap::new(),
        }
    }

    /// Classify `path`, registering it with its group
    ///
    /// Only regular files with more than one link and a known identity
    /// take part. Resolution for one identity is serialized by the map's
    /// entry lock, so concurrent callers agree on a single holder.
    pub fn resolve(&self, path: &RepoPath, state: &EntryState) -> Resolution {
        if !self.enabled || !state.kind.is_regular() || state.nlink < 2 {
            return Resolution::Standalone;
        }
        let Some(identity) = state.identity else {
            return Resolution::Standalone;
        };
        match self.holders.entry(identity) {
            Entry::Vacant(vacant) => {
                trace!("{} holds data for {:?}", path, identity);
                vacant.insert(path.clone());
                Resolution::DataHolder
            }
            Entry::Occupied(occupied) if occupied.get() == path => Resolution::DataHolder,
            Entry::Occupied(occupied) => {
                trace!("{} links to {}", path, occupied.get());
                Resolution::LinkTo(occupied.get().clone())
            }
        }
    }
}

/// Pick the member that takes over when a group's holder disappears
///
/// Returns the new holder (the first surviving link in path order that
/// `is_present` accepts) and rewrites the annotations of every remaining
/// link in `records` to point at it. `None` when no link survives.
pub fn promote_successor(
    records: &mut std::collections::BTreeMap<RepoPath, MirrorRecord>,
    old_holder: &RepoPath,
    mut is_present: impl FnMut(&RepoPath) -> bool,
) -> Option<RepoPath> {
    let links: Vec<RepoPath> = records
        .values()
        .filter(|r| r.link.holder() == Some(old_holder))
        .map(|r| r.path.clone())
        .collect();

    let successor = links.iter().find(|p| is_present(p))?.clone();
    for path in &links {
        if let Some(record) = records.get_mut(path) {
            record.link = if *path == successor {
                LinkRole::Holder
            } else {
                LinkRole::Link {
                    holder: successor.clone(),
                }
            };
        }
    }
    Some(successor)
}

/// Hardlink groups as recorded in a manifest: holder -> links
pub fn recorded_groups<'a>(
    records: impl IntoIterator<Item = &'a MirrorRecord>,
) -> HashMap<RepoPath, Vec<RepoPath>> {
    let mut groups: HashMap<RepoPath, Vec<RepoPath>> = HashMap::new();
    for record in records {
        if let LinkRole::Link { holder } = &record.link {
            groups.entry(holder.clone()).or_default().push(record.path.clone());
        }
    }
    groups
}
