//! Property-based testing for Retrobak
//!
//! Uses proptest to verify invariants across randomly generated names,
//! trees and session histories.

use crate::chaos::image;
use crate::integration::Harness;
use ::retrobak::*;
use proptest::prelude::*;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::info;

/// Entry names the generated histories play with
const SLOTS: [&str; 7] = ["a", "b", "d", "d/c", "d/e", "d/f/g", "h"];

/// One change to the source tree
#[derive(Debug, Clone)]
pub enum TreeOperation {
    Write { slot: usize, content: Vec<u8> },
    Append { slot: usize, content: Vec<u8> },
    Remove { slot: usize },
    Link { from: usize, to: usize },
    Symlink { slot: usize, target: usize },
    Chmod { slot: usize, mode: u32 },
    Fifo { slot: usize },
    MkDir { slot: usize },
}

fn slot_strategy() -> impl Strategy<Value = usize> {
    0..SLOTS.len()
}

/// Generate random file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Small text
        "[a-z0-9 \n]{0,64}".prop_map(|s| s.into_bytes()),
        // Binary data
        prop::collection::vec(any::<u8>(), 0..512),
        // Repetitive patterns
        (any::<u8>(), 1..2048usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn operation_strategy() -> impl Strategy<Value = TreeOperation> {
    prop_oneof![
        4 => (slot_strategy(), content_strategy())
            .prop_map(|(slot, content)| TreeOperation::Write { slot, content }),
        2 => (slot_strategy(), content_strategy())
            .prop_map(|(slot, content)| TreeOperation::Append { slot, content }),
        2 => slot_strategy().prop_map(|slot| TreeOperation::Remove { slot }),
        2 => (slot_strategy(), slot_strategy()).prop_map(|(from, to)| TreeOperation::Link { from, to }),
        1 => (slot_strategy(), slot_strategy())
            .prop_map(|(slot, target)| TreeOperation::Symlink { slot, target }),
        1 => (slot_strategy(), prop::sample::select(vec![0o400u32, 0o600, 0o644, 0o755]))
            .prop_map(|(slot, mode)| TreeOperation::Chmod { slot, mode }),
        1 => slot_strategy().prop_map(|slot| TreeOperation::Fifo { slot }),
        1 => slot_strategy().prop_map(|slot| TreeOperation::MkDir { slot }),
    ]
}

fn history_strategy() -> impl Strategy<Value = Vec<Vec<TreeOperation>>> {
    prop::collection::vec(prop::collection::vec(operation_strategy(), 1..8), 1..5)
}

fn make_parents(fs: &MemoryFs, path: &Path) -> bool {
    match path.parent() {
        Some(parent) => fs.create_dir_all(parent).is_ok(),
        None => true,
    }
}

/// Apply an operation where it makes sense; conflicting ones are dropped
fn apply_operation(fs: &MemoryFs, op: &TreeOperation) {
    let path = |slot: usize| Path::new(SLOTS[slot]);
    let kind = |slot: usize| fs.lstat(path(slot)).ok().flatten().map(|s| s.kind);
    match op {
        TreeOperation::Write { slot, content } => {
            let _ = fs.write_file(path(*slot), content);
        }
        TreeOperation::Append { slot, content } => {
            if let Ok(mut existing) = fs.read(path(*slot)) {
                existing.extend_from_slice(content);
                let _ = fs.write(path(*slot), &existing);
            }
        }
        TreeOperation::Remove { slot } => {
            let _ = fs.remove_tree(path(*slot));
        }
        TreeOperation::Link { from, to } => {
            if kind(*from).is_some_and(|k| k.is_regular()) && kind(*to).is_none() && make_parents(fs, path(*to)) {
                let _ = fs.hard_link(path(*from), path(*to));
            }
        }
        TreeOperation::Symlink { slot, target } => {
            if kind(*slot).is_none() && make_parents(fs, path(*slot)) {
                let _ = fs.symlink(path(*target), path(*slot));
            }
        }
        TreeOperation::Chmod { slot, mode } => {
            // symlink permissions are not carried
            if kind(*slot).is_some_and(|k| k.symlink_target().is_none()) {
                let _ = fs.set_permissions(path(*slot), *mode);
            }
        }
        TreeOperation::Fifo { slot } => {
            if kind(*slot).is_none() && make_parents(fs, path(*slot)) {
                let _ = fs.make_special(path(*slot), &EntryKind::Fifo, 0o644);
            }
        }
        TreeOperation::MkDir { slot } => {
            if kind(*slot).is_none() {
                let _ = fs.create_dir_all(path(*slot));
            }
        }
    }
}

/// Hash of every regular file below `root`, by relative path
fn compute_directory_hash(root: &Path) -> String {
    use sha2::{Digest, Sha256};
    use walkdir::WalkDir;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root).unwrap();
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(fs::read(entry.path()).unwrap());
            hasher.update(b"\0");
        }
    }
    hex::encode(hasher.finalize())
}

fn segment_strategy() -> impl Strategy<Value = String> {
    "[^/\\x00]{1,24}".prop_filter("no dot entries", |s| s != "." && s != "..")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Decoding an encoded segment gives back the raw segment
    #[test]
    fn codec_roundtrip(segment in segment_strategy(), extra in "[A-Za-z;. _-]{0,8}") {
        let codec = PathCodec::with_extra(&extra).unwrap();
        let encoded = codec.encode_segment(OsStr::new(&segment));
        prop_assert!(!encoded.contains('/'));
        prop_assert!(!encoded.is_empty());
        prop_assert_eq!(codec.decode_segment(&encoded).unwrap(), OsString::from(&segment));
    }

    /// Distinct segments never share a mirror name
    #[test]
    fn codec_injective(a in segment_strategy(), b in segment_strategy()) {
        prop_assume!(a != b);
        for codec in [PathCodec::minimal(), PathCodec::case_insensitive()] {
            prop_assert_ne!(
                codec.encode_segment(OsStr::new(&a)),
                codec.encode_segment(OsStr::new(&b))
            );
        }
    }

    /// The case-insensitive codec never emits upper case
    #[test]
    fn codec_case_folding_safe(segment in segment_strategy()) {
        let encoded = PathCodec::case_insensitive().encode_segment(OsStr::new(&segment));
        prop_assert!(encoded.chars().all(|c| !c.is_ascii_uppercase()));
    }

    /// Whole paths survive the trip through the mirror layout
    #[test]
    fn codec_path_roundtrip(segments in prop::collection::vec(segment_strategy(), 1..5)) {
        let path = segments.iter().fold(RepoPath::root(), |path, seg| path.join(seg));
        let codec = PathCodec::case_insensitive();
        let encoded = codec.encode_path(&path);
        prop_assert_eq!(encoded.iter().count(), segments.len());
        prop_assert_eq!(codec.decode_path(&encoded).unwrap(), path);
    }
}

#[cfg(unix)]
proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Non-UTF-8 names round-trip byte for byte
    #[test]
    fn codec_roundtrip_raw_bytes(
        bytes in prop::collection::vec(
            any::<u8>().prop_filter("no separators", |b| *b != b'/' && *b != 0),
            1..24
        )
    ) {
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(&bytes);
        let codec = PathCodec::minimal();
        let encoded = codec.encode_segment(raw);
        prop_assert_eq!(codec.decode_segment(&encoded).unwrap(), raw.to_os_string());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every committed session restores to exactly the tree it saw
    #[test]
    fn sessions_restore_exactly(history in history_strategy()) {
        let mut h = Harness::new();
        for operations in &history {
            for op in operations {
                apply_operation(&h.source, op);
            }
            let report = h.session();
            info!("session {}: {} increments", report.session, report.stats.increment_files);
        }
        for (time, expected) in &h.history {
            prop_assert_eq!(&h.restored(*time), expected, "state as of {}", time);
        }
    }

    /// Interrupting the last session anywhere and regressing restores the repository
    #[test]
    fn crash_then_regress_restores(
        history in history_strategy(),
        last in prop::collection::vec(operation_strategy(), 1..8),
        point in 0u64..160,
    ) {
        let mut h = Harness::new();
        for operations in &history {
            for op in operations {
                apply_operation(&h.source, op);
            }
            h.session();
        }
        for op in &last {
            apply_operation(&h.source, op);
        }

        let pre = image(&h.repo_fs);
        h.repo_fs.crash_after(point);
        let result = h.try_session();
        let crashed = h.repo_fs.has_crashed();
        h.repo_fs.revive();
        if crashed {
            prop_assert!(result.is_err());
            h.repo.regress().unwrap();
            prop_assert_eq!(image(&h.repo_fs), pre);
            h.session();
        } else {
            prop_assert!(result.unwrap().is_clean());
        }
        h.assert_history();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Restoring from a real directory reproduces its files
    #[test]
    fn local_restore_identity(
        rounds in prop::collection::vec(
            prop::collection::vec(("[a-z]{1,6}(/[a-z]{1,6}){0,2}", content_strategy()), 1..12),
            1..4
        )
    ) {
        let source_dir = TempDir::new().unwrap();
        let repo_dir = TempDir::new().unwrap();
        let repo = RepositoryBuilder::new().build_local(repo_dir.path()).unwrap();
        let source = LocalFs::new(source_dir.path());

        let mut expected = Vec::new();
        for (round, files) in rounds.iter().enumerate() {
            for (relative, content) in files {
                let full = source_dir.path().join(relative);
                if let Some(parent) = full.parent() {
                    if fs::create_dir_all(parent).is_err() {
                        continue;
                    }
                }
                let _ = fs::write(&full, content);
            }
            // pin timestamps so coarse clocks cannot hide a rewrite
            for entry in walkdir::WalkDir::new(source_dir.path()) {
                let entry = entry.unwrap();
                if entry.file_type().is_file() {
                    let stamp = filetime::FileTime::from_unix_time(1_000_000 + round as i64, 0);
                    filetime::set_file_mtime(entry.path(), stamp).unwrap();
                }
            }

            let time = SessionTime::from_millis(1_000 * (round as i64 + 1)).unwrap();
            let report = repo.backup_at(time, &source, SourceScanner::new(&source)).unwrap();
            prop_assert!(report.is_clean());
            expected.push((time, compute_directory_hash(source_dir.path())));
        }

        for (time, hash) in expected {
            let target_dir = TempDir::new().unwrap();
            let target = LocalFs::new(target_dir.path());
            repo.restore(time, &target, &NoMetadata).unwrap();
            prop_assert_eq!(compute_directory_hash(target_dir.path()), hash);
        }
    }
}
