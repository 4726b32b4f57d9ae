//! Session scenarios for Retrobak
//!
//! Drives whole sessions against an in-memory repository and checks the
//! mirror, the increments and every past state reachable through restore.

use ::retrobak::*;
use retrobak::marker::{LivenessProbe, SessionMarker};
use retrobak::memory_fs::DumpEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Whole-tree view used for comparisons: kind, content, permissions, mtime, link count
pub type Tree = BTreeMap<PathBuf, DumpEntry>;

pub fn t(ms: i64) -> SessionTime {
    SessionTime::from_millis(ms).unwrap()
}

pub fn rp(path: &str) -> RepoPath {
    RepoPath::new(path).unwrap()
}

/// Source tree, repository and the expected state of every committed session
pub struct Harness {
    pub repo_fs: Arc<MemoryFs>,
    pub source: MemoryFs,
    pub repo: Repository,
    pub history: Vec<(SessionTime, Tree)>,
    clock: i64,
}

impl Harness {
    /// Harness with small batches so sessions span several flushes
    pub fn new() -> Self {
        Self::with_builder(RepositoryBuilder::new().parallel_workers(2).batch_size(3))
    }

    pub fn with_builder(builder: RepositoryBuilder) -> Self {
        let repo_fs = Arc::new(MemoryFs::new());
        let repo = builder.build(repo_fs.clone()).unwrap();
        Self {
            repo_fs,
            source: MemoryFs::new(),
            repo,
            history: Vec::new(),
            clock: 0,
        }
    }

    /// Stamp of the next session
    pub fn next_time(&self) -> SessionTime {
        t(self.clock + 1_000)
    }

    /// Run a session over the whole source, recording the expected state on success
    pub fn try_session(&mut self) -> Result<SessionReport> {
        let time = self.next_time();
        let report = self
            .repo
            .backup_at(time, &self.source, SourceScanner::new(&self.source))?;
        self.clock += 1_000;
        self.history.push((time, self.source.dump(Path::new(""))));
        info!("session {} done: {} increments", time, report.stats.increment_files);
        Ok(report)
    }

    /// Run a session that must succeed without entry errors
    pub fn session(&mut self) -> SessionReport {
        let report = self.try_session().unwrap();
        assert!(report.is_clean(), "entry errors: {:?}", report.errors);
        report
    }

    /// Tree restored as of `as_of` into a fresh filesystem
    pub fn restored(&self, as_of: SessionTime) -> Tree {
        let target = MemoryFs::new();
        let report = self.repo.restore(as_of, &target, &NoMetadata).unwrap();
        assert!(report.errors.is_empty(), "restore errors: {:?}", report.errors);
        target.dump(Path::new(""))
    }

    /// Every recorded session restores to exactly what the source looked like
    pub fn assert_history(&self) {
        for (time, expected) in &self.history {
            assert_eq!(&self.restored(*time), expected, "state as of {}", time);
        }
    }

    pub fn mirror(&self, path: &str) -> Vec<u8> {
        self.repo_fs.read(&Path::new("mirror").join(path)).unwrap()
    }

    pub fn mirror_linked(&self, a: &str, b: &str) -> bool {
        let mirror = Path::new("mirror");
        self.repo_fs.same_file(&mirror.join(a), &mirror.join(b)).unwrap()
    }

    pub fn increment_kinds(&self, path: &str) -> Vec<IncrementKind> {
        self.repo
            .list_increments(&rp(path))
            .unwrap()
            .into_iter()
            .map(|info| info.kind)
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Source with `a` holding "X" and `b` hard linked to it
pub fn linked_pair(source: &MemoryFs) {
    source.write_file("a", "X").unwrap();
    source.hard_link(Path::new("a"), Path::new("b")).unwrap();
}

#[derive(Debug)]
struct AlwaysAlive;

impl LivenessProbe for AlwaysAlive {
    fn is_alive(&self, _marker: &SessionMarker) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardlinked_change_writes_one_diff() {
        let mut h = Harness::new();
        linked_pair(&h.source);

        let first = h.session();
        assert_eq!(first.stats.increment_files, 0);
        assert!(h.mirror_linked("a", "b"));

        // b shares the inode, so it sees the new content too
        h.source.write(Path::new("a"), b"Y").unwrap();
        let second = h.session();
        assert_eq!(second.stats.increment_files, 1);
        assert_eq!(h.increment_kinds("a"), vec![IncrementKind::Diff]);
        assert!(h.increment_kinds("b").is_empty());
        assert_eq!(h.mirror("a"), b"Y");
        assert!(h.mirror_linked("a", "b"));

        let old = h.repo.reconstruct(&rp("b"), t(1_000)).unwrap().unwrap();
        assert_eq!(old.content.as_deref(), Some(&b"X"[..]));
        h.assert_history();
    }

    #[test]
    fn test_deleted_holder_keeps_group_content() {
        let mut h = Harness::new();
        h.source.write_file("a", "shared").unwrap();
        h.source.hard_link(Path::new("a"), Path::new("b")).unwrap();
        h.source.hard_link(Path::new("a"), Path::new("c")).unwrap();
        h.session();

        h.source.remove_file(Path::new("a")).unwrap();
        h.session();
        assert_eq!(h.mirror("b"), b"shared");
        assert_eq!(h.mirror("c"), b"shared");
        assert!(h.mirror_linked("b", "c"));
        assert_eq!(h.increment_kinds("a"), vec![IncrementKind::Deleted]);

        h.source.write(Path::new("b"), b"updated").unwrap();
        h.session();
        assert_eq!(h.mirror("c"), b"updated");
        h.assert_history();
    }

    #[test]
    fn test_link_group_split_and_rejoin() {
        let mut h = Harness::new();
        linked_pair(&h.source);
        h.session();

        // b becomes an independent file with its own content
        h.source.remove_file(Path::new("b")).unwrap();
        h.source.write_file("b", "independent").unwrap();
        h.session();
        assert!(!h.mirror_linked("a", "b"));

        h.source.remove_file(Path::new("b")).unwrap();
        h.source.hard_link(Path::new("a"), Path::new("b")).unwrap();
        h.session();
        assert!(h.mirror_linked("a", "b"));
        h.assert_history();
    }

    #[test]
    fn test_hardlinks_without_mirror_support() {
        let mut h = Harness::new();
        h.repo_fs.set_hard_links_supported(false);
        linked_pair(&h.source);
        h.session();
        assert!(!h.mirror_linked("a", "b"));
        assert_eq!(h.mirror("b"), b"X");

        h.source.write(Path::new("a"), b"Y").unwrap();
        h.session();
        assert_eq!(h.mirror("a"), b"Y");
        assert_eq!(h.mirror("b"), b"Y");
        h.assert_history();
    }

    #[test]
    fn test_type_changes_across_sessions() {
        let mut h = Harness::new();
        let src = &h.source;
        src.write_file("f", "data").unwrap();
        src.write_file("d/x", "inside").unwrap();
        src.make_special(Path::new("p"), &EntryKind::Fifo, 0o600).unwrap();
        src.make_special(Path::new("tty"), &EntryKind::CharDevice { major: 4, minor: 1 }, 0o620)
            .unwrap();
        src.symlink(Path::new("f"), Path::new("s")).unwrap();
        h.session();

        let src = &h.source;
        src.remove_file(Path::new("f")).unwrap();
        src.symlink(Path::new("d"), Path::new("f")).unwrap();
        src.remove_tree(Path::new("d")).unwrap();
        src.write_file("d", "was a directory").unwrap();
        src.remove_file(Path::new("p")).unwrap();
        src.remove_file(Path::new("s")).unwrap();
        src.write_file("s", "now a file").unwrap();
        h.session();

        let src = &h.source;
        src.remove_file(Path::new("f")).unwrap();
        src.write_file("f", "back again").unwrap();
        src.make_special(Path::new("sock"), &EntryKind::Socket, 0o755).unwrap();
        h.session();

        // every transition is its own increment
        assert_eq!(
            h.increment_kinds("f"),
            vec![IncrementKind::Special, IncrementKind::Special]
        );
        assert_eq!(h.increment_kinds("d"), vec![IncrementKind::Special]);
        assert_eq!(h.increment_kinds("d/x"), vec![IncrementKind::Deleted]);
        assert_eq!(h.increment_kinds("p"), vec![IncrementKind::Deleted]);
        h.assert_history();
    }

    #[test]
    fn test_metadata_only_change_is_recorded() {
        let mut h = Harness::new();
        h.source.write_file("script.sh", "#!/bin/sh").unwrap();
        h.session();

        h.source.set_permissions(Path::new("script.sh"), 0o755).unwrap();
        let report = h.session();
        assert_eq!(report.stats.changed_files, 1);
        assert_eq!(h.increment_kinds("script.sh").len(), 1);
        h.assert_history();
    }

    #[test]
    fn test_metadata_blobs_follow_sessions() {
        let h = Harness::new();
        h.source.write_file("f", "content").unwrap();
        let channel = MapMetadata::new();
        channel.insert(rp("f"), "acl:v1");
        let scanner = SourceScanner::new(&h.source).with_metadata(&channel);
        h.repo.backup_at(t(1_000), &h.source, scanner).unwrap();

        channel.insert(rp("f"), "acl:v2");
        let scanner = SourceScanner::new(&h.source).with_metadata(&channel);
        let report = h.repo.backup_at(t(2_000), &h.source, scanner).unwrap();
        assert_eq!(report.stats.increment_files, 1);

        let restored = MapMetadata::new();
        let target = MemoryFs::new();
        h.repo.restore(t(1_000), &target, &restored).unwrap();
        assert_eq!(restored.snapshot().get(&rp("f")).unwrap(), b"acl:v1");
    }

    #[test]
    fn test_unreadable_entry_is_retried_next_session() {
        let mut h = Harness::new();
        h.source.write_file("a", "one").unwrap();
        h.source.write_file("b", "two").unwrap();
        h.session();

        h.source.write(Path::new("b"), b"changed").unwrap();
        h.source.fail_reads("b");
        let report = h.try_session().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, rp("b"));
        assert_eq!(report.errors[0].kind, EntryErrorKind::Transient);
        assert_eq!(h.mirror("b"), b"two");

        assert_eq!(h.repo.session_errors(t(2_000)).unwrap(), report.errors);

        h.source.allow_reads(Path::new("b"));
        h.session();
        assert!(h.repo.session_errors(t(3_000)).unwrap().is_empty());
        assert_eq!(h.mirror("b"), b"changed");
        let at_second = h.repo.reconstruct(&rp("b"), t(2_000)).unwrap().unwrap();
        assert_eq!(at_second.content.as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_out_of_order_source_needs_regression() {
        let mut h = Harness::new();
        h.source.write_file("a", "first").unwrap();
        h.source.write_file("b", "second").unwrap();
        h.session();

        h.source.write(Path::new("a"), b"changed").unwrap();
        let entry = |path: &str| {
            Ok(SourceEntry {
                path: rp(path),
                state: h.source.lstat(Path::new(path)).unwrap().unwrap(),
                metadata: None,
            })
        };
        let err = h
            .repo
            .backup_at(t(2_000), &h.source, vec![entry(""), entry("b"), entry("a")])
            .unwrap_err();
        assert!(matches!(err, RetrobakError::SourceOrder { .. }));
        assert!(h.repo.needs_regress().unwrap());
        assert_eq!(h.repo.list_sessions().unwrap(), vec![t(1_000)]);

        // the next session regresses first and then runs normally
        h.session();
        assert!(!h.repo.needs_regress().unwrap());
        assert_eq!(h.mirror("a"), b"changed");
        h.assert_history();
    }

    #[test]
    fn test_live_session_blocks_others() {
        let mut h = Harness::with_builder(RepositoryBuilder::new().liveness_probe(Arc::new(AlwaysAlive)));
        h.source.write_file("f", "one").unwrap();
        h.session();

        h.source.write(Path::new("f"), b"two").unwrap();
        h.repo_fs.crash_after(5);
        assert!(h
            .repo
            .backup_at(t(2_000), &h.source, SourceScanner::new(&h.source))
            .is_err());
        h.repo_fs.revive();
        assert!(h.repo.needs_regress().unwrap());

        let before = h.repo_fs.mutation_count();
        let err = h
            .repo
            .backup_at(t(3_000), &h.source, SourceScanner::new(&h.source))
            .unwrap_err();
        assert!(matches!(err, RetrobakError::Conflict { .. }));
        assert!(err.is_recoverable());
        assert!(matches!(h.repo.regress(), Err(RetrobakError::Conflict { .. })));
        assert_eq!(h.repo_fs.mutation_count(), before);

        // a process that sees the owner gone may regress
        let repo = RepositoryBuilder::new().open(h.repo_fs.clone()).unwrap();
        assert!(matches!(repo.regress().unwrap(), RegressOutcome::Regressed { .. }));
        assert_eq!(h.mirror("f"), b"one");
    }

    #[test]
    fn test_excluded_paths_stay_out() {
        let h = Harness::new();
        h.source.write_file("keep.txt", "kept").unwrap();
        h.source.write_file("cache/blob.bin", "skip").unwrap();
        h.source.write_file("cache/sub/deeper", "skip").unwrap();
        let scanner = SourceScanner::new(&h.source)
            .with_exclude_patterns(&["cache"])
            .unwrap();
        let report = h.repo.backup_at(t(1_000), &h.source, scanner).unwrap();
        assert_eq!(report.stats.source_files, 2);
        assert!(!h.repo_fs.exists(Path::new("mirror/cache")).unwrap());

        let target = MemoryFs::new();
        h.repo.restore(t(1_000), &target, &NoMetadata).unwrap();
        assert_eq!(target.read(Path::new("keep.txt")).unwrap(), b"kept");
        assert!(!target.exists(Path::new("cache")).unwrap());
    }

    #[test]
    fn test_uncompressed_repository() {
        let mut h = Harness::with_builder(RepositoryBuilder::new().compression(PayloadCompression::None));
        h.source.write_file("notes.txt", "draft one").unwrap();
        h.session();
        h.source.write(Path::new("notes.txt"), b"draft two, longer").unwrap();
        h.session();

        let increments = h.repo.list_increments(&rp("notes.txt")).unwrap();
        assert_eq!(increments.len(), 1);
        assert!(!increments[0].compressed);
        h.assert_history();
    }

    #[test]
    fn test_retention_keeps_recent_sessions() {
        let mut h = Harness::new();
        for round in 0..4 {
            h.source
                .write_file("log.txt", format!("entry {round}\n").repeat(round + 1))
                .unwrap();
            h.source.write_file(format!("day{round}.txt"), "daily").unwrap();
            h.session();
        }

        let report = h.repo.remove_older_than(t(3_000)).unwrap();
        assert_eq!(report.sessions_removed, vec![t(1_000), t(2_000)]);
        assert!(report.increments_removed > 0);
        assert_eq!(h.repo.list_sessions().unwrap(), vec![t(3_000), t(4_000)]);

        for (time, expected) in &h.history[2..] {
            assert_eq!(&h.restored(*time), expected, "state as of {}", time);
        }
        let target = MemoryFs::new();
        let err = h.repo.restore(t(1_500), &target, &NoMetadata).unwrap_err();
        assert!(matches!(err, RetrobakError::SessionNotFound(_)));
    }

    #[test]
    fn test_retention_drops_error_logs() {
        let mut h = Harness::new();
        h.source.write_file("a", "one").unwrap();
        h.source.write_file("b", "two").unwrap();
        h.source.fail_reads("b");
        assert_eq!(h.try_session().unwrap().errors.len(), 1);
        let log = PathBuf::from(format!("data/error_log.{}.json", t(1_000)));
        assert!(h.repo_fs.exists(&log).unwrap());

        h.source.allow_reads(Path::new("b"));
        h.session();
        h.session();

        let report = h.repo.remove_older_than(t(3_000)).unwrap();
        assert_eq!(report.sessions_removed, vec![t(1_000), t(2_000)]);
        assert!(!h.repo_fs.exists(&log).unwrap());
        assert!(h.repo.session_errors(t(1_000)).unwrap().is_empty());
    }

    #[test]
    fn test_regression_drops_error_log() {
        let log = PathBuf::from(format!("data/error_log.{}.json", t(2_000)));
        let mut checked = 0;
        for point in 0.. {
            let mut h = Harness::new();
            h.source.write_file("a", "one").unwrap();
            h.source.write_file("b", "two").unwrap();
            h.session();
            h.source.write(Path::new("a"), b"changed").unwrap();
            h.source.fail_reads("b");

            h.repo_fs.crash_after(point);
            let result = h.try_session();
            h.repo_fs.revive();
            if result.is_ok() {
                break;
            }
            if !h.repo_fs.exists(&log).unwrap() {
                continue;
            }

            // the log landed but the session never committed
            assert!(h.repo.needs_regress().unwrap());
            h.repo.regress().unwrap();
            assert!(!h.repo_fs.exists(&log).unwrap());
            assert_eq!(h.repo.list_sessions().unwrap(), vec![t(1_000)]);
            checked += 1;
        }
        assert!(checked >= 1, "no crash point left an uncommitted error log");
    }

    #[test]
    fn test_statistics_persisted_per_session() {
        let mut h = Harness::new();
        h.source.write_file("a", "1").unwrap();
        h.source.write_file("b", "2").unwrap();
        h.session();
        h.source.remove_file(Path::new("a")).unwrap();
        h.source.write(Path::new("b"), b"22").unwrap();
        let report = h.session();

        let stats = h.repo.session_statistics(t(2_000)).unwrap();
        assert_eq!(stats, report.stats);
        assert_eq!(stats.deleted_files, 1);
        assert_eq!(stats.changed_files, 1);
        assert_eq!(stats.mirror_files, 2);
    }
}
