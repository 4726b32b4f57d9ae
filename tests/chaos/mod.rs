//! Chaos tests for Retrobak
//!
//! Interrupts sessions (and regressions) after every possible number of
//! filesystem mutations and checks that regression always brings the
//! repository back to exactly where it was before the session started.

use crate::integration::{linked_pair, t, Harness, Tree};
use ::retrobak::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Everything regression is responsible for
///
/// Mirror and increments are compared entry by entry including metadata;
/// the data area by the content of its files. Staging leftovers are ignored.
#[derive(Debug, PartialEq, Eq)]
pub struct Image {
    pub mirror: Tree,
    pub increments: Tree,
    pub data: BTreeMap<PathBuf, Vec<u8>>,
}

pub fn image(fs: &MemoryFs) -> Image {
    let data = fs
        .dump(Path::new("data"))
        .into_iter()
        .filter(|(path, entry)| !path.starts_with("tmp") && entry.kind.is_regular())
        .map(|(path, entry)| (path, entry.data))
        .collect();
    Image {
        mirror: fs.dump(Path::new("mirror")),
        increments: fs.dump(Path::new("increments")),
        data,
    }
}

/// First session covers a bit of everything
fn stage_one(source: &MemoryFs) {
    source
        .write_file("docs/guide.md", "# Guide\n".repeat(64))
        .unwrap();
    source.write_file("docs/old.txt", "to be deleted").unwrap();
    source.write_file("build/out/a.o", "object a").unwrap();
    source.write_file("build/out/b.o", "object b").unwrap();
    source.write_file("config", "key = value").unwrap();
    source.write_file("shape", "a file for now").unwrap();
    source.write_file("tree/leaf", "leaf").unwrap();
    source.write_file("unchanged", "steady").unwrap();
    source.make_special(Path::new("pipe"), &EntryKind::Fifo, 0o600).unwrap();
}

/// Second session changes, adds, deletes and retypes entries
fn stage_two(source: &MemoryFs) {
    let mut guide = "# Guide\n".repeat(64);
    guide.push_str("one more line\n");
    source.write(Path::new("docs/guide.md"), guide.as_bytes()).unwrap();
    source.remove_file(Path::new("docs/old.txt")).unwrap();
    source.write_file("docs/new/fresh.txt", "brand new").unwrap();
    source.remove_tree(Path::new("build")).unwrap();
    source.remove_file(Path::new("config")).unwrap();
    source.symlink(Path::new("shape"), Path::new("config")).unwrap();
    source.remove_file(Path::new("shape")).unwrap();
    source.create_dir(Path::new("shape")).unwrap();
    source.write_file("shape/inner", "now a directory").unwrap();
    source.remove_tree(Path::new("tree")).unwrap();
    source.write_file("tree", "a file where a tree was").unwrap();
    source.set_permissions(Path::new("pipe"), 0o644).unwrap();
}

fn hardlink_stage_two(source: &MemoryFs) {
    source.write(Path::new("a"), b"Y").unwrap();
    source.write_file("c", "unrelated").unwrap();
}

/// Harness with the first session committed and the source moved on
fn fixture(stage1: fn(&MemoryFs), stage2: fn(&MemoryFs)) -> Harness {
    let mut h = Harness::new();
    stage1(&h.source);
    h.session();
    stage2(&h.source);
    h
}

/// Mutations a clean second session performs
fn session_mutations(stage1: fn(&MemoryFs), stage2: fn(&MemoryFs)) -> u64 {
    let mut h = fixture(stage1, stage2);
    let before = h.repo_fs.mutation_count();
    h.session();
    h.repo_fs.mutation_count() - before
}

/// Second session interrupted after `point` mutations
fn crashed(stage1: fn(&MemoryFs), stage2: fn(&MemoryFs), point: u64) -> (Harness, Image) {
    let h = fixture(stage1, stage2);
    let pre = image(&h.repo_fs);
    h.repo_fs.crash_after(point);
    let result = h
        .repo
        .backup_at(h.next_time(), &h.source, SourceScanner::new(&h.source));
    assert!(result.is_err(), "session survived a crash after {} mutations", point);
    assert!(h.repo_fs.has_crashed());
    h.repo_fs.revive();
    (h, pre)
}

fn crash_everywhere(stage1: fn(&MemoryFs), stage2: fn(&MemoryFs)) {
    let total = session_mutations(stage1, stage2);
    info!("second session performs {} mutations", total);
    assert!(total > 10);

    for point in 0..total {
        let (mut h, pre) = crashed(stage1, stage2, point);
        match h.repo.regress().unwrap() {
            RegressOutcome::Clean => debug!("crash at {} left no marker", point),
            RegressOutcome::Regressed { reverted, skipped, .. } => {
                debug!("crash at {}: {} reverted, {} skipped", point, reverted, skipped)
            }
        }
        assert_eq!(image(&h.repo_fs), pre, "crash after {} mutations", point);
        assert!(!h.repo.needs_regress().unwrap());
        assert_eq!(h.repo.list_sessions().unwrap(), vec![t(1_000)]);

        // a clean repository regresses to itself
        assert_eq!(h.repo.regress().unwrap(), RegressOutcome::Clean);
        assert_eq!(image(&h.repo_fs), pre);

        // and the interrupted session can simply run again
        h.session();
        assert_eq!(h.repo.list_sessions().unwrap(), vec![t(1_000), t(2_000)]);
        h.assert_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_crash_at_every_point() {
        crash_everywhere(stage_one, stage_two);
        assert!(logs_contain("second session performs"));
        assert!(logs_contain("crash at 0 left no marker"));
        assert!(logs_contain("reverted"));
    }

    #[test]
    #[traced_test]
    fn test_crash_at_every_point_with_hardlinks() {
        crash_everywhere(linked_pair, hardlink_stage_two);
        assert!(logs_contain("crash at 0 left no marker"));
        assert!(logs_contain("reverted"));
    }

    #[test]
    #[traced_test]
    fn test_crash_during_initial_session() {
        let reference = Harness::new();
        stage_one(&reference.source);
        let before = reference.repo_fs.mutation_count();
        reference
            .repo
            .backup_at(t(1_000), &reference.source, SourceScanner::new(&reference.source))
            .unwrap();
        let total = reference.repo_fs.mutation_count() - before;

        for point in 0..total {
            let mut h = Harness::new();
            stage_one(&h.source);
            // every repository stamps its own creation time in metadata.json
            let pre = image(&h.repo_fs);
            h.repo_fs.crash_after(point);
            assert!(h
                .repo
                .backup_at(t(1_000), &h.source, SourceScanner::new(&h.source))
                .is_err());
            h.repo_fs.revive();

            h.repo.regress().unwrap();
            assert_eq!(image(&h.repo_fs), pre, "crash after {} mutations", point);
            assert!(h.repo.list_sessions().unwrap().is_empty());

            h.session();
            h.assert_history();
        }
        assert!(logs_contain(" done: "));
    }

    #[test]
    fn test_crash_during_regression() {
        let total = session_mutations(stage_one, stage_two);
        for point in [total / 4, total / 2, 3 * total / 4, total - 1] {
            let mut attempts = 0;
            loop {
                let (h, pre) = crashed(stage_one, stage_two, point);
                assert!(h.repo.needs_regress().unwrap());

                h.repo_fs.crash_after(attempts);
                let first = h.repo.regress();
                h.repo_fs.revive();
                if first.is_ok() {
                    assert_eq!(image(&h.repo_fs), pre);
                    break;
                }

                // the interrupted regression is picked up again
                assert!(h.repo.needs_regress().unwrap());
                assert!(matches!(h.repo.regress().unwrap(), RegressOutcome::Regressed { .. }));
                assert_eq!(
                    image(&h.repo_fs),
                    pre,
                    "session crash at {}, regression crash at {}",
                    point,
                    attempts
                );
                attempts += 1;
                assert!(attempts < 1_000, "regression never finished");
            }
        }
    }

    #[test]
    fn test_regress_on_clean_repository_is_a_no_op() {
        let mut h = fixture(stage_one, stage_two);
        h.session();
        let pre = image(&h.repo_fs);
        let before = h.repo_fs.mutation_count();

        assert_eq!(h.repo.regress().unwrap(), RegressOutcome::Clean);
        assert_eq!(h.repo.regress().unwrap(), RegressOutcome::Clean);
        assert_eq!(h.repo_fs.mutation_count(), before);
        assert_eq!(image(&h.repo_fs), pre);
    }

    #[test]
    fn test_interrupted_after_first_increment() {
        let total = session_mutations(linked_pair, hardlink_stage_two);
        let mut checked = 0;
        for point in 0..total {
            let (h, pre) = crashed(linked_pair, hardlink_stage_two, point);
            let increment_written = h
                .repo_fs
                .dump(Path::new("increments"))
                .values()
                .any(|entry| entry.kind.is_regular());
            if !increment_written {
                continue;
            }
            // stop once b has followed a to the new content
            if h.mirror("a") == b"Y" && h.mirror_linked("a", "b") {
                break;
            }

            assert!(h.repo.needs_regress().unwrap());
            assert!(matches!(h.repo.regress().unwrap(), RegressOutcome::Regressed { .. }));
            assert_eq!(h.mirror("a"), b"X");
            assert!(h.mirror_linked("a", "b"));
            assert!(h
                .repo_fs
                .dump(Path::new("increments"))
                .values()
                .all(|entry| entry.kind.is_dir()));
            assert!(!h.repo.needs_regress().unwrap());
            assert_eq!(image(&h.repo_fs), pre);
            checked += 1;
        }
        assert!(checked >= 3, "only {} interruption points between a and b", checked);
    }
}
