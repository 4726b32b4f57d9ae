//! Main test module for Retrobak
//!
//! This module includes all test suites:
//! - Integration tests for session scenarios
//! - Chaos tests for interruption and regression
//! - Property-based tests for invariants
//! - Edge cases against the local filesystem

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::retrobak::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn t(ms: i64) -> SessionTime {
        SessionTime::from_millis(ms).unwrap()
    }

    struct LocalSetup {
        source_dir: TempDir,
        repo_dir: TempDir,
        repo: Repository,
    }

    impl LocalSetup {
        fn new() -> Self {
            let source_dir = TempDir::new().unwrap();
            let repo_dir = TempDir::new().unwrap();
            let repo = RepositoryBuilder::new()
                .parallel_workers(2)
                .build_local(repo_dir.path())
                .unwrap();
            Self {
                source_dir,
                repo_dir,
                repo,
            }
        }

        fn source(&self) -> &Path {
            self.source_dir.path()
        }

        fn backup(&self, ms: i64) -> SessionReport {
            let source = LocalFs::new(self.source());
            let report = self
                .repo
                .backup_at(t(ms), &source, SourceScanner::new(&source))
                .unwrap();
            assert!(report.is_clean(), "entry errors: {:?}", report.errors);
            report
        }

        fn restore(&self, ms: i64) -> TempDir {
            let target_dir = TempDir::new().unwrap();
            let target = LocalFs::new(target_dir.path());
            let report = self.repo.restore(t(ms), &target, &NoMetadata).unwrap();
            assert!(report.errors.is_empty(), "restore errors: {:?}", report.errors);
            target_dir
        }
    }

    #[test]
    fn test_empty_directory() {
        let setup = LocalSetup::new();

        let report = setup.backup(1_000);
        assert_eq!(report.stats.new_files, 1);
        assert_eq!(report.stats.source_files, 1);

        fs::write(setup.source().join("file.txt"), "content").unwrap();
        setup.backup(2_000);

        // the first session restores to nothing but the root
        let target = setup.restore(1_000);
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_special_filenames() {
        let setup = LocalSetup::new();
        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file;with;semicolons.txt",
            "file;065;escape-lookalike.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
        ];

        let mut created = Vec::new();
        for name in &special_names {
            if fs::write(setup.source().join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }
        setup.backup(1_000);

        for name in &created {
            fs::remove_file(setup.source().join(name)).unwrap();
        }
        setup.backup(2_000);

        let target = setup.restore(1_000);
        for name in &created {
            let content = fs::read_to_string(target.path().join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let setup = LocalSetup::new();
        let unicode_names = vec![
            "файл.txt",
            "文件.txt",
            "ファイル.txt",
            "αρχείο.txt",
            "🚀🌟💾.txt",
        ];

        let mut created = Vec::new();
        for name in &unicode_names {
            if fs::write(setup.source().join(name), format!("Unicode content: {}", name)).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            return;
        }
        setup.backup(1_000);

        for name in &created {
            fs::write(setup.source().join(name), "overwritten").unwrap();
        }
        setup.backup(2_000);

        let target = setup.restore(1_000);
        for name in &created {
            let content = fs::read_to_string(target.path().join(name)).unwrap();
            assert_eq!(content, format!("Unicode content: {}", name));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_preservation() {
        use std::os::unix::fs::PermissionsExt;

        let setup = LocalSetup::new();
        let files = vec![
            ("readable.txt", 0o644),
            ("executable.sh", 0o755),
            ("readonly.txt", 0o444),
            ("useronly.txt", 0o600),
        ];
        for (name, mode) in &files {
            let path = setup.source().join(name);
            fs::write(&path, format!("Content of {}", name)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
        }
        setup.backup(1_000);

        for (name, _) in &files {
            let path = setup.source().join(name);
            fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
        }
        let report = setup.backup(2_000);
        assert_eq!(report.stats.changed_files, files.len() as u64);

        let target = setup.restore(1_000);
        for (name, expected_mode) in &files {
            let metadata = fs::metadata(target.path().join(name))
                .unwrap_or_else(|e| panic!("Failed to get metadata for {}: {}", name, e));
            let actual_mode = metadata.permissions().mode() & 0o777;
            assert_eq!(
                actual_mode, *expected_mode,
                "Permission mismatch for file {}: expected {:o}, got {:o}",
                name, expected_mode, actual_mode
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_and_hardlinks() {
        let setup = LocalSetup::new();
        fs::write(setup.source().join("target.txt"), "Target content").unwrap();
        std::os::unix::fs::symlink("target.txt", setup.source().join("link.txt")).unwrap();
        fs::hard_link(setup.source().join("target.txt"), setup.source().join("twin.txt")).unwrap();
        setup.backup(1_000);

        let mirror = setup.repo_dir.path().join("mirror");
        assert_eq!(
            fs::read_link(mirror.join("link.txt")).unwrap(),
            Path::new("target.txt")
        );
        let mirror_fs = LocalFs::new(&mirror);
        assert!(mirror_fs
            .same_file(Path::new("target.txt"), Path::new("twin.txt"))
            .unwrap());

        let target = setup.restore(1_000);
        assert_eq!(
            fs::read_link(target.path().join("link.txt")).unwrap(),
            Path::new("target.txt")
        );
        assert_eq!(
            fs::read_to_string(target.path().join("link.txt")).unwrap(),
            "Target content"
        );
        let target_fs = LocalFs::new(target.path());
        assert!(target_fs
            .same_file(Path::new("target.txt"), Path::new("twin.txt"))
            .unwrap());
    }

    #[test]
    fn test_large_file_diff() {
        let setup = LocalSetup::new();
        let mut content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(setup.source().join("big.bin"), &content).unwrap();
        setup.backup(1_000);

        content[100_000..100_016].copy_from_slice(b"patched in place");
        fs::write(setup.source().join("big.bin"), &content).unwrap();
        // same size; make sure the timestamp moves even on coarse clocks
        filetime::set_file_mtime(
            setup.source().join("big.bin"),
            filetime::FileTime::from_unix_time(1_000_000, 0),
        )
        .unwrap();
        let report = setup.backup(2_000);
        assert_eq!(report.stats.increment_files, 1);
        // the reverse delta is much smaller than the file
        assert!(report.stats.increment_file_size < 100_000);

        let path = RepoPath::new("big.bin").unwrap();
        let increments = setup.repo.list_increments(&path).unwrap();
        assert_eq!(increments.len(), 1);
        assert_eq!(increments[0].kind, IncrementKind::Diff);

        let old = setup.repo.reconstruct(&path, t(1_000)).unwrap().unwrap();
        let expected: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(old.content.unwrap(), expected);
    }
}
