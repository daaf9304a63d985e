//! End-to-end traversals over real directory trees, exercising both
//! backends against the same fixtures.

mod common;

use common::{
    check_invariants, run_both, run_threaded, running_as_root, Snapshot, TempTree,
};
use duz::record::NodeState;
use duz::{TreeErrorKind, ROOT_INDEX};

fn root_join(tree: &TempTree, rel: &str) -> Vec<u8> {
    let mut path = tree.root_bytes();
    path.push(b'/');
    path.extend_from_slice(rel.as_bytes());
    path
}

#[test]
fn two_files_sum_into_the_root() {
    let tree = TempTree::new("two_files");
    tree.file("a", 5);
    tree.file("b", 7);

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 3);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 12);
        assert_eq!(snapshot.size_of(&root_join(&tree, "a")), 5);
        assert_eq!(snapshot.size_of(&root_join(&tree, "b")), 7);
        assert_eq!(
            snapshot.state_of(&root_join(&tree, "a")),
            NodeState::CompletedFile
        );
    }
}

#[test]
fn nested_directory_sizes_propagate() {
    let tree = TempTree::new("nested");
    tree.dir("d");
    tree.file("d/x", 3);
    tree.file("y", 4);

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 4);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 7);
        assert_eq!(snapshot.size_of(&root_join(&tree, "d")), 3);
        assert_eq!(
            snapshot.state_of(&root_join(&tree, "d")),
            NodeState::CompletedDirectory
        );
        assert_eq!(snapshot.size_of(&root_join(&tree, "d/x")), 3);
        assert_eq!(snapshot.size_of(&root_join(&tree, "y")), 4);
    }
}

#[test]
fn empty_root_is_a_single_completed_record() {
    let tree = TempTree::new("empty");

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 1);
        let root = traversal.node(ROOT_INDEX);
        assert_eq!(root.state(), NodeState::CompletedDirectory);
        assert_eq!(root.size(), 0);
    }
}

#[test]
fn unreadable_directory_errors_but_the_root_completes() {
    if running_as_root() {
        eprintln!("skipping: euid 0 bypasses permission checks");
        return;
    }
    use std::os::unix::fs::PermissionsExt;

    let tree = TempTree::new("restricted");
    let restricted = tree.dir("restricted");
    std::fs::set_permissions(&restricted, std::fs::Permissions::from_mode(0o000)).unwrap();

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 2);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 0);
        assert_eq!(
            snapshot.state_of(&tree.root_bytes()),
            NodeState::CompletedDirectory
        );
        common::expect_errored(
            snapshot.state_of(&root_join(&tree, "restricted")),
            TreeErrorKind::AccessDenied,
        );
    }
}

#[test]
fn stat_denied_child_still_counts_as_finished() {
    if running_as_root() {
        eprintln!("skipping: euid 0 bypasses permission checks");
        return;
    }
    use std::os::unix::fs::PermissionsExt;

    // Read-but-no-search permission: the listing of `outer` succeeds (read
    // bit) while the statx of `outer/inner` fails traversal (no execute
    // bit), so the error lands on the child record.
    let tree = TempTree::new("no_search");
    let outer = tree.dir("outer");
    tree.file("outer/inner", 9);
    std::fs::set_permissions(&outer, std::fs::Permissions::from_mode(0o600)).unwrap();

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        let snapshot = Snapshot::of(&traversal);
        common::expect_errored(
            snapshot.state_of(&root_join(&tree, "outer/inner")),
            TreeErrorKind::AccessDenied,
        );
        assert_eq!(
            snapshot.state_of(&root_join(&tree, "outer")),
            NodeState::CompletedDirectory
        );
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 0);
    }
}

#[test]
fn huge_sparse_file_does_not_overflow() {
    let tree = TempTree::new("sparse");
    let path = tree.path().join("big");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(1 << 40).unwrap();
    drop(file);

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 1 << 40);
        assert_eq!(snapshot.size_of(&root_join(&tree, "big")), 1 << 40);
    }
}

#[test]
fn deep_chain_completes_every_ancestor() {
    let tree = TempTree::new("chain");
    let mut rel = String::new();
    for _ in 0..10 {
        if !rel.is_empty() {
            rel.push('/');
        }
        rel.push('a');
        tree.dir(&rel);
    }
    rel.push_str("/leaf");
    tree.file(&rel, 1);

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 12);
        let snapshot = Snapshot::of(&traversal);
        let mut prefix = String::new();
        for _ in 0..10 {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push('a');
            assert_eq!(snapshot.size_of(&root_join(&tree, &prefix)), 1);
            assert_eq!(
                snapshot.state_of(&root_join(&tree, &prefix)),
                NodeState::CompletedDirectory
            );
        }
    }
}

#[test]
fn symlinks_are_recorded_but_never_followed() {
    let tree = TempTree::new("symlinks");
    tree.file("target", 4096);
    std::os::unix::fs::symlink(tree.path().join("target"), tree.path().join("link")).unwrap();

    let target_path_len = tree.path().join("target").as_os_str().len() as u64;
    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        // target + link + root; following the link would have re-listed the
        // target or doubled the size.
        assert_eq!(traversal.len(), 3);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(
            snapshot.size_of(&root_join(&tree, "link")),
            target_path_len,
            "a symlink contributes its own length"
        );
        assert_eq!(
            snapshot.size_of(&tree.root_bytes()),
            4096 + target_path_len
        );
    }
}

#[test]
fn root_that_is_not_a_directory_errors() {
    let tree = TempTree::new("file_root");
    let file = tree.file("plain", 3);
    use std::os::unix::ffi::OsStrExt;

    for traversal in run_both(file.as_os_str().as_bytes()) {
        assert_eq!(traversal.len(), 1);
        common::expect_errored(
            traversal.node(ROOT_INDEX).state(),
            TreeErrorKind::NotDir,
        );
        assert!(traversal.progress().is_finished());
    }
}

#[test]
fn missing_root_errors_with_file_not_found() {
    let tree = TempTree::new("missing_root");
    let missing = root_join(&tree, "nope");
    for traversal in run_both(&missing) {
        assert_eq!(traversal.len(), 1);
        common::expect_errored(
            traversal.node(ROOT_INDEX).state(),
            TreeErrorKind::FileNotFound,
        );
    }
}

#[test]
fn odd_names_survive_the_round_trip() {
    let tree = TempTree::new("odd_names");
    tree.file("with space", 1);
    tree.file("unicode-ÿé", 2);
    tree.dir("dir.with.dots");
    tree.file("dir.with.dots/inner", 3);

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&root_join(&tree, "with space")), 1);
        assert_eq!(snapshot.size_of(&root_join(&tree, "unicode-ÿé")), 2);
        assert_eq!(snapshot.size_of(&root_join(&tree, "dir.with.dots")), 3);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), 6);
    }
}

#[test]
fn single_worker_traversal_is_deterministic() {
    let tree = TempTree::new("deterministic");
    tree.dir("d1");
    tree.file("d1/a", 10);
    tree.dir("d2");
    tree.file("d2/b", 20);
    tree.file("c", 30);

    let first = run_threaded(&tree.root_bytes(), 1);
    let second = run_threaded(&tree.root_bytes(), 1);
    assert_eq!(first.len(), second.len());
    for index in 0..first.len() {
        let a = first.node(index);
        let b = second.node(index);
        assert_eq!(a.path().as_bytes(), b.path().as_bytes());
        assert_eq!(a.size(), b.size());
        assert_eq!(a.state(), b.state());
    }
}

#[test]
fn repeated_runs_agree_across_worker_counts() {
    let tree = TempTree::new("worker_counts");
    for d in 0..4 {
        let dir = format!("dir{d}");
        tree.dir(&dir);
        for f in 0..8 {
            tree.file(&format!("{dir}/file{f}"), (d * 8 + f) * 13);
        }
    }

    let reference = Snapshot::of(&run_threaded(&tree.root_bytes(), 1));
    for workers in [2, 8, 32] {
        let traversal = run_threaded(&tree.root_bytes(), workers);
        check_invariants(&traversal);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.by_path.len(), reference.by_path.len());
        for (path, (state, size)) in &reference.by_path {
            let (other_state, other_size) = &snapshot.by_path[path];
            assert_eq!(state, other_state);
            assert_eq!(size, other_size);
        }
    }
}

#[test]
fn wide_directory_exercises_backpressure() {
    // More entries than the submission queue has slots, so the io_uring
    // backend must spill to its overflow buffer; the pool backend grows its
    // rings past the initial capacity.
    let tree = TempTree::new("wide");
    let mut expected = 0u64;
    for index in 0..6000u64 {
        let len = (index % 7) as usize;
        tree.file(&format!("f{index}"), len);
        expected += len as u64;
    }

    for traversal in run_both(&tree.root_bytes()) {
        check_invariants(&traversal);
        assert_eq!(traversal.len(), 6001);
        let snapshot = Snapshot::of(&traversal);
        assert_eq!(snapshot.size_of(&tree.root_bytes()), expected);
    }
}

#[test]
fn printed_output_matches_the_record_list() {
    let tree = TempTree::new("printed");
    tree.file("file", 1536);
    tree.dir("sub");

    let traversal = run_threaded(&tree.root_bytes(), 2);
    let mut out = Vec::new();
    let mut err = Vec::new();
    duz::output::print_records(&traversal, &mut out, &mut err).unwrap();
    assert!(err.is_empty());

    let stdout = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    let root_display = tree.path().display().to_string();
    assert_eq!(lines[0], format!("   1.5 KiB  {root_display}/"));
    assert!(lines
        .iter()
        .any(|line| *line == format!("   1.5 KiB  {root_display}/file")));
    assert!(lines
        .iter()
        .any(|line| *line == format!("       0 B  {root_display}/sub/")));
}
