//! Shared helpers for the traversal integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use duz::record::NodeState;
use duz::{Traversal, TreeErrorKind};

/// Nanosecond-stamped scratch directory removed on drop.
pub struct TempTree {
    root: PathBuf,
}

impl TempTree {
    pub fn new(label: &str) -> Self {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("duz_{label}_{}_{stamp}", std::process::id()));
        fs::create_dir(&root).unwrap();
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn root_bytes(&self) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        self.root.as_os_str().as_bytes().to_vec()
    }

    pub fn file(&self, rel: &str, len: usize) -> PathBuf {
        let path = self.root.join(rel);
        fs::write(&path, vec![b'x'; len]).unwrap();
        path
    }

    pub fn dir(&self, rel: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(&path).unwrap();
        path
    }
}

impl Drop for TempTree {
    fn drop(&mut self) {
        // Restore permissions first so EACCES fixtures can be deleted.
        restore_permissions(&self.root);
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn restore_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o755));
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                restore_permissions(&entry.path());
            }
        }
    }
}

/// True when EACCES fixtures are meaningless (root bypasses permission
/// checks).
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn run_threaded(root: &[u8], workers: usize) -> Arc<Traversal> {
    duz::traversal::threaded::run(root, duz::ThreadedConfig { workers }).unwrap()
}

/// `Some(traversal)` or `None` when the kernel cannot create an io_uring.
#[cfg(target_os = "linux")]
pub fn run_uring(root: &[u8]) -> Option<Arc<Traversal>> {
    match duz::traversal::uring::run(root, Default::default()) {
        Ok(traversal) => Some(traversal),
        Err(err) => {
            eprintln!("skipping io_uring run: {err}");
            None
        }
    }
}

/// Both backends over the same root; the io_uring entry is absent when the
/// environment lacks it.
pub fn run_both(root: &[u8]) -> Vec<Arc<Traversal>> {
    let mut runs = vec![run_threaded(root, 8)];
    #[cfg(target_os = "linux")]
    if let Some(traversal) = run_uring(root) {
        runs.push(traversal);
    }
    runs
}

/// Flat snapshot of a finished traversal keyed by path.
pub struct Snapshot {
    pub by_path: HashMap<Vec<u8>, (NodeState, u64)>,
}

impl Snapshot {
    pub fn of(traversal: &Traversal) -> Self {
        let mut by_path = HashMap::new();
        for index in 0..traversal.len() {
            let node = traversal.node(index);
            let previous =
                by_path.insert(node.path().as_bytes().to_vec(), (node.state(), node.size()));
            assert!(previous.is_none(), "duplicate record path");
        }
        Self { by_path }
    }

    pub fn size_of(&self, path: &[u8]) -> u64 {
        let (state, size) = &self.by_path[path];
        assert!(state.is_terminal());
        *size
    }

    pub fn state_of(&self, path: &[u8]) -> NodeState {
        self.by_path[path].0
    }
}

/// Structural invariants that must hold for any finished traversal:
/// self-parenting root, `parent < index` everywhere else, every record
/// terminal, and every completed directory's size equal to the sum of its
/// direct children's sizes.
pub fn check_invariants(traversal: &Traversal) {
    assert!(traversal.progress().is_finished());
    assert_eq!(
        traversal.progress().completed_count(),
        traversal.len(),
        "every record reaches a terminal state"
    );

    let len = traversal.len();
    let mut child_sums: Vec<u64> = vec![0; len as usize];
    for index in (1..len).rev() {
        let node = traversal.node(index);
        assert!(node.parent() < index, "parent precedes child");
        assert!(node.state().is_terminal());
        if let NodeState::CompletedDirectory = node.state() {
            assert_eq!(
                node.size(),
                child_sums[index as usize],
                "directory size equals the sum of its children"
            );
        }
        if let NodeState::Errored(_) = node.state() {
            assert_eq!(node.size(), 0, "errored records contribute zero bytes");
        }
        child_sums[node.parent() as usize] += node.size();
    }

    let root = traversal.node(duz::ROOT_INDEX);
    assert_eq!(root.parent(), duz::ROOT_INDEX, "root is self-parenting");
    assert!(root.state().is_terminal());
    if let NodeState::CompletedDirectory = root.state() {
        assert_eq!(root.size(), child_sums[0]);
    }
}

/// Reference walk with std::fs: total byte size of every regular file and
/// symlink under `path` (symlinks counted as their own length).
pub fn naive_tree_size(path: &Path) -> u64 {
    let mut total = 0;
    for entry in fs::read_dir(path).unwrap() {
        let entry = entry.unwrap();
        let meta = fs::symlink_metadata(entry.path()).unwrap();
        if meta.file_type().is_dir() {
            total += naive_tree_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

pub fn expect_errored(state: NodeState, kind: TreeErrorKind) {
    assert_eq!(state, NodeState::Errored(kind));
}
