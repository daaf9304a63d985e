//! The traversal protocol shared by both backends.
//!
//! # Node lifecycle
//!
//! ```text
//!              append                listing done             cascade
//!  directory ──────────► incomplete(sentinel) ──► incomplete(n) ──► 0
//!  file      ──────────► incomplete_file ───────► completed_file
//!  any       ──────────► errored(kind)   (one finished child, zero bytes)
//! ```
//!
//! A directory's children may complete while the directory is still being
//! listed, so its remaining-children counter starts at the maximum value
//! (the sentinel) and is corrected afterwards by subtracting
//! `sentinel - actual_count` in one atomic step. Child records are appended
//! before their tasks are scheduled, which is why `parent < child` holds for
//! every edge.
//!
//! # Cascade
//!
//! When a record reaches a terminal state its size is added to the parent
//! (relaxed `fetch_add`) and then the parent's counter is decremented with
//! `AcqRel`; in that order, so any thread that observes the parent's
//! completed-directory word also observes the full size. The decrement that
//! lands on zero continues the walk upward; reaching the root finishes the
//! traversal.
//!
//! # Listing
//!
//! Directories are enumerated with `getdents64` into per-worker scratch.
//! The whole listing is collected before any child record is appended, so a
//! mid-listing failure can mark the directory errored without orphaning
//! already-scheduled children.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::arena::PathArena;
use crate::errors::TreeErrorKind;
use crate::record::{Node, PathZ, ROOT_INDEX, SENTINEL_CHILDREN};
use crate::stdx::AppendList;

pub mod threaded;
#[cfg(target_os = "linux")]
pub mod uring;

/// `getdents64` buffer size per worker.
const DIRENT_BUF_LEN: usize = 64 * 1024;

// ============================================================================
// Traversal state
// ============================================================================

/// One root's traversal: the result list, the shared string store, and the
/// completion/polling state. Created per root path, handed to a backend to
/// drive, then to the printer to consume.
pub struct Traversal {
    nodes: AppendList<Node>,
    progress: Progress,
    /// Root path bytes plus chunks donated by retiring worker arenas.
    strings: Mutex<PathArena>,
    /// Root directory descriptor; every relative `statx`/`openat` resolves
    /// against it. Set once by the driving backend.
    root_fd: AtomicI32,
    /// Byte offset into any non-root record's path where the root-relative
    /// part starts.
    rel_offset: usize,
}

impl Traversal {
    /// Appends the root record (self-parenting, pre-listing sentinel state).
    pub fn new(root_path: &[u8]) -> Self {
        assert!(!root_path.is_empty() && !root_path.contains(&0));
        let mut strings = PathArena::new();
        // SAFETY: interned bytes are nul-terminated and live until the
        // traversal is dropped.
        let path = unsafe { PathZ::from_raw(strings.intern_z(root_path)) };
        let rel_offset = root_path.len() + usize::from(!root_path.ends_with(b"/"));

        let nodes = AppendList::new();
        let index = nodes.push(Node::new_directory(ROOT_INDEX, path));
        assert_eq!(index, ROOT_INDEX);

        Self {
            nodes,
            progress: Progress::new(),
            strings: Mutex::new(strings),
            root_fd: AtomicI32::new(-1),
            rel_offset,
        }
    }

    /// Number of records discovered so far (final once the traversal ends).
    pub fn len(&self) -> u32 {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: u32) -> &Node {
        self.nodes.get(index)
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// The root path as a C string (for the initial `openat`).
    pub fn root_cstr(&self) -> &CStr {
        self.nodes.get(ROOT_INDEX).path().suffix_cstr(0)
    }

    pub fn set_root_fd(&self, fd: RawFd) {
        let previous = self.root_fd.swap(fd, Ordering::Release);
        debug_assert_eq!(previous, -1, "root descriptor set twice");
    }

    pub fn root_fd(&self) -> RawFd {
        let fd = self.root_fd.load(Ordering::Acquire);
        debug_assert!(fd >= 0, "root descriptor not yet opened");
        fd
    }

    /// A non-root record's path relative to the root descriptor.
    pub fn rel_cstr(&self, index: u32) -> &CStr {
        debug_assert_ne!(index, ROOT_INDEX);
        self.nodes.get(index).path().suffix_cstr(self.rel_offset)
    }

    /// Absorbs a retiring worker arena's chunks so its path bytes survive
    /// until the traversal is dropped.
    pub fn donate_strings(&self, chunks: Vec<Box<[u8]>>) {
        self.strings
            .lock()
            .expect("string store poisoned")
            .adopt(chunks);
    }

    // ------------------------------------------------------------------
    // Listing protocol
    // ------------------------------------------------------------------

    /// Appends one record per listed entry (directories in the pre-listing
    /// sentinel state, files incomplete), leaving `(index, is_dir)` pairs in
    /// `scratch.children` for the caller to schedule. Child paths are
    /// joined into `arena`.
    pub fn append_children(
        &self,
        parent: u32,
        scratch: &mut DirScratch,
        arena: &mut PathArena,
    ) {
        scratch.children.clear();
        let parent_path = self.nodes.get(parent).path().as_bytes();
        for entry in &scratch.entries {
            let name = &scratch.names[entry.name_off as usize..][..entry.name_len as usize];
            // SAFETY: join_z produces a nul-terminated string in an arena
            // whose chunks are donated to this traversal before teardown.
            let path = unsafe { PathZ::from_raw(arena.join_z(parent_path, name)) };
            let node = if entry.is_dir {
                Node::new_directory(parent, path)
            } else {
                Node::new_file(parent, path)
            };
            let index = self.nodes.push(node);
            assert!(parent < index);
            scratch.children.push((index, entry.is_dir));
        }
    }

    /// Publishes the sentinel correction once every child record exists and
    /// every child task is scheduled. Returns true when this completed the
    /// whole traversal (possible for an empty subtree).
    #[must_use]
    pub fn finish_listing(&self, parent: u32, children: u32) -> bool {
        debug_assert!(children < SENTINEL_CHILDREN);
        let new = self
            .nodes
            .get(parent)
            .finish_children(SENTINEL_CHILDREN - children);
        if new == 0 {
            self.on_terminal(parent)
        } else {
            false
        }
    }

    /// Records a file's `statx` result. Returns true when this completed
    /// the whole traversal.
    #[must_use]
    pub fn complete_file(&self, index: u32, size: u64) -> bool {
        self.nodes.get(index).complete_file(size);
        self.on_terminal(index)
    }

    /// Marks a node errored. For directories this is only valid before any
    /// child record was appended (open or listing failure). Returns true
    /// when this completed the whole traversal.
    #[must_use]
    pub fn fail_node(&self, index: u32, kind: TreeErrorKind) -> bool {
        self.nodes.get(index).set_errored(kind);
        self.on_terminal(index)
    }

    /// Propagation cascade: walk completed nodes upward, adding each size
    /// to its parent before the child-count decrement of that parent.
    /// Returns true when the root reached its terminal state.
    fn on_terminal(&self, start: u32) -> bool {
        let mut index = start;
        loop {
            self.progress.record_terminal();
            if index == ROOT_INDEX {
                self.progress.finish();
                return true;
            }
            let node = self.nodes.get(index);
            let parent_index = node.parent();
            let parent = self.nodes.get(parent_index);
            parent.add_size(node.size());
            if parent.finish_children(1) != 0 {
                return false;
            }
            index = parent_index;
        }
    }
}

impl Drop for Traversal {
    fn drop(&mut self) {
        let fd = self.root_fd.load(Ordering::Acquire);
        if fd >= 0 {
            // SAFETY: fd was opened by the driving backend and is owned by
            // this traversal from set_root_fd on.
            unsafe { libc::close(fd) };
        }
    }
}

// ============================================================================
// Polling / finish interface
// ============================================================================

/// Wait-for-progress handle exposed to the printer.
///
/// Completers only touch atomics; the finish transition broadcasts. Waiters
/// revalidate on a short condvar timeout, so per-record completions stay off
/// the syscall path.
pub struct Progress {
    completed: AtomicU32,
    finished: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Progress {
    fn new() -> Self {
        Self {
            completed: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[inline]
    fn record_terminal(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        let _guard = self.lock.lock().expect("progress lock poisoned");
        self.cond.notify_all();
    }

    /// Records that have reached a terminal state so far.
    pub fn completed_count(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Blocks until more records have completed than `prev`, returning the
    /// new count, or `None` once the traversal is over and the count is
    /// stable at `prev`. Never returns a value below `prev`.
    pub fn poll(&self, prev: u32) -> Option<u32> {
        loop {
            let completed = self.completed_count();
            if completed > prev {
                return Some(completed);
            }
            if self.is_finished() {
                // Re-read after the finished flag: the final completion
                // happens before finish is published.
                let completed = self.completed_count();
                return (completed > prev).then_some(completed);
            }
            let guard = self.lock.lock().expect("progress lock poisoned");
            if self.is_finished() || self.completed_count() > prev {
                continue;
            }
            let _ = self
                .cond
                .wait_timeout(guard, Duration::from_millis(1))
                .expect("progress lock poisoned");
        }
    }
}

// ============================================================================
// Directory listing (getdents64)
// ============================================================================

/// One directory entry reference into [`DirScratch::names`].
struct EntryRef {
    name_off: u32,
    name_len: u16,
    is_dir: bool,
}

/// Per-worker listing scratch: the `getdents64` buffer, the packed names of
/// the directory being listed, and the child records appended from them.
/// Reused across listings to keep the hot path allocation-free.
pub struct DirScratch {
    buf: Vec<u8>,
    names: Vec<u8>,
    entries: Vec<EntryRef>,
    /// `(record index, is_dir)` pairs from the latest `append_children`.
    pub children: Vec<(u32, bool)>,
}

impl DirScratch {
    pub fn new() -> Self {
        Self {
            buf: vec![0; DIRENT_BUF_LEN],
            names: Vec::new(),
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Injects a listing entry without a real directory, for protocol tests.
    #[cfg(test)]
    pub(crate) fn push_test_entry(&mut self, name: &[u8], is_dir: bool) {
        let name_off = self.names.len() as u32;
        self.names.extend_from_slice(name);
        self.entries.push(EntryRef {
            name_off,
            name_len: name.len() as u16,
            is_dir,
        });
    }
}

impl Default for DirScratch {
    fn default() -> Self {
        Self::new()
    }
}

// struct linux_dirent64 layout: d_ino (8), d_off (8), d_reclen (2),
// d_type (1), then the nul-terminated name.
const DIRENT_RECLEN_OFF: usize = 16;
const DIRENT_TYPE_OFF: usize = 18;
const DIRENT_NAME_OFF: usize = 19;

/// Enumerates an open directory into `scratch.entries`, skipping `.` and
/// `..`. The full listing is collected before returning, so a failure leaves
/// no partial children behind. Entry order is the kernel's iteration order.
pub fn list_directory(fd: RawFd, scratch: &mut DirScratch) -> Result<u32, TreeErrorKind> {
    scratch.names.clear();
    scratch.entries.clear();

    loop {
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                scratch.buf.as_mut_ptr(),
                scratch.buf.len(),
            )
        };
        if read < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(TreeErrorKind::from_errno(errno));
        }
        if read == 0 {
            return Ok(scratch.entries.len() as u32);
        }

        let filled = &scratch.buf[..read as usize];
        let mut pos = 0usize;
        while pos < filled.len() {
            let record = &filled[pos..];
            assert!(record.len() >= DIRENT_NAME_OFF, "truncated dirent record");
            let reclen = u16::from_ne_bytes([
                record[DIRENT_RECLEN_OFF],
                record[DIRENT_RECLEN_OFF + 1],
            ]) as usize;
            assert!(reclen >= DIRENT_NAME_OFF && reclen <= record.len());
            let d_type = record[DIRENT_TYPE_OFF];

            let name_area = &record[DIRENT_NAME_OFF..reclen];
            let name_len = name_area
                .iter()
                .position(|&byte| byte == 0)
                .expect("dirent name missing terminator");
            let name = &name_area[..name_len];
            pos += reclen;

            if name == b"." || name == b".." {
                continue;
            }
            if scratch.entries.len() as u32 >= SENTINEL_CHILDREN - 1 {
                return Err(TreeErrorKind::TooManyResults);
            }

            let name_off = scratch.names.len() as u32;
            scratch.names.extend_from_slice(name);
            scratch.entries.push(EntryRef {
                name_off,
                name_len: name_len as u16,
                // DT_UNKNOWN falls to the stat path: statx with
                // AT_SYMLINK_NOFOLLOW reports the entry's own size.
                is_dir: d_type == libc::DT_DIR,
            });
        }
    }
}

// ============================================================================
// Blocking syscall helpers (pool backend; the submit/complete engine uses
// the io_uring equivalents of these)
// ============================================================================

pub(crate) fn open_dir(dirfd: RawFd, path: &CStr) -> Result<RawFd, TreeErrorKind> {
    let fd = unsafe {
        libc::openat(
            dirfd,
            path.as_ptr(),
            libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(TreeErrorKind::from_errno(errno));
    }
    Ok(fd)
}

pub(crate) fn statx_size(dirfd: RawFd, path: &CStr) -> Result<u64, TreeErrorKind> {
    let mut stx = unsafe { std::mem::zeroed::<libc::statx>() };
    let rc = unsafe {
        libc::statx(
            dirfd,
            path.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW | libc::AT_STATX_DONT_SYNC,
            libc::STATX_SIZE,
            &mut stx,
        )
    };
    if rc < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(TreeErrorKind::from_errno(errno));
    }
    Ok(stx.stx_size)
}
