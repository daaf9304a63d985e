//! Thread-pool backend: synchronous syscalls on the work-stealing pool.
//!
//! Each worker owns its listing scratch and a private path arena; chunks are
//! donated to the traversal when the worker retires. Directory tasks list
//! with `getdents64` and spawn their children onto the listing worker's own
//! ring, so a subtree tends to stay on one thread until someone steals it.
//! The worker that completes the root cancels the pool.

use std::io;
use std::sync::Arc;

use crate::arena::PathArena;
use crate::pool::{Pool, WorkerCtx, MAX_WORKERS};
use crate::record::ROOT_INDEX;
use crate::traversal::{list_directory, open_dir, statx_size, DirScratch, Traversal};

/// Pool sizing for the threaded backend.
#[derive(Clone, Copy, Debug)]
pub struct ThreadedConfig {
    /// Worker thread count, clamped to `1..=MAX_WORKERS`.
    pub workers: usize,
}

impl Default for ThreadedConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Default pool size: 2.5x the CPU count, capped at [`MAX_WORKERS`]. The
/// oversubscription keeps CPUs busy while other workers sit in syscalls.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 5 / 2).clamp(1, MAX_WORKERS)
}

/// One unit of traversal work; the record it targets already exists.
#[derive(Clone, Copy, Debug)]
enum Task {
    /// List a directory record's children.
    List(u32),
    /// `statx` a file record's size.
    Stat(u32),
}

struct WorkerState {
    traversal: Arc<Traversal>,
    arena: PathArena,
    scratch: DirScratch,
}

impl Drop for WorkerState {
    fn drop(&mut self) {
        // Path bytes must outlive the worker; the traversal keeps the
        // chunks until teardown.
        self.traversal.donate_strings(self.arena.take_chunks());
    }
}

/// Runs a complete traversal of `root_path` on the pool and returns the
/// finished result list.
pub fn run(root_path: &[u8], config: ThreadedConfig) -> io::Result<Arc<Traversal>> {
    let traversal = Arc::new(Traversal::new(root_path));

    match open_dir(libc::AT_FDCWD, traversal.root_cstr()) {
        Ok(fd) => traversal.set_root_fd(fd),
        Err(kind) => {
            // The root itself is errored; there is nothing to schedule.
            let finished = traversal.fail_node(ROOT_INDEX, kind);
            assert!(finished);
            return Ok(traversal);
        }
    }

    let mut pool = Pool::new(config.workers);
    // Seed before the threads exist; the first worker to wake picks it up.
    pool.handle().run(Task::List(ROOT_INDEX));

    let shared = Arc::clone(&traversal);
    pool.start(
        move |_, _| WorkerState {
            traversal: Arc::clone(&shared),
            arena: PathArena::new(),
            scratch: DirScratch::new(),
        },
        |state, ctx, task| run_task(state, ctx, task),
    );
    pool.join();

    assert!(
        traversal.progress().is_finished(),
        "pool drained before the root completed"
    );
    Ok(traversal)
}

fn run_task(state: &mut WorkerState, ctx: &WorkerCtx<'_, Task>, task: Task) {
    let finished = match task {
        Task::List(index) => list_task(state, ctx, index),
        Task::Stat(index) => {
            let traversal = &state.traversal;
            match statx_size(traversal.root_fd(), traversal.rel_cstr(index)) {
                Ok(size) => traversal.complete_file(index, size),
                Err(kind) => traversal.fail_node(index, kind),
            }
        }
    };
    if finished {
        ctx.cancel();
    }
}

/// Opens, lists, appends, schedules, and publishes the sentinel correction
/// for one directory record. Returns true when this completed the root.
fn list_task(state: &mut WorkerState, ctx: &WorkerCtx<'_, Task>, index: u32) -> bool {
    let traversal = &state.traversal;

    let dir_fd = if index == ROOT_INDEX {
        traversal.root_fd()
    } else {
        match open_dir(traversal.root_fd(), traversal.rel_cstr(index)) {
            Ok(fd) => fd,
            Err(kind) => return traversal.fail_node(index, kind),
        }
    };

    let listed = list_directory(dir_fd, &mut state.scratch);
    if index != ROOT_INDEX {
        // The root descriptor stays open for relative statx/openat.
        unsafe { libc::close(dir_fd) };
    }

    let count = match listed {
        Ok(count) => count,
        Err(kind) => return traversal.fail_node(index, kind),
    };

    // Protocol order: append every child record, schedule every child task,
    // then publish the correction in one atomic subtraction.
    traversal.append_children(index, &mut state.scratch, &mut state.arena);
    for &(child, is_dir) in &state.scratch.children {
        ctx.spawn(if is_dir {
            Task::List(child)
        } else {
            Task::Stat(child)
        });
    }
    traversal.finish_listing(index, count)
}
