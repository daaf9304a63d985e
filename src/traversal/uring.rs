//! Submit/complete backend: one thread driving an io_uring submission queue.
//!
//! # Shape
//!
//! Every in-flight operation carries a 64-bit user token packing the target
//! node index (32 bits), the task kind (4 bits), and the slot of its `statx`
//! buffer in the slab (28 bits). The main loop retries the overflow buffer,
//! submits, reaps up to [`REAP_BATCH`] completions, and dispatches each by
//! token kind; it terminates when the outstanding-operation count reaches
//! zero, which coincides with the root reaching its terminal state.
//!
//! # Task kinds
//!
//! - `stat_file`: `Statx` with `AT_SYMLINK_NOFOLLOW | AT_STATX_DONT_SYNC`,
//!   mask `STATX_SIZE`, path relative to the root directory descriptor.
//! - `open_dir`: `OpenAt` with `O_RDONLY | O_NOFOLLOW | O_DIRECTORY |
//!   O_CLOEXEC`. The completion handler iterates the directory with
//!   `getdents64` right there, appends the child records, schedules their
//!   tasks, publishes the sentinel correction, and submits a `close_fd`.
//! - `close_fd`: `Close`; its completion needs no handling.
//!
//! # Back-pressure
//!
//! A task that cannot be queued (submission queue full, or no free `statx`
//! slot) goes to a LIFO overflow buffer and is retried before the next
//! submit. Draining newest-first keeps the working set small.
//!
//! # Buffer lifetimes
//!
//! A `statx` buffer lives boxed in the slab from submit until its CQE is
//! reaped, so the kernel always writes through a stable address. Path bytes
//! live in the engine's arena (or the result list), which outlives the ring.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use io_uring::{opcode, types, IoUring, Probe};

use crate::arena::PathArena;
use crate::errors::TreeErrorKind;
use crate::record::ROOT_INDEX;
use crate::stdx::Slab;
use crate::traversal::{list_directory, DirScratch, Traversal};

/// Submission queue depth.
const QUEUE_DEPTH: u32 = 4096;

/// CQEs dispatched per reap round.
const REAP_BATCH: usize = 64;

const KIND_STAT: u64 = 0;
const KIND_OPEN_DIR: u64 = 1;
const KIND_CLOSE_FD: u64 = 2;

const KIND_SHIFT: u64 = 28;
const NODE_SHIFT: u64 = 32;
const SLOT_MASK: u64 = (1 << KIND_SHIFT) - 1;
const KIND_MASK: u64 = 0xf;

#[derive(Clone, Copy, Debug)]
pub struct UringConfig {
    pub entries: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            entries: QUEUE_DEPTH,
        }
    }
}

#[inline]
fn pack_token(node: u32, kind: u64, slot: u32) -> u64 {
    debug_assert!(kind <= KIND_MASK);
    debug_assert!(u64::from(slot) <= SLOT_MASK);
    (u64::from(node) << NODE_SHIFT) | (kind << KIND_SHIFT) | u64::from(slot)
}

#[inline]
fn unpack_token(token: u64) -> (u32, u64, u32) {
    (
        (token >> NODE_SHIFT) as u32,
        (token >> KIND_SHIFT) & KIND_MASK,
        (token & SLOT_MASK) as u32,
    )
}

/// A task that has not made it into the submission queue yet.
#[derive(Clone, Copy, Debug)]
enum Pending {
    StatFile(u32),
    OpenDir(u32),
    CloseFd(RawFd),
}

struct Engine<'t> {
    traversal: &'t Traversal,
    ring: IoUring,
    /// In-flight `statx` output buffers, keyed by the token's slot field.
    stat_bufs: Slab<Box<libc::statx>>,
    /// Tasks that hit a full submission queue or a full slab; LIFO retry.
    overflow: Vec<Pending>,
    outstanding: usize,
    arena: PathArena,
    scratch: DirScratch,
    max_stat_slots: usize,
    /// In-flight cap; keeps unreaped completions within the CQ ring.
    max_in_flight: usize,
}

/// Runs a complete traversal of `root_path` over io_uring and returns the
/// finished result list. Fails up-front (so the caller can fall back to the
/// threaded backend) when the ring cannot be created or the kernel lacks
/// the opcodes.
pub fn run(root_path: &[u8], config: UringConfig) -> io::Result<Arc<Traversal>> {
    let ring = IoUring::new(config.entries)?;
    probe_required_opcodes(&ring)?;

    let traversal = Arc::new(Traversal::new(root_path));
    let mut engine = Engine {
        traversal: &traversal,
        ring,
        stat_bufs: Slab::new(),
        overflow: Vec::new(),
        outstanding: 0,
        arena: PathArena::new(),
        scratch: DirScratch::new(),
        max_stat_slots: config.entries as usize,
        max_in_flight: config.entries as usize,
    };

    engine.push_task(Pending::OpenDir(ROOT_INDEX));
    engine.run_loop()?;

    assert!(
        traversal.progress().is_finished(),
        "uring engine drained before the root completed"
    );
    traversal.donate_strings(engine.arena.take_chunks());
    drop(engine);
    Ok(traversal)
}

fn probe_required_opcodes(ring: &IoUring) -> io::Result<()> {
    let mut probe = Probe::new();
    ring.submitter().register_probe(&mut probe)?;
    let supported = probe.is_supported(opcode::Statx::CODE)
        && probe.is_supported(opcode::OpenAt::CODE)
        && probe.is_supported(opcode::Close::CODE);
    if !supported {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel io_uring lacks statx/openat/close opcodes",
        ));
    }
    Ok(())
}

impl Engine<'_> {
    /// Queues a task, spilling to the overflow buffer under back-pressure.
    fn push_task(&mut self, task: Pending) {
        if self.outstanding < self.max_in_flight && self.try_submit(task) {
            self.outstanding += 1;
        } else {
            self.overflow.push(task);
        }
    }

    /// Builds and pushes the SQE for `task`. False when the submission
    /// queue or the `statx` slab is full.
    fn try_submit(&mut self, task: Pending) -> bool {
        let entry = match task {
            Pending::StatFile(node) => {
                if self.stat_bufs.len() >= self.max_stat_slots {
                    return false;
                }
                let slot = self
                    .stat_bufs
                    .insert(Box::new(unsafe { std::mem::zeroed::<libc::statx>() }));
                let buf = self.stat_bufs.get_mut(slot).expect("fresh slab slot");
                let statx_ptr = buf.as_mut() as *mut libc::statx as *mut types::statx;
                let path = self.traversal.rel_cstr(node);
                let entry = opcode::Statx::new(
                    types::Fd(self.traversal.root_fd()),
                    path.as_ptr(),
                    statx_ptr,
                )
                .flags(libc::AT_SYMLINK_NOFOLLOW | libc::AT_STATX_DONT_SYNC)
                .mask(libc::STATX_SIZE)
                .build()
                .user_data(pack_token(node, KIND_STAT, slot));

                // SAFETY: path bytes and the boxed statx buffer stay alive
                // until this operation's CQE is reaped.
                let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
                if !pushed {
                    self.stat_bufs.remove(slot);
                }
                return pushed;
            }
            Pending::OpenDir(node) => {
                let (dirfd, path) = if node == ROOT_INDEX {
                    (libc::AT_FDCWD, self.traversal.root_cstr())
                } else {
                    (self.traversal.root_fd(), self.traversal.rel_cstr(node))
                };
                opcode::OpenAt::new(types::Fd(dirfd), path.as_ptr())
                    .flags(libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_DIRECTORY | libc::O_CLOEXEC)
                    .build()
                    .user_data(pack_token(node, KIND_OPEN_DIR, 0))
            }
            Pending::CloseFd(fd) => opcode::Close::new(types::Fd(fd))
                .build()
                .user_data(pack_token(0, KIND_CLOSE_FD, 0)),
        };

        // SAFETY: open/close entries reference only path bytes owned by the
        // result list, which outlives the ring.
        unsafe { self.ring.submission().push(&entry).is_ok() }
    }

    fn run_loop(&mut self) -> io::Result<()> {
        while self.outstanding > 0 || !self.overflow.is_empty() {
            // Retry spilled tasks newest-first before submitting.
            while self.outstanding < self.max_in_flight {
                let Some(task) = self.overflow.pop() else { break };
                if self.try_submit(task) {
                    self.outstanding += 1;
                } else {
                    self.overflow.push(task);
                    break;
                }
            }
            assert!(
                self.outstanding > 0,
                "overflow tasks with nothing in flight"
            );

            self.ring.submit_and_wait(1)?;

            let mut reaped = 0;
            while reaped < REAP_BATCH {
                let cqe = self.ring.completion().next();
                let Some(cqe) = cqe else { break };
                self.outstanding -= 1;
                self.dispatch(cqe.user_data(), cqe.result());
                reaped += 1;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, token: u64, result: i32) {
        let (node, kind, slot) = unpack_token(token);
        match kind {
            KIND_STAT => {
                let buf = self.stat_bufs.remove(slot);
                if result < 0 {
                    let _ = self
                        .traversal
                        .fail_node(node, TreeErrorKind::from_errno(-result));
                } else {
                    let _ = self.traversal.complete_file(node, buf.stx_size);
                }
            }
            KIND_OPEN_DIR => self.complete_open_dir(node, result),
            KIND_CLOSE_FD => {}
            _ => unreachable!("io_uring CQE with unknown task kind {kind}"),
        }
    }

    /// The listing runs synchronously inside the completion: enumerate,
    /// append records, schedule tasks, publish the correction, close.
    fn complete_open_dir(&mut self, node: u32, result: i32) {
        if result < 0 {
            let _ = self
                .traversal
                .fail_node(node, TreeErrorKind::from_errno(-result));
            return;
        }
        let fd: RawFd = result;
        if node == ROOT_INDEX {
            // Retained for the traversal's relative statx/openat; closed at
            // traversal teardown.
            self.traversal.set_root_fd(fd);
        }

        match list_directory(fd, &mut self.scratch) {
            Err(kind) => {
                if node != ROOT_INDEX {
                    self.push_task(Pending::CloseFd(fd));
                }
                let _ = self.traversal.fail_node(node, kind);
            }
            Ok(count) => {
                self.traversal
                    .append_children(node, &mut self.scratch, &mut self.arena);
                let children = std::mem::take(&mut self.scratch.children);
                for &(child, is_dir) in &children {
                    self.push_task(if is_dir {
                        Pending::OpenDir(child)
                    } else {
                        Pending::StatFile(child)
                    });
                }
                self.scratch.children = children;
                if node != ROOT_INDEX {
                    self.push_task(Pending::CloseFd(fd));
                }
                let _ = self.traversal.finish_listing(node, count);
            }
        }
    }
}
