//! Work-stealing thread pool with per-runner task rings.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────────────────────────────┐
//!                 │                  Pool<T>                      │
//!  External ──────┼──► round-robin ──┬───────────────────────────┤
//!  run(task)      │                  ▼                            │
//!                 │   ┌──────────────────────────────────────┐    │
//!                 │   │ Runner 0   │ Runner 1   │ Runner N   │    │
//!                 │   │ Mutex ring │ Mutex ring │ Mutex ring │    │
//!                 │   │ + Unparker │ + Unparker │ + Unparker │    │
//!                 │   └──────┬─────┴──────┬─────┴──────┬─────┘    │
//!                 │          ▼            ▼            ▼          │
//!                 │       worker 0     worker 1     worker N      │
//!                 │                                                │
//!                 │   Shared: wait state (canceled | timeline)    │
//!                 └───────────────────────────────────────────────┘
//! ```
//!
//! - Each runner owns a mutex-protected growable ring ([`TaskRing`]).
//! - The owning worker drains its ring from the front (FIFO); idle workers
//!   steal from other runners' backs (LIFO), taking the most recently queued
//!   items, the deepest points of the descent, whose neighbours are the
//!   most likely to be cache-cold anyway. A steal removes the item under
//!   the victim's lock, so the victim's length drops by one.
//! - Spawning from inside a worker lands on that worker's own ring, so a
//!   directory's children are processed by whichever thread listed it.
//!
//! # Wait state
//!
//! One `AtomicU32`: bit 31 is the canceled flag, the low 31 bits a monotonic
//! timeline counter. A producer that flips a ring from empty to non-empty
//! bumps the timeline and wakes every sleeper. An idle worker snapshots the
//! word, rescans every ring, and only parks if the word has not moved;
//! the parker token makes a wake between the rescan and the park stick, so
//! no wakeup can be lost.
//!
//! # Lifecycle
//!
//! Construction allocates every runner first, then the caller may queue
//! seed tasks (and per-worker init may queue more), and threads spawn last;
//! cross-worker visibility is only needed once threads start.
//!
//! # Correctness invariants
//!
//! - **Work-conserving until cancel**: a queued task is executed unless
//!   `cancel()` clears it.
//! - **Cancellation is idempotent** and safe from any thread, including a
//!   worker completing the traversal root. Workers observe it before
//!   returning a stolen task and in the wait loop.
//! - **Panic isolation**: a worker panic cancels the pool and is re-raised
//!   on `join`.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;

use crate::stdx::TaskRing;

/// Hard cap on worker threads.
pub const MAX_WORKERS: usize = 64;

const CANCELED: u32 = 1 << 31;
const TIMELINE_MASK: u32 = CANCELED - 1;

/// How long an idle worker sleeps before revalidating the wait state.
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Canceled flag + timeline counter in one word (the futex key of the
/// design, realized with parker tokens).
struct WaitState(AtomicU32);

impl WaitState {
    fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    fn snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn is_canceled(&self) -> bool {
        self.snapshot() & CANCELED != 0
    }

    /// Advances the timeline without disturbing the canceled bit.
    fn bump_timeline(&self) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (current & CANCELED) | (current.wrapping_add(1) & TIMELINE_MASK);
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn cancel(&self) {
        self.0.fetch_or(CANCELED, Ordering::AcqRel);
    }
}

struct RunnerQueue<T> {
    ring: TaskRing<T>,
    canceled: bool,
}

struct Runner<T> {
    queue: Mutex<RunnerQueue<T>>,
    unparker: Unparker,
}

struct Shared<T> {
    runners: Box<[CachePadded<Runner<T>>]>,
    wait: WaitState,
    /// Round-robin cursor for external submissions.
    next_runner: AtomicUsize,
    /// First worker panic; re-raised on join.
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl<T> Shared<T> {
    fn wake_all(&self) {
        for runner in self.runners.iter() {
            runner.unparker.unpark();
        }
    }

    /// Pushes onto runner `index`'s ring; bumps the timeline and wakes all
    /// sleepers on the empty → non-empty transition. Never blocks beyond
    /// the short ring lock: overflow grows the ring in place.
    fn queue_task(&self, index: usize, task: T) {
        let was_empty;
        {
            let mut queue = self.runners[index].queue.lock().expect("runner poisoned");
            if queue.canceled {
                return;
            }
            was_empty = queue.ring.is_empty();
            queue.ring.push_back(task);
        }
        if was_empty {
            self.wait.bump_timeline();
            self.wake_all();
        }
    }

    fn cancel(&self) {
        self.wait.cancel();
        for runner in self.runners.iter() {
            let mut queue = runner.queue.lock().expect("runner poisoned");
            queue.ring.clear();
            queue.canceled = true;
        }
        self.wake_all();
    }

    fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        let mut slot = self.panic.lock().expect("panic slot poisoned");
        if slot.is_none() {
            *slot = Some(payload);
        }
        drop(slot);
        self.cancel();
    }

    /// Blocks until a task is available or the pool is canceled.
    ///
    /// Order per idle cycle: own ring front (try-lock, so a stealer holding
    /// our lock does not stall us), then every runner's back in index order,
    /// then park against the wait-state snapshot.
    fn next_task(&self, index: usize, parker: &Parker) -> Option<T> {
        loop {
            if self.wait.is_canceled() {
                return None;
            }

            if let Ok(mut queue) = self.runners[index].queue.try_lock() {
                if let Some(task) = queue.ring.pop_front() {
                    return Some(task);
                }
            }

            let snapshot = self.wait.snapshot();
            if snapshot & CANCELED != 0 {
                return None;
            }

            for runner in self.runners.iter() {
                let stolen = {
                    let mut queue = runner.queue.lock().expect("runner poisoned");
                    queue.ring.pop_back()
                };
                if let Some(task) = stolen {
                    // Cancellation may have raced the steal; the rings were
                    // already cleared, so the task must not run.
                    if self.wait.is_canceled() {
                        return None;
                    }
                    return Some(task);
                }
            }

            // Nothing anywhere. Park only if no producer moved the timeline
            // since the scan began; a wake in the window sets the parker
            // token and the park returns immediately.
            if self.wait.snapshot() != snapshot {
                continue;
            }
            parker.park_timeout(PARK_TIMEOUT);
        }
    }
}

/// Cloneable submission/cancellation handle, usable from any thread.
pub struct PoolHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> PoolHandle<T> {
    /// Submits a task from outside any worker: round-robin across runners.
    pub fn run(&self, task: T) {
        let n = self.shared.runners.len();
        let index = self.shared.next_runner.fetch_add(1, Ordering::Relaxed) % n;
        self.shared.queue_task(index, task);
    }

    /// Cancels the pool: sets the canceled bit, clears every ring, wakes
    /// every worker. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.wait.is_canceled()
    }
}

/// Per-task context handed to the worker callback.
pub struct WorkerCtx<'a, T> {
    shared: &'a Shared<T>,
    index: usize,
}

impl<'a, T: Send + 'static> WorkerCtx<'a, T> {
    /// This worker's index.
    pub fn worker_index(&self) -> usize {
        self.index
    }

    /// Submits a task from inside the worker: lands on this worker's own
    /// ring for locality.
    pub fn spawn(&self, task: T) {
        self.shared.queue_task(self.index, task);
    }

    /// Cancels the whole pool (traversal-finished path).
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// The pool. Runners exist from construction; workers run from [`Pool::start`]
/// until [`PoolHandle::cancel`].
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
    parkers: Vec<Parker>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Pool<T> {
    /// Allocates `workers` runners (clamped to `1..=MAX_WORKERS`). No
    /// threads run yet; seed tasks queued now are picked up at `start`.
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(1, MAX_WORKERS);
        let parkers: Vec<Parker> = (0..workers).map(|_| Parker::new()).collect();
        let runners: Box<[CachePadded<Runner<T>>]> = parkers
            .iter()
            .map(|parker| {
                CachePadded::new(Runner {
                    queue: Mutex::new(RunnerQueue {
                        ring: TaskRing::new(),
                        canceled: false,
                    }),
                    unparker: parker.unparker().clone(),
                })
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                runners,
                wait: WaitState::new(),
                next_runner: AtomicUsize::new(0),
                panic: Mutex::new(None),
            }),
            parkers,
            threads: Vec::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.shared.runners.len()
    }

    pub fn handle(&self) -> PoolHandle<T> {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawns the worker threads. `init` runs on the calling thread for
    /// each worker, in index order, before any thread exists; it may queue
    /// tasks. `run` handles one task at a time on the worker thread.
    pub fn start<S, I, F>(&mut self, mut init: I, run: F)
    where
        S: Send + 'static,
        I: FnMut(usize, &PoolHandle<T>) -> S,
        F: Fn(&mut S, &WorkerCtx<'_, T>, T) + Send + Sync + 'static,
    {
        assert!(self.threads.is_empty(), "pool already started");
        let handle = self.handle();
        let states: Vec<S> = (0..self.workers())
            .map(|index| init(index, &handle))
            .collect();

        let run = Arc::new(run);
        for (index, (parker, state)) in
            std::mem::take(&mut self.parkers).into_iter().zip(states).enumerate()
        {
            let shared = Arc::clone(&self.shared);
            let run = Arc::clone(&run);
            let thread = std::thread::Builder::new()
                .name(format!("duz-worker-{index}"))
                .spawn(move || worker_main(shared, index, parker, state, run))
                .expect("spawn pool worker");
            self.threads.push(thread);
        }
    }

    /// Waits for every worker to exit (they exit on cancellation). Re-raises
    /// the first worker panic, if any.
    pub fn join(mut self) {
        for thread in self.threads.drain(..) {
            thread.join().expect("pool worker thread join");
        }
        let payload = self
            .shared
            .panic
            .lock()
            .expect("panic slot poisoned")
            .take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
    }
}

fn worker_main<T, S, F>(
    shared: Arc<Shared<T>>,
    index: usize,
    parker: Parker,
    mut state: S,
    run: Arc<F>,
) where
    T: Send + 'static,
    F: Fn(&mut S, &WorkerCtx<'_, T>, T),
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        let ctx = WorkerCtx {
            shared: &shared,
            index,
        };
        while let Some(task) = shared.next_task(index, &parker) {
            run(&mut state, &ctx, task);
        }
    }));
    // Drop per-worker state (arena donation) before signalling failure so a
    // panicking worker still hands its strings over.
    drop(state);
    if let Err(payload) = result {
        shared.record_panic(payload);
    }
}
