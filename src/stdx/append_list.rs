//! Concurrent-read, locked-write segmented vector.
//!
//! Segment `k` holds `FIRST_SEGMENT_LEN << k` slots, so an index resolves to
//! a segment with one leading-zeros computation plus a single indirection.
//! The backbone is a fixed array of segment pointers and a segment, once
//! allocated, never moves: `get` hands out references that stay valid for
//! the list's whole lifetime while other threads keep appending.
//!
//! # Ordering
//!
//! `push` writes the slot (and, when needed, the new segment pointer) and
//! only then publishes the grown `len` with `Release`. Readers `Acquire`-load
//! `len`; any index proven below it can be read wait-free. Appends
//! themselves are serialized by a mutex; the traversal appends from many
//! listing threads but reads far more often than it writes.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

/// Capacity of segment 0. Power of two.
const FIRST_SEGMENT_LEN: usize = 64;

/// Backbone length. 26 segments of doubling capacity cover the full `u32`
/// index space.
const SEGMENT_COUNT: usize = 26;

pub struct AppendList<T> {
    segments: [AtomicPtr<T>; SEGMENT_COUNT],
    len: AtomicU32,
    /// Serializes appends. Holds no data; the backbone is the shared state.
    write: Mutex<()>,
}

/// Splits an index into (segment, offset within segment).
#[inline]
fn locate(index: usize) -> (usize, usize) {
    let bucket = index / FIRST_SEGMENT_LEN + 1;
    let segment = (usize::BITS - 1 - bucket.leading_zeros()) as usize;
    let base = FIRST_SEGMENT_LEN * ((1 << segment) - 1);
    (segment, index - base)
}

#[inline]
fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT_LEN << segment
}

impl<T> AppendList<T> {
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            len: AtomicU32::new(0),
            write: Mutex::new(()),
        }
    }

    /// Published element count. An `Acquire` load: every index below the
    /// returned value is safe to `get`.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value` and returns its index.
    pub fn push(&self, value: T) -> u32 {
        let guard = self.write.lock().expect("append list writer poisoned");
        let index = self.len.load(Ordering::Relaxed);
        let (segment, offset) = locate(index as usize);
        assert!(segment < SEGMENT_COUNT, "append list capacity exhausted");

        let mut seg_ptr = self.segments[segment].load(Ordering::Relaxed);
        if seg_ptr.is_null() {
            seg_ptr = Self::alloc_segment(segment);
            self.segments[segment].store(seg_ptr, Ordering::Relaxed);
        }

        // SAFETY: the slot is within the segment allocation and unpublished;
        // no reader can hold a reference to it before the len store below.
        unsafe { seg_ptr.add(offset).write(value) };

        // Publish after the slot write; readers pair with an Acquire len load.
        self.len.store(index + 1, Ordering::Release);
        drop(guard);
        index
    }

    /// Wait-free read of a published element. The returned reference is
    /// stable for the list's lifetime.
    pub fn get(&self, index: u32) -> &T {
        assert!(index < self.len(), "append list index {index} out of bounds");
        let (segment, offset) = locate(index as usize);
        let seg_ptr = self.segments[segment].load(Ordering::Relaxed);
        debug_assert!(!seg_ptr.is_null());
        // SAFETY: index < len was proven by an Acquire load that pairs with
        // the Release publish in push, so the slot write and the segment
        // pointer store are both visible.
        unsafe { &*seg_ptr.add(offset) }
    }

    /// Stable raw pointer to a published element.
    pub fn get_ptr(&self, index: u32) -> *const T {
        self.get(index) as *const T
    }

    /// Drops all elements but keeps the segment allocations.
    ///
    /// Exclusive access (`&mut`) guarantees no concurrent readers.
    pub fn clear_retaining_capacity(&mut self) {
        let len = self.len.load(Ordering::Relaxed) as usize;
        self.drop_elements(len);
        self.len.store(0, Ordering::Release);
    }

    fn alloc_segment(segment: usize) -> *mut T {
        let len = segment_len(segment);
        let mut slots: Vec<MaybeUninit<T>> = Vec::with_capacity(len);
        // SAFETY: MaybeUninit slots need no initialization.
        unsafe { slots.set_len(len) };
        Box::into_raw(slots.into_boxed_slice()) as *mut T
    }

    fn drop_elements(&mut self, len: usize) {
        if std::mem::needs_drop::<T>() {
            for index in 0..len {
                let (segment, offset) = locate(index);
                let seg_ptr = self.segments[segment].load(Ordering::Relaxed);
                // SAFETY: indices below len were fully written.
                unsafe { ptr::drop_in_place(seg_ptr.add(offset)) };
            }
        }
    }
}

impl<T> Default for AppendList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AppendList<T> {
    fn drop(&mut self) {
        let len = self.len.load(Ordering::Relaxed) as usize;
        self.drop_elements(len);
        for segment in 0..SEGMENT_COUNT {
            let seg_ptr = self.segments[segment].load(Ordering::Relaxed);
            if seg_ptr.is_null() {
                continue;
            }
            let slice = ptr::slice_from_raw_parts_mut(
                seg_ptr as *mut MaybeUninit<T>,
                segment_len(segment),
            );
            // SAFETY: reconstructs the boxed slice allocated in alloc_segment;
            // elements were dropped above.
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

// SAFETY: appends are mutex-serialized and reads only touch published slots.
unsafe impl<T: Send> Send for AppendList<T> {}
unsafe impl<T: Send + Sync> Sync for AppendList<T> {}
