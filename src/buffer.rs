//! Byte ring for pipelining variable-sized chunks with backpressure.

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::stats;

/// A region handed out by [`CircularBuffer::allocate`].
///
/// The region is exclusively owned until it is returned with
/// [`CircularBuffer::free`]; it may be sent to another thread.
#[derive(Debug)]
pub struct Allocation {
    ptr: *mut u8,
    offset: usize,
    len: usize,
}

// The ring guarantees that live allocations never overlap, so exclusive
// access through `as_mut_slice` is sound even across threads.
unsafe impl Send for Allocation {}

impl Allocation {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Bip-buffer state. Data is granted from `tail` and returned at `head`.
///
/// When a grant cannot fit before the end of storage it wraps to offset 0;
/// `watermark` then remembers where the valid tail region ends and `wrapped`
/// is set until the head catches up with the watermark.
struct State {
    head: usize,
    tail: usize,
    watermark: usize,
    wrapped: bool,
    stopped: bool,
}

/// Single-producer/single-consumer byte ring backed by one fixed region.
///
/// `allocate` returns a contiguous region (never wrapping) of up to half the
/// capacity, blocking until enough contiguous space is free. `free` must be
/// called in allocation order.
pub struct CircularBuffer {
    name: &'static str,
    /// Backing store kept as u64 so granted regions are 8-byte aligned at
    /// offset 0; callers that cast regions to typed slices keep their
    /// element sizes aligned.
    storage: Box<[u64]>,
    capacity: usize,
    state: Mutex<State>,
    space: Condvar,
}

unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    /// `size` is the byte capacity; at most half of it is available to any
    /// single allocation.
    pub fn new(name: &'static str, size: usize) -> Self {
        assert!(size >= 2, "circular buffer needs at least 2 bytes");
        stats::counter(&format!("mem.{}", name)).add(size as u64);
        CircularBuffer {
            name,
            storage: vec![0u64; size.div_ceil(8)].into_boxed_slice(),
            capacity: size,
            state: Mutex::new(State {
                head: 0,
                tail: 0,
                watermark: 0,
                wrapped: false,
                stopped: false,
            }),
            space: Condvar::new(),
        }
    }

    /// Unblock current and future `allocate` calls with
    /// [`Error::Cancelled`]; used when the consumer side of the pipeline
    /// dies and will never free space again. Frees remain accepted.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.space.notify_all();
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate room for up to `max_elements` items of `element_size` bytes.
    /// Returns as many whole elements as fit contiguously, at least one.
    ///
    /// Fails with [`Error::MemoryPressure`] if a single element can never
    /// fit; this is a configuration bug, not a transient condition.
    pub fn allocate(&self, element_size: usize, max_elements: u64) -> Result<Allocation> {
        assert!(element_size > 0 && max_elements > 0);
        let half = self.capacity() / 2;
        if element_size > half {
            return Err(Error::MemoryPressure {
                buffer: self.name,
                requested: element_size,
                capacity: self.capacity(),
            });
        }

        let max_bytes = (max_elements as u128 * element_size as u128).min(half as u128) as usize;

        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(Error::Cancelled);
            }
            if let Some((offset, room)) = Self::free_region(&state, self.capacity()) {
                let len = room.min(max_bytes) / element_size * element_size;
                if len > 0 {
                    if offset == 0 && state.tail != 0 && !state.wrapped {
                        // Wrapping grant: remember where the tail data ends.
                        state.watermark = state.tail;
                        state.wrapped = true;
                    }
                    state.tail = offset + len;
                    let ptr = self.storage.as_ptr() as *mut u8;
                    return Ok(Allocation {
                        ptr: unsafe { ptr.add(offset) },
                        offset,
                        len,
                    });
                }
            }
            self.space.wait(&mut state);
        }
    }

    /// Largest contiguous free region as `(offset, room)`, preferring the
    /// region after the tail and falling back to the front of storage.
    fn free_region(state: &State, cap: usize) -> Option<(usize, usize)> {
        if state.wrapped {
            // Valid data occupies [head, watermark) and [0, tail); the only
            // free region is the middle gap.
            if state.head > state.tail {
                Some((state.tail, state.head - state.tail))
            } else {
                None
            }
        } else {
            let end_room = cap - state.tail;
            let front_room = state.head;
            if end_room >= front_room {
                (end_room > 0).then_some((state.tail, end_room))
            } else {
                (front_room > 0).then_some((0, front_room))
            }
        }
    }

    /// Return a region obtained from [`allocate`]. Regions must be freed in
    /// the order they were allocated.
    pub fn free(&self, allocation: Allocation) {
        let mut state = self.state.lock();
        if state.wrapped && state.head == state.watermark {
            // All tail-region data was already consumed; the next grant in
            // order is the one that wrapped to the front.
            state.head = 0;
            state.wrapped = false;
        }
        assert_eq!(
            allocation.offset, state.head,
            "circular buffer frees must follow allocation order"
        );
        state.head += allocation.len;
        if state.wrapped && state.head == state.watermark {
            state.head = 0;
            state.wrapped = false;
        }
        if !state.wrapped && state.head == state.tail {
            // Empty: reset for maximum contiguity.
            state.head = 0;
            state.tail = 0;
        }
        drop(state);
        self.space.notify_all();
    }
}
