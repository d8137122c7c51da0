//! Ring Allocators
//!
//! [`Ring`] hands out offsets into one contiguous arena with a head (oldest
//! live byte) and a tail (next free byte). Memory is returned strictly in
//! allocation order.
//!
//! [`RingWithTabs`] layers per-frame "tabs" on top: everything allocated in a
//! frame is recorded as one amount and freed in one step exactly
//! `frame_count` frame boundaries later.
//!
//! ```text
//!  0                                                   total_size
//!  ├──────────┬─────────────────────────┬──────────────┤
//!  │   free   │ live (head .. tail)     │     free     │
//!  └──────────┴─────────────────────────┴──────────────┘
//!             head                      tail = (head + allocated) % total
//! ```
//!
//! An allocation never straddles the physical end of the arena: if it would,
//! the remainder up to the end is consumed as padding first
//! ([`Ring::padding_to_avoid_crossover`]) and counts against capacity like
//! any other allocation.
//!
//! # Free discipline
//!
//! `free(size)` must be called in the same order and with the same amounts
//! as the matching allocations. The ring trusts the caller; only an over-free
//! (more than is allocated) is rejected.

/// A fixed-capacity FIFO arena allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    head: u64,
    allocated_size: u64,
    total_size: u64,
}

impl Ring {
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        Self {
            head: 0,
            allocated_size: 0,
            total_size,
        }
    }

    #[inline]
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Offset the next allocation would start at.
    #[inline]
    #[must_use]
    pub fn tail(&self) -> u64 {
        if self.total_size == 0 {
            return 0;
        }
        (self.head + self.allocated_size) % self.total_size
    }

    #[inline]
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    #[inline]
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    #[must_use]
    pub fn available(&self) -> u64 {
        self.total_size - self.allocated_size
    }

    /// Bytes that must be allocated and discarded at the tail so that an
    /// allocation of `size` does not wrap across the end of the arena.
    #[must_use]
    pub fn padding_to_avoid_crossover(&self, size: u64) -> u64 {
        let tail = self.tail();
        if tail + size > self.total_size {
            self.total_size - tail
        } else {
            0
        }
    }

    /// Reserves `size` bytes at the tail. Returns the offset, or `None` when
    /// the ring cannot hold them.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        if self.allocated_size + size <= self.total_size {
            let offset = self.tail();
            self.allocated_size += size;
            Some(offset)
        } else {
            None
        }
    }

    /// Releases `size` bytes from the head. Returns `false` (and frees
    /// nothing) if more is freed than is allocated.
    pub fn free(&mut self, size: u64) -> bool {
        if size > self.allocated_size {
            log::warn!(
                "Ring over-free: {size} bytes requested, {} allocated",
                self.allocated_size
            );
            return false;
        }
        if self.total_size > 0 {
            self.head = (self.head + size) % self.total_size;
        }
        self.allocated_size -= size;
        true
    }
}

/// A [`Ring`] whose memory is reclaimed a whole frame at a time.
#[derive(Debug, Clone)]
pub struct RingWithTabs {
    ring: Ring,
    back_buffer_index: usize,
    mem_allocated_in_frame: u64,
    allocated_mem_per_back_buffer: Vec<u64>,
}

impl RingWithTabs {
    /// `number_of_back_buffers` is the number of frames an allocation stays
    /// live; it must be at least 1.
    #[must_use]
    pub fn new(number_of_back_buffers: usize, total_size: u64) -> Self {
        assert!(number_of_back_buffers > 0, "ring needs at least one tab");
        Self {
            ring: Ring::new(total_size),
            back_buffer_index: 0,
            mem_allocated_in_frame: 0,
            allocated_mem_per_back_buffer: vec![0; number_of_back_buffers],
        }
    }

    /// Reserves `size` contiguous bytes, padding past the physical end of the
    /// arena first if needed. Nothing is reserved when the request (padding
    /// included) does not fit.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let padding = self.ring.padding_to_avoid_crossover(size);
        if self.ring.allocated_size() + padding + size > self.ring.total_size() {
            return None;
        }
        if padding > 0 {
            self.ring.alloc(padding)?;
            self.mem_allocated_in_frame += padding;
        }
        let offset = self.ring.alloc(size)?;
        self.mem_allocated_in_frame += size;
        Some(offset)
    }

    /// Closes the current tab and frees the one recorded `number_of_back_buffers`
    /// frames ago. Returns the number of bytes reclaimed.
    pub fn on_begin_frame(&mut self) -> u64 {
        self.allocated_mem_per_back_buffer[self.back_buffer_index] = self.mem_allocated_in_frame;
        self.mem_allocated_in_frame = 0;

        self.back_buffer_index = (self.back_buffer_index + 1) % self.allocated_mem_per_back_buffer.len();

        let mem_to_free = std::mem::take(&mut self.allocated_mem_per_back_buffer[self.back_buffer_index]);
        self.ring.free(mem_to_free);
        mem_to_free
    }

    #[must_use]
    pub fn number_of_back_buffers(&self) -> usize {
        self.allocated_mem_per_back_buffer.len()
    }

    #[must_use]
    pub fn back_buffer_index(&self) -> usize {
        self.back_buffer_index
    }

    /// Bytes allocated (padding included) since the last frame boundary.
    #[must_use]
    pub fn allocated_in_frame(&self) -> u64 {
        self.mem_allocated_in_frame
    }

    /// Bytes held by all live tabs.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.ring.allocated_size()
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.ring.total_size()
    }

    #[must_use]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};

    use super::*;

    fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
        a.0 < b.0 + b.1 && b.0 < a.0 + a.1
    }

    #[test]
    fn alloc_advances_tail_and_free_advances_head() {
        let mut ring = Ring::new(100);
        assert_eq!(ring.alloc(30), Some(0));
        assert_eq!(ring.alloc(30), Some(30));
        assert_eq!(ring.tail(), 60);

        assert!(ring.free(30));
        assert_eq!(ring.head(), 30);
        assert_eq!(ring.allocated_size(), 30);
    }

    #[test]
    fn alloc_fails_past_capacity() {
        let mut ring = Ring::new(64);
        assert_eq!(ring.alloc(64), Some(0));
        assert_eq!(ring.alloc(1), None);
        assert_eq!(ring.allocated_size(), 64);
    }

    #[test]
    fn over_free_is_rejected() {
        let mut ring = Ring::new(64);
        ring.alloc(16);
        assert!(!ring.free(17));
        assert_eq!(ring.allocated_size(), 16);
        assert_eq!(ring.head(), 0);
    }

    #[test]
    fn padding_consumes_remainder_before_wrap() {
        let mut ring = Ring::new(100);
        ring.alloc(80);
        ring.free(80);
        assert_eq!(ring.tail(), 80);
        assert_eq!(ring.padding_to_avoid_crossover(10), 0);
        assert_eq!(ring.padding_to_avoid_crossover(30), 20);
    }

    #[test]
    fn tabbed_alloc_pads_and_stays_contiguous() {
        let mut ring = RingWithTabs::new(2, 100);
        assert_eq!(ring.alloc(70), Some(0));
        ring.on_begin_frame();
        ring.on_begin_frame(); // frees the 70

        // tail sits at 70; a 40-byte request pads 30 and wraps to 0
        assert_eq!(ring.alloc(40), Some(0));
        assert_eq!(ring.allocated_in_frame(), 70);
        assert_eq!(ring.allocated_size(), 70);
    }

    #[test]
    fn tabbed_alloc_that_does_not_fit_reserves_nothing() {
        let mut ring = RingWithTabs::new(2, 100);
        ring.alloc(60);
        ring.on_begin_frame();
        assert_eq!(ring.alloc(50), None);
        assert_eq!(ring.allocated_size(), 60);
        assert_eq!(ring.allocated_in_frame(), 0);
    }

    #[test]
    fn warm_up_frames_free_nothing() {
        let mut ring = RingWithTabs::new(3, 1024);
        assert_eq!(ring.on_begin_frame(), 0);
        assert_eq!(ring.on_begin_frame(), 0);
        assert_eq!(ring.on_begin_frame(), 0);
    }

    #[test]
    fn frame_memory_reclaimed_after_exactly_n_boundaries() {
        let n = 3;
        let mut ring = RingWithTabs::new(n, 4096);
        ring.alloc(100);

        for _ in 0..n - 1 {
            assert_eq!(ring.on_begin_frame(), 0);
            assert_eq!(ring.allocated_size(), 100, "reclaimed too early");
        }
        assert_eq!(ring.on_begin_frame(), 100);
        assert_eq!(ring.allocated_size(), 0);
    }

    #[test]
    fn random_fifo_sequences_stay_in_bounds_and_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0x9E37_79B9);
        for _ in 0..50 {
            let total: u64 = rng.random_range(64..64 + 4096);
            let mut ring = Ring::new(total);
            let mut live: VecDeque<(u64, u64)> = VecDeque::new();

            for _ in 0..500 {
                if rng.random_range(0..3) == 0 && !live.is_empty() {
                    let (_, size) = live.pop_front().unwrap();
                    assert!(ring.free(size));
                } else {
                    let size = rng.random_range(1..=total / 4);
                    let padding = ring.padding_to_avoid_crossover(size);
                    if ring.allocated_size() + padding + size > ring.total_size() {
                        continue;
                    }
                    if padding > 0 {
                        let off = ring.alloc(padding).unwrap();
                        live.push_back((off, padding));
                    }
                    let off = ring.alloc(size).unwrap();
                    assert!(off + size <= total, "allocation crosses the arena end");
                    for &other in &live {
                        assert!(!overlaps((off, size), other), "tail overlapped a live region");
                    }
                    live.push_back((off, size));
                }
                assert!(ring.allocated_size() <= ring.total_size());
                assert_eq!(ring.allocated_size(), live.iter().map(|l| l.1).sum::<u64>());
            }
        }
    }
}
