#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

#[cfg(feature = "lock_api")]
mod tampck;

mod check;
mod counters;
mod llist;
mod tag;
mod tamp;
mod utils;

pub use check::IntegrityError;
pub use counters::{CompactCounters, Counters};
pub use tamp::{Handle, Tamp};
#[cfg(feature = "lock_api")]
pub use tampck::{AssumeUnlockable, Tampck};

use tag::SizeTag;
use utils::{bin_of_size, round_up_even};

// Free chunk (16 bytes minimum):
//   | SIZE+prev_used: u32 | NEXT: u32 | PREV: u32 | ...... | SIZE: u32 |
// Used chunk (one word of overhead):
//   | SIZE+prev_used: u32 | payload ........................ |

// A chunk's own used/free state lives in its *successor's* prev_used bit,
// or in `Pool::final_prev_used` for the last physical chunk. The footer
// word exists only on free chunks and enables the backward-coalescing
// neighbor lookup.

pub(crate) const WORD_SIZE: u32 = 4;
pub(crate) const HEADER_SIZE: u32 = 3 * WORD_SIZE;
pub(crate) const MIN_CHUNK_SIZE: u32 = round_up_even(HEADER_SIZE + WORD_SIZE);

pub(crate) const BIN_COUNT: usize = 17;
pub(crate) const NIL: u32 = u32::MAX;

pub(crate) const NEXT_WORD: u32 = WORD_SIZE;
pub(crate) const PREV_WORD: u32 = 2 * WORD_SIZE;

/// An interior pointer: the byte offset of an allocation's payload from
/// the pool base.
///
/// Offsets, not addresses, name pool memory because compaction slides
/// live chunks; see [`Tamp::compact`]. A `PoolPtr` obtained before a
/// compaction is stale afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct PoolPtr(u32);

impl PoolPtr {
    /// The payload's byte offset from the pool base.
    #[inline]
    pub fn offset(self) -> u32 {
        self.0
    }
}

/// The pool allocator.
///
/// Manages a fixed, owned buffer as a sequence of boundary-tagged chunks.
/// Free chunks are kept in 17 size-class bins of circular doubly-linked
/// lists threaded through the chunks themselves; freeing coalesces with
/// physically adjacent free neighbors in both directions.
///
/// `Pool` on its own hands out stable [`PoolPtr`]s. The relocating,
/// reference-counted layer on top is [`Tamp`].
pub struct Pool {
    pub(crate) mem: Box<[u8]>,
    pub(crate) bins: [u32; BIN_COUNT],
    pub(crate) final_prev_used: bool,
    pub(crate) counters: Counters,
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("final_prev_used", &self.final_prev_used)
            .field("counters", &self.counters)
            .finish()
    }
}

impl Pool {
    /// Creates a pool managing `size` bytes.
    ///
    /// An odd `size` is rounded down so that chunks, whose sizes are
    /// always even, tile the buffer exactly; [`size`](Pool::size)
    /// reports the rounded value.
    ///
    /// # Panics
    /// Panics if the rounded size is smaller than the minimum chunk
    /// size (16 bytes).
    pub fn new(size: u32) -> Self {
        let size = size & !1;
        assert!(size >= MIN_CHUNK_SIZE, "pool of {size} bytes cannot hold a chunk");
        // NIL and the size-word padding arithmetic need headroom
        assert!(size < NIL - WORD_SIZE, "pool of {size} bytes exceeds the offset range");

        let mut pool = Self {
            mem: vec![0u8; size as usize].into_boxed_slice(),
            bins: [NIL; BIN_COUNT],
            final_prev_used: false,
            counters: Counters::new(size),
        };

        // the whole buffer is one free chunk
        pool.set_chunk(0, size, false);
        pool.free_list_push(0);

        pool.scan_for_errors();

        pool
    }

    /// The number of managed bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.mem.len() as u32
    }

    /// The pool's allocation counters.
    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Allocates `size` bytes, returning the payload's interior pointer.
    ///
    /// Returns `None` and bumps the fail counter when no free chunk can
    /// satisfy the request; the pool is left untouched. Callers holding
    /// a [`Tamp`] typically compact and retry once.
    pub fn allocate(&mut self, size: u32) -> Option<PoolPtr> {
        // also keeps the padding arithmetic below in range
        if size >= self.size() {
            self.counters.account_fail();
            return None;
        }

        // a used chunk carries its size word; whatever is carved out
        // must also be able to live as a free chunk later
        let needed = round_up_even(size + WORD_SIZE).max(MIN_CHUNK_SIZE);

        let Some(base) = self.take_fit(needed) else {
            self.counters.account_fail();
            return None;
        };

        let chunk_size = self.tag(base).size();
        debug_assert!(chunk_size >= needed);

        // split only when the remainder can host a valid free chunk
        let split = chunk_size >= needed + MIN_CHUNK_SIZE;
        let used_size = if split { needed } else { chunk_size };

        // the used portion takes the high end, so the remainder keeps
        // the donor chunk's base offset
        let used_base = base + (chunk_size - used_size);
        self.set_chunk(used_base, used_size, true);
        self.counters.account_alloc(used_size);

        if split {
            self.counters.account_split();
            self.set_chunk(base, chunk_size - used_size, false);
            self.free_list_push(base);
        }

        self.scan_for_errors();

        Some(PoolPtr(used_base + WORD_SIZE))
    }

    /// Returns an allocation to the pool.
    ///
    /// `ptr` must be the pointer returned by the matching
    /// [`allocate`](Pool::allocate); freeing a foreign or already-freed
    /// pointer corrupts the pool.
    pub fn free(&mut self, ptr: PoolPtr) {
        debug_assert!(ptr.0 >= WORD_SIZE && ptr.0 < self.size());

        let base = ptr.0 - WORD_SIZE;
        let size = self.tag(base).size();

        self.set_chunk(base, size, false);
        self.free_list_push(base);
        self.counters.account_free(size);

        if let Some(next) = self.next_chunk(base) {
            if !self.is_used(next) {
                self.merge(base, next);
            }
        }

        if !self.tag(base).is_prev_used() && base != 0 {
            let prev = base - self.word(base - WORD_SIZE);
            self.merge(prev, base);
        }

        self.scan_for_errors();
    }

    /// A shared view of `len` payload bytes at `ptr`.
    ///
    /// # Panics
    /// Panics if the range falls outside the pool.
    #[inline]
    pub fn bytes(&self, ptr: PoolPtr, len: u32) -> &[u8] {
        &self.mem[ptr.0 as usize..(ptr.0 + len) as usize]
    }

    /// A mutable view of `len` payload bytes at `ptr`.
    ///
    /// # Panics
    /// Panics if the range falls outside the pool.
    #[inline]
    pub fn bytes_mut(&mut self, ptr: PoolPtr, len: u32) -> &mut [u8] {
        &mut self.mem[ptr.0 as usize..(ptr.0 + len) as usize]
    }

    /// Walks the bins upward from `needed`'s class and claims the first
    /// free chunk large enough, unlinking it.
    fn take_fit(&mut self, needed: u32) -> Option<u32> {
        for bin in bin_of_size(needed)..BIN_COUNT {
            let root = self.bins[bin];
            if root == NIL {
                continue;
            }

            // first fit; bins are unsorted
            let mut cur = root;
            loop {
                if self.tag(cur).size() >= needed {
                    self.free_list_unlink(cur);
                    return Some(cur);
                }
                cur = self.word(cur + NEXT_WORD);
                if cur == root {
                    break;
                }
            }
        }

        None
    }

    /// Coalesces the free chunk at `high` into the free chunk at `low`.
    /// The chunks must be physically adjacent.
    fn merge(&mut self, low: u32, high: u32) {
        debug_assert!(low + self.tag(low).size() == high);

        self.free_list_unlink(low);
        self.free_list_unlink(high);

        let total = self.tag(low).size() + self.tag(high).size();
        self.set_chunk(low, total, false);
        self.free_list_push(low);

        self.counters.account_merge();
    }

    /// Rewrites the chunk at `base`: size word (its prev_used bit is
    /// preserved), the successor's prev_used bit (or the final flag),
    /// and, for a free chunk, the footer.
    pub(crate) fn set_chunk(&mut self, base: u32, size: u32, used: bool) {
        debug_assert!(size >= WORD_SIZE && size & 1 == 0);

        let tag = self.tag(base).with_size(size);
        self.set_tag(base, tag);

        match self.next_chunk(base) {
            Some(next) => {
                let tag = self.tag(next).with_prev_used(used);
                self.set_tag(next, tag);
            }
            None => self.final_prev_used = used,
        }

        if !used {
            self.set_word(base + size - WORD_SIZE, size);
        }
    }

    /// The physically following chunk's base, if `base` is not last.
    #[inline]
    pub(crate) fn next_chunk(&self, base: u32) -> Option<u32> {
        let next = base + self.tag(base).size();
        (next < self.size()).then_some(next)
    }

    /// Whether the chunk at `base` is used, read from its successor's
    /// tag or the final flag.
    #[inline]
    pub(crate) fn is_used(&self, base: u32) -> bool {
        match self.next_chunk(base) {
            Some(next) => self.tag(next).is_prev_used(),
            None => self.final_prev_used,
        }
    }

    #[inline]
    pub(crate) fn tag(&self, base: u32) -> SizeTag {
        SizeTag::from_word(self.word(base))
    }

    #[inline]
    pub(crate) fn set_tag(&mut self, base: u32, tag: SizeTag) {
        self.set_word(base, tag.to_word());
    }

    #[inline]
    pub(crate) fn word(&self, at: u32) -> u32 {
        let at = at as usize;
        let b = &self.mem[at..at + WORD_SIZE as usize];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    pub(crate) fn set_word(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.mem[at..at + WORD_SIZE as usize].copy_from_slice(&value.to_ne_bytes());
    }

    /// The pool's chunk sequence as `(base, size, used)` triples.
    #[cfg(test)]
    pub(crate) fn chunks(&self) -> Vec<(u32, u32, bool)> {
        let mut out = Vec::new();
        let mut cur = Some(0);
        while let Some(base) = cur {
            out.push((base, self.tag(base).size(), self.is_used(base)));
            cur = self.next_chunk(base);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_is_one_free_chunk() {
        let pool = Pool::new(1000);

        assert!(pool.chunks() == vec![(0, 1000, false)]);
        assert!(!pool.final_prev_used);
        assert!(pool.integrity_check().is_ok());
    }

    #[test]
    fn odd_sizes_round_down() {
        let pool = Pool::new(1001);
        assert!(pool.size() == 1000);
        assert!(pool.chunks() == vec![(0, 1000, false)]);
    }

    #[test]
    #[should_panic(expected = "cannot hold a chunk")]
    fn tiny_pool_is_rejected() {
        let _ = Pool::new(15);
    }

    #[test]
    fn first_allocation_takes_the_high_end() {
        let mut pool = Pool::new(1000);

        let a = pool.allocate(100).unwrap();

        // 100 bytes pad to a 104-byte chunk at the top of the pool
        assert!(a.offset() == 900);
        assert!(pool.chunks() == vec![(0, 896, false), (896, 104, true)]);
        assert!(pool.final_prev_used);
        assert!(pool.counters().used_mem == 104);
        assert!(pool.counters().free_mem == 896);
    }

    #[test]
    fn allocations_stack_downward() {
        let mut pool = Pool::new(1000);

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(200).unwrap();

        assert!(b.offset() < a.offset());
        assert!(
            pool.chunks() == vec![(0, 692, false), (692, 204, true), (896, 104, true)]
        );
        assert!(pool.counters().used_blocks == 2);
        assert!(pool.counters().free_blocks == 1);
    }

    #[test]
    fn free_with_used_neighbors_stays_isolated() {
        let mut pool = Pool::new(1000);

        let a = pool.allocate(100).unwrap();
        let _b = pool.allocate(200).unwrap();

        // `a` is the last chunk and `b` below it is used, so neither
        // direction coalesces
        pool.free(a);
        assert!(
            pool.chunks() == vec![(0, 692, false), (692, 204, true), (896, 104, false)]
        );
        assert!(pool.counters().free_blocks == 2);
        assert!(pool.counters().merges == 0);
    }

    #[test]
    fn freeing_the_last_used_chunk_restores_the_pool() {
        let mut pool = Pool::new(1000);

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(200).unwrap();
        pool.free(a);
        pool.free(b);

        // `b` merged with the free remainder below and `a` above
        assert!(pool.chunks() == vec![(0, 1000, false)]);
        assert!(pool.counters().merges == 2);
        assert!(pool.counters().free_blocks == 1);
        assert!(pool.counters().used_mem == 0);
    }

    #[test]
    fn alloc_free_restores_the_prior_structure() {
        let mut pool = Pool::new(1000);
        let _keep = pool.allocate(64).unwrap();

        let before = pool.chunks();
        let counters = *pool.counters();

        let p = pool.allocate(123).unwrap();
        pool.free(p);

        assert!(pool.chunks() == before);
        assert!(pool.counters().free_blocks == counters.free_blocks);
        assert!(pool.counters().used_blocks == counters.used_blocks);
        assert!(pool.counters().free_mem == counters.free_mem);
        assert!(pool.counters().used_mem == counters.used_mem);
    }

    #[test]
    fn too_small_remainders_are_consumed_whole() {
        let mut pool = Pool::new(1000);

        // leave a 24-byte free chunk, then request 14 of it: the
        // 6-byte remainder cannot host a free chunk
        let _fill = pool.allocate(972).unwrap();
        assert!(pool.chunks()[0] == (0, 24, false));

        let p = pool.allocate(14).unwrap();
        assert!(pool.tag(p.offset() - WORD_SIZE).size() == 24);
        assert!(pool.counters().free_blocks == 0);
        assert!(pool.counters().free_mem == 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = Pool::new(100);

        // the second request consumes the whole 56-byte remainder
        let _a = pool.allocate(40).unwrap();
        let _b = pool.allocate(40).unwrap();
        assert!(pool.counters().free_blocks == 0);

        assert!(pool.allocate(40).is_none());
        assert!(pool.counters().fails == 1);
        assert!(pool.allocate(1).is_none());
        assert!(pool.counters().fails == 2);
    }

    #[test]
    fn payload_bytes_are_private_to_the_chunk() {
        let mut pool = Pool::new(1000);

        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(32).unwrap();

        pool.bytes_mut(a, 32).fill(0xaa);
        pool.bytes_mut(b, 32).fill(0xbb);

        assert!(pool.bytes(a, 32).iter().all(|&x| x == 0xaa));
        assert!(pool.bytes(b, 32).iter().all(|&x| x == 0xbb));
    }

    #[test]
    fn interleaved_frees_coalesce_fully() {
        let mut pool = Pool::new(10000);

        let mut ptrs = Vec::new();
        for _ in 0..20 {
            ptrs.push(pool.allocate(100).unwrap());
        }

        // evens first so every odd free later merges both ways
        for i in (0..20).step_by(2) {
            pool.free(ptrs[i]);
        }
        for i in (1..20).step_by(2) {
            pool.free(ptrs[i]);
        }

        assert!(pool.chunks() == vec![(0, 10000, false)]);
        assert!(pool.counters().used_blocks == 0);
        assert!(pool.integrity_check().is_ok());
    }
}
