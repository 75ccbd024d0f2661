//! The reference-counted, compacting layer over [`Pool`].

use crate::counters::CompactCounters;
use crate::{MIN_CHUNK_SIZE, Pool, PoolPtr, WORD_SIZE};

/// A stable, opaque name for a live allocation.
///
/// Handles survive [compaction](Tamp::compact) unchanged; only the
/// interior pointer behind them moves. A handle is dead once its
/// reference count reaches zero (or [`Tamp::free`] is called) and must
/// not be used afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Handle(u32);

impl Handle {
    /// The handle's slot index in the handle table.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// One handle-table slot. A slot with `size == 0` is unoccupied.
#[derive(Clone, Copy, Debug)]
struct RefHolder {
    count: u32,
    size: u32,
    ptr: Option<PoolPtr>,
}

impl RefHolder {
    const EMPTY: Self = Self { count: 0, size: 0, ptr: None };
    // distinguishes a released slot from a never-used one in dumps
    const DEAD: Self = Self { count: u32::MAX, size: 0, ptr: None };
}

const INITIAL_SLOTS: usize = 100;

/// The compacting, reference-counted heap.
///
/// Wraps a [`Pool`] with a table of [`Handle`]s. Each live handle holds
/// a reference count, the size the client requested, and the current
/// interior pointer. [`compact`](Tamp::compact) slides every live
/// block toward the low end of the pool, leaving all free bytes as one
/// trailing chunk, and rewires every handle's pointer in place.
///
/// All operations require `&mut self`; wrap the instance in
/// [`Tampck`](crate::Tampck) to share it across threads.
pub struct Tamp {
    pool: Pool,
    refs: Vec<RefHolder>,
    counters: CompactCounters,
}

impl core::fmt::Debug for Tamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tamp")
            .field("pool", &self.pool)
            .field("live_handles", &self.refs.iter().filter(|rh| rh.ptr.is_some()).count())
            .field("counters", &self.counters)
            .finish()
    }
}

impl Tamp {
    /// Creates a compacting heap managing `size` bytes.
    ///
    /// # Panics
    /// Panics as [`Pool::new`] does for sizes below the minimum chunk.
    pub fn new(size: u32) -> Self {
        Self {
            pool: Pool::new(size),
            refs: vec![RefHolder::EMPTY; INITIAL_SLOTS],
            counters: CompactCounters::new(),
        }
    }

    /// Allocates `size` bytes and returns a handle with a reference
    /// count of one.
    ///
    /// Returns `None` when the pool cannot satisfy the request (the
    /// usual response is to [`compact`](Tamp::compact) and retry once)
    /// or when `size` is zero.
    pub fn alloc(&mut self, size: u32) -> Option<Handle> {
        if size == 0 {
            return None;
        }

        let ptr = self.pool.allocate(size)?;
        Some(Handle(self.take_slot(ptr, size)))
    }

    /// Releases `handle` regardless of its reference count.
    ///
    /// # Panics
    /// Panics if `handle` is already dead.
    pub fn free(&mut self, handle: Handle) {
        let slot = handle.0 as usize;
        let Some(ptr) = self.refs[slot].ptr else {
            panic!("handle {} is not live", handle.0);
        };

        self.pool.free(ptr);
        self.refs[slot] = RefHolder::DEAD;
    }

    /// Increments `handle`'s reference count.
    ///
    /// The count saturates at `u32::MAX` rather than wrapping.
    pub fn incref(&mut self, handle: Handle) {
        let slot = handle.0 as usize;
        debug_assert!(self.refs[slot].ptr.is_some(), "handle {} is not live", handle.0);

        self.refs[slot].count = self.refs[slot].count.saturating_add(1);
    }

    /// Decrements `handle`'s reference count, releasing the allocation
    /// when it reaches zero.
    ///
    /// Returns `true` while the handle remains alive.
    pub fn decref(&mut self, handle: Handle) -> bool {
        let slot = handle.0 as usize;
        if self.refs[slot].count > 1 {
            self.refs[slot].count -= 1;
            return true;
        }

        self.free(handle);
        false
    }

    /// The size the client requested for `handle`, not the (larger)
    /// chunk size backing it.
    #[inline]
    pub fn size_of(&self, handle: Handle) -> u32 {
        self.refs[handle.0 as usize].size
    }

    /// The current interior pointer behind `handle`, or `None` for a
    /// dead handle.
    ///
    /// Valid only until the next [`compact`](Tamp::compact).
    #[inline]
    pub fn pointer_of(&self, handle: Handle) -> Option<PoolPtr> {
        self.refs[handle.0 as usize].ptr
    }

    /// The current reference count of `handle`.
    #[inline]
    pub fn refcount_of(&self, handle: Handle) -> u32 {
        self.refs[handle.0 as usize].count
    }

    /// A shared view of `handle`'s payload.
    ///
    /// # Panics
    /// Panics if `handle` is dead.
    pub fn bytes(&self, handle: Handle) -> &[u8] {
        let rh = self.refs[handle.0 as usize];
        let Some(ptr) = rh.ptr else {
            panic!("handle {} is not live", handle.0);
        };
        self.pool.bytes(ptr, rh.size)
    }

    /// A mutable view of `handle`'s payload.
    ///
    /// # Panics
    /// Panics if `handle` is dead.
    pub fn bytes_mut(&mut self, handle: Handle) -> &mut [u8] {
        let rh = self.refs[handle.0 as usize];
        let Some(ptr) = rh.ptr else {
            panic!("handle {} is not live", handle.0);
        };
        self.pool.bytes_mut(ptr, rh.size)
    }

    /// The underlying pool, for its counters, size, and
    /// [`integrity_check`](Pool::integrity_check).
    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The compaction counters.
    #[inline]
    pub fn counters(&self) -> &CompactCounters {
        &self.counters
    }

    /// Slides every live block toward offset zero, coalescing all free
    /// bytes into a single trailing chunk.
    ///
    /// Handles, their sizes, and their reference counts are unchanged;
    /// every live handle's interior pointer is rewritten to the block's
    /// new location. Payload contents are preserved bit for bit, but
    /// clients must re-fetch pointers obtained before the call.
    ///
    /// There is no reverse map from chunks to handles, so one is built
    /// in place: the first payload word of each live block is saved to
    /// a side buffer and overwritten with the owning handle's index,
    /// then restored after the slide.
    pub fn compact(&mut self) {
        // stamp handle indices into the live blocks' first payload
        // words (every used chunk's payload is at least one word)
        let mut backing = vec![0u32; self.refs.len()];
        for (slot, rh) in self.refs.iter().enumerate() {
            if let Some(ptr) = rh.ptr {
                backing[slot] = self.pool.word(ptr.offset());
                self.pool.set_word(ptr.offset(), slot as u32);
            }
        }

        // drop all free-chunk bookkeeping; the layout below is rebuilt
        // from scratch
        let mut cur = Some(0);
        while let Some(base) = cur {
            if !self.pool.is_used(base) {
                self.pool.free_list_unlink(base);
                self.pool.counters.free_blocks -= 1;
            }
            cur = self.pool.next_chunk(base);
        }

        // slide used chunks down; the step to the next chunk is taken
        // from the old header before the move clobbers it
        let mut write: u32 = 0;
        let mut used_total: u32 = 0;
        let mut cur = Some(0);
        while let Some(base) = cur {
            let next = self.pool.next_chunk(base);
            if self.pool.is_used(base) {
                let size = self.pool.tag(base).size();
                if base != write {
                    self.pool.mem.copy_within(
                        base as usize..(base + size) as usize,
                        write as usize,
                    );
                }
                self.pool.set_chunk(write, size, true);
                write += size;
                used_total += size;
                self.counters.account_slide(size);
            }
            cur = next;
        }

        // one trailing free chunk takes whatever remains
        let free_size = self.pool.size() - used_total;
        self.pool.counters.free_mem = free_size;
        let free_chunk = if free_size > 0 {
            debug_assert!(free_size >= MIN_CHUNK_SIZE);
            self.pool.counters.free_blocks += 1;
            self.pool.set_chunk(write, free_size, false);
            let tag = self.pool.tag(write).with_prev_used(true);
            self.pool.set_tag(write, tag);
            self.pool.free_list_push(write);
            Some(write)
        } else {
            None
        };

        // every surviving chunk's predecessor is used
        let mut cur = Some(0);
        while let Some(base) = cur {
            if Some(base) == free_chunk {
                break;
            }
            let tag = self.pool.tag(base).with_prev_used(true);
            self.pool.set_tag(base, tag);
            cur = self.pool.next_chunk(base);
        }

        // restore the stamped payload words and rewire the handles
        let mut cur = Some(0);
        while let Some(base) = cur {
            if Some(base) == free_chunk {
                break;
            }
            let payload = base + WORD_SIZE;
            let slot = self.pool.word(payload) as usize;
            self.pool.set_word(payload, backing[slot]);
            self.refs[slot].ptr = Some(PoolPtr(payload));
            cur = self.pool.next_chunk(base);
        }

        self.counters.account_collection();
        self.pool.scan_for_errors();
    }

    /// Claims a free handle-table slot, growing the table when every
    /// slot is occupied.
    fn take_slot(&mut self, ptr: PoolPtr, size: u32) -> u32 {
        let fresh = RefHolder { count: 1, size, ptr: Some(ptr) };

        for (slot, rh) in self.refs.iter_mut().enumerate() {
            if rh.size == 0 {
                *rh = fresh;
                return slot as u32;
            }
        }

        self.refs.push(fresh);
        (self.refs.len() - 1) as u32
    }
}
