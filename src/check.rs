//! Full-pool integrity checking.
//!
//! [`Pool::integrity_check`] walks every chunk and cross-checks the
//! boundary tags, free-list linkage, bin membership, and counters. In
//! debug builds every mutating pool operation finishes with this walk
//! and panics on the first violation.

use core::fmt;

use crate::utils::bin_of_size;
use crate::{MIN_CHUNK_SIZE, NEXT_WORD, NIL, PREV_WORD, Pool, WORD_SIZE};

/// A structural violation found by [`Pool::integrity_check`].
///
/// Any variant indicates a bug in the allocator or memory corruption by
/// a client; none are recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    /// A chunk's size word is below the minimum chunk size.
    SizeTooSmall {
        /// Offset of the offending chunk.
        base: u32,
        /// Its recorded size.
        size: u32,
    },
    /// A free chunk's link words point outside the pool.
    BadFreeLinks {
        /// Offset of the offending chunk.
        base: u32,
    },
    /// A free chunk's neighbors in its bin list do not link back to it.
    BadBacklinks {
        /// Offset of the offending chunk.
        base: u32,
    },
    /// A free chunk cannot be reached from the root of its size's bin.
    MissingInBin {
        /// Offset of the offending chunk.
        base: u32,
        /// The bin that should contain it.
        bin: usize,
    },
    /// A free chunk's footer word disagrees with its header size.
    MismatchedFooter {
        /// Offset of the offending chunk.
        base: u32,
        /// Size recorded in the header.
        header: u32,
        /// Size recorded in the footer.
        footer: u32,
    },
    /// Two free chunks are physically adjacent.
    AdjacentFree {
        /// Offset of the second free chunk.
        base: u32,
    },
    /// The chunk walk does not cover the pool exactly.
    BadTiling {
        /// Sum of walked chunk sizes.
        walked: u32,
        /// The pool size.
        size: u32,
    },
    /// The block-count gauges disagree with the walk.
    WrongBlockCounts {
        /// `(free, used)` counted by the walk.
        walked: (u32, u32),
        /// `(free, used)` recorded in the counters.
        counted: (u32, u32),
    },
    /// The byte gauges disagree with the walk.
    WrongMemTotals {
        /// `(free, used)` bytes summed by the walk.
        walked: (u32, u32),
        /// `(free, used)` bytes recorded in the counters.
        counted: (u32, u32),
    },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IntegrityError::SizeTooSmall { base, size } => {
                write!(f, "chunk at {base} has impossible size {size}")
            }
            IntegrityError::BadFreeLinks { base } => {
                write!(f, "free chunk at {base} has out-of-pool links")
            }
            IntegrityError::BadBacklinks { base } => {
                write!(f, "free chunk at {base} has broken backlinks")
            }
            IntegrityError::MissingInBin { base, bin } => {
                write!(f, "free chunk at {base} not reachable from bin {bin}")
            }
            IntegrityError::MismatchedFooter { base, header, footer } => {
                write!(f, "free chunk at {base}: header size {header}, footer size {footer}")
            }
            IntegrityError::AdjacentFree { base } => {
                write!(f, "free chunk at {base} follows another free chunk")
            }
            IntegrityError::BadTiling { walked, size } => {
                write!(f, "chunks cover {walked} of {size} pool bytes")
            }
            IntegrityError::WrongBlockCounts { walked, counted } => write!(
                f,
                "walk found {}/{} free/used blocks, counters say {}/{}",
                walked.0, walked.1, counted.0, counted.1
            ),
            IntegrityError::WrongMemTotals { walked, counted } => write!(
                f,
                "walk found {}/{} free/used bytes, counters say {}/{}",
                walked.0, walked.1, counted.0, counted.1
            ),
        }
    }
}

impl std::error::Error for IntegrityError {}

impl Pool {
    /// Verifies the pool's structural invariants.
    ///
    /// Walks all chunks in physical order checking that sizes are
    /// plausible, that chunks tile the pool exactly, that no two free
    /// chunks are adjacent, that every free chunk carries a matching
    /// footer and is linked into the bin for its size with closed
    /// backlinks, and that the counter gauges reconcile with the walk.
    pub fn integrity_check(&self) -> Result<(), IntegrityError> {
        let mut free_blocks: u32 = 0;
        let mut used_blocks: u32 = 0;
        let mut free_mem: u32 = 0;
        let mut used_mem: u32 = 0;
        let mut walked: u32 = 0;
        let mut prev_free = false;

        let mut cur = Some(0);
        while let Some(base) = cur {
            let size = self.tag(base).size();
            if size < MIN_CHUNK_SIZE || self.size() - base < size {
                return Err(IntegrityError::SizeTooSmall { base, size });
            }

            if self.is_used(base) {
                used_blocks += 1;
                used_mem += size;
                prev_free = false;
            } else {
                if prev_free {
                    return Err(IntegrityError::AdjacentFree { base });
                }
                self.check_free_chunk(base, size)?;
                free_blocks += 1;
                free_mem += size;
                prev_free = true;
            }

            walked += size;
            cur = self.next_chunk(base);
        }

        if walked != self.size() {
            return Err(IntegrityError::BadTiling { walked, size: self.size() });
        }

        let c = &self.counters;
        if (c.free_blocks, c.used_blocks) != (free_blocks, used_blocks) {
            return Err(IntegrityError::WrongBlockCounts {
                walked: (free_blocks, used_blocks),
                counted: (c.free_blocks, c.used_blocks),
            });
        }
        if (c.free_mem, c.used_mem) != (free_mem, used_mem) {
            return Err(IntegrityError::WrongMemTotals {
                walked: (free_mem, used_mem),
                counted: (c.free_mem, c.used_mem),
            });
        }

        Ok(())
    }

    /// Checks one free chunk's links, bin membership, and footer.
    fn check_free_chunk(&self, base: u32, size: u32) -> Result<(), IntegrityError> {
        let next = self.word(base + NEXT_WORD);
        let prev = self.word(base + PREV_WORD);
        if next >= self.size() || prev >= self.size() {
            return Err(IntegrityError::BadFreeLinks { base });
        }
        if self.word(next + PREV_WORD) != base || self.word(prev + NEXT_WORD) != base {
            return Err(IntegrityError::BadBacklinks { base });
        }

        let footer = self.word(base + size - WORD_SIZE);
        if footer != size {
            return Err(IntegrityError::MismatchedFooter { base, header: size, footer });
        }

        let bin = bin_of_size(size);
        let root = self.bins[bin];
        if root == NIL {
            return Err(IntegrityError::MissingInBin { base, bin });
        }

        // bounded walk: a mangled list must not hang the checker
        let mut remaining = self.counters.free_blocks.saturating_mul(2).saturating_add(1);
        let mut cur = root;
        loop {
            if cur == base {
                return Ok(());
            }
            cur = self.word(cur + NEXT_WORD);
            remaining -= 1;
            if cur == root || remaining == 0 {
                return Err(IntegrityError::MissingInBin { base, bin });
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn scan_for_errors(&self) {
        if let Err(err) = self.integrity_check() {
            panic!("pool integrity violated: {err}");
        }
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn scan_for_errors(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pool with one isolated free hole and a trailing free remainder.
    fn fragmented_pool() -> Pool {
        let mut pool = Pool::new(1000);
        let a = pool.allocate(60).unwrap();
        let _b = pool.allocate(60).unwrap();
        pool.free(a);
        pool
    }

    #[test]
    fn clean_pools_pass() {
        assert!(Pool::new(1000).integrity_check().is_ok());
        assert!(fragmented_pool().integrity_check().is_ok());
    }

    #[test]
    fn corrupt_footer_is_reported() {
        let mut pool = fragmented_pool();

        // the freed hole is the last chunk; clobber its footer
        let base = 1000 - 64;
        pool.set_word(1000 - WORD_SIZE, 1);

        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::MismatchedFooter { base: b, header: 64, footer: 1 }) if b == base
        ));
    }

    #[test]
    fn undersized_chunk_is_reported() {
        let mut pool = fragmented_pool();

        let tag = pool.tag(0).with_size(6);
        pool.set_tag(0, tag);

        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::SizeTooSmall { base: 0, size: 6 })
        ));
    }

    #[test]
    fn emptied_bin_root_is_reported() {
        let mut pool = fragmented_pool();

        let bin = bin_of_size(64);
        pool.bins[bin] = NIL;

        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::MissingInBin { bin: b, .. }) if b == bin
        ));
    }

    #[test]
    fn broken_backlink_is_reported() {
        let mut pool = fragmented_pool();

        // the low remainder and the freed hole share a bin cycle;
        // point the remainder's next link at itself, stranding the hole
        pool.set_word(NEXT_WORD, 0);

        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::BadBacklinks { base: 0 })
        ));
    }

    #[test]
    fn out_of_pool_link_is_reported() {
        let mut pool = fragmented_pool();

        pool.set_word(NEXT_WORD, NIL);

        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::BadFreeLinks { base: 0 })
        ));
    }

    #[test]
    fn drifted_counters_are_reported() {
        let mut pool = fragmented_pool();

        pool.counters.free_blocks += 1;
        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::WrongBlockCounts { .. })
        ));

        let mut pool = fragmented_pool();
        pool.counters.used_mem += 2;
        pool.counters.free_mem -= 2;
        assert!(matches!(
            pool.integrity_check(),
            Err(IntegrityError::WrongMemTotals { .. })
        ));
    }

    #[test]
    fn errors_display_their_location() {
        let err = IntegrityError::MissingInBin { base: 64, bin: 16 };
        let text = err.to_string();
        assert!(text.contains("64") && text.contains("16"));
    }
}
