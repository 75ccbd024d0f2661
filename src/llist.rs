//! Free-list linkage threaded through free chunk bodies.
//!
//! Each bin is a circular doubly-linked list. The two link words live
//! directly after a free chunk's size word; a used chunk's payload
//! overlays them. There is no sentinel node: an empty bin's root is
//! [`NIL`], a populated bin's root is the offset of one member.

use crate::utils::bin_of_size;
use crate::{NEXT_WORD, NIL, PREV_WORD, Pool};

impl Pool {
    /// Links the free chunk at `base` into the bin for its current size.
    ///
    /// The chunk's header must already hold its final size.
    pub(crate) fn free_list_push(&mut self, base: u32) {
        let bin = bin_of_size(self.tag(base).size());
        let root = self.bins[bin];

        if root == NIL {
            self.bins[bin] = base;
            self.set_word(base + NEXT_WORD, base);
            self.set_word(base + PREV_WORD, base);
        } else {
            let next = self.word(root + NEXT_WORD);
            self.set_word(base + PREV_WORD, root);
            self.set_word(base + NEXT_WORD, next);
            self.set_word(next + PREV_WORD, base);
            self.set_word(root + NEXT_WORD, base);
        }
    }

    /// Unlinks the free chunk at `base` from the bin for its current size.
    ///
    /// The chunk's own link words are left stale.
    pub(crate) fn free_list_unlink(&mut self, base: u32) {
        let bin = bin_of_size(self.tag(base).size());

        if self.bins[bin] == base {
            let next = self.word(base + NEXT_WORD);
            self.bins[bin] = if next == base { NIL } else { next };
        }

        let next = self.word(base + NEXT_WORD);
        let prev = self.word(base + PREV_WORD);
        self.set_word(next + PREV_WORD, prev);
        self.set_word(prev + NEXT_WORD, next);
    }
}
