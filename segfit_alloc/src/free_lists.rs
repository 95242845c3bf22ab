//! The segregated free-list registry.
//!
//! One doubly-linked list per size class, with the head words carved into
//! the heap itself (the head-array block written by `Heap::init`). Free
//! blocks link through the two lead words of their payload, so membership
//! costs nothing beyond the minimum block size and unlink never scans.

use crate::block::BlockPtr;
use crate::classes::{class_of, NUM_CLASSES};
use core::ptr::NonNull;
use memory_units::Bytes;

pub(crate) struct SegLists {
    heads: NonNull<usize>,
}

impl SegLists {
    /// `heads` must point at `NUM_CLASSES` writable, zeroed words that stay
    /// valid (and unmoved) for the life of the registry.
    pub(crate) unsafe fn from_raw(heads: NonNull<usize>) -> SegLists {
        SegLists { heads }
    }

    /// The head array's own address; it doubles as the payload pointer of
    /// the block that holds it.
    pub(crate) fn heads_payload(&self) -> NonNull<u8> {
        self.heads.cast()
    }

    pub(crate) unsafe fn head(&self, class: usize) -> Option<BlockPtr> {
        debug_assert!(class < NUM_CLASSES);
        let raw = self.heads.as_ptr().add(class).read();
        NonNull::new(raw as *mut u8).map(|payload| BlockPtr::from_payload(payload))
    }

    unsafe fn set_head(&mut self, class: usize, to: Option<BlockPtr>) {
        debug_assert!(class < NUM_CLASSES);
        self.heads.as_ptr().add(class).write(to.map_or(0, |block| block.addr()));
    }

    /// Splice a free block onto the head of its class's list.
    pub(crate) unsafe fn insert(&mut self, block: BlockPtr) {
        let class = class_of(block.size());
        let old_head = self.head(class);
        block.set_link_prev(None);
        block.set_link_next(old_head);
        if let Some(old_head) = old_head {
            old_head.set_link_prev(Some(block));
        }
        self.set_head(class, Some(block));
    }

    /// Unsplice a block from whichever list holds it, recomputing the class
    /// from the block's current header. O(1): the doubly-linked neighbors
    /// are patched directly, the head word only when the block was first.
    pub(crate) unsafe fn unlink(&mut self, block: BlockPtr) {
        let prev = block.link_prev();
        let next = block.link_next();
        match prev {
            None => {
                let class = class_of(block.size());
                debug_assert_eq!(self.head(class), Some(block));
                self.set_head(class, next);
            }
            Some(prev) => prev.set_link_next(next),
        }
        if let Some(next) = next {
            next.set_link_prev(prev);
        }
        block.set_link_prev(None);
        block.set_link_next(None);
    }

    /// First-fit search: the mapped class first, then every larger class
    /// in order. Returns the first block big enough, still on its list.
    pub(crate) unsafe fn first_fit(&self, asize: Bytes) -> Option<BlockPtr> {
        for class in class_of(asize)..NUM_CLASSES {
            let mut cursor = self.head(class);
            while let Some(block) = cursor {
                if block.size() >= asize {
                    return Some(block);
                }
                cursor = block.link_next();
            }
        }
        None
    }
}
