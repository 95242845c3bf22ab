//! Read-only heap consistency checking and diagnostics.
//!
//! The walker revalidates everything the allocator relies on: matching
//! boundary tags, exact tiling between the sentinels, payload alignment,
//! maximal coalescing, and agreement between the alloc bits and the
//! segregated free lists. It never mutates the heap, so it is safe to call
//! from anywhere, including between the steps of a failing test.

use crate::arena::Arena;
use crate::block::{double_word, word_size, BlockPtr, MIN_BLOCK_BYTES};
use crate::classes::{class_of, NUM_CLASSES};
use crate::Heap;
use core::fmt::{self, Write};

/// An invariant violation found by [`Heap::check_heap`]. Addresses are the
/// payload pointer of the offending block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue does not read `(DSIZE, allocated)` in both tags.
    BadPrologue,
    /// The walk did not end on an allocated zero-size header flush with the
    /// heap's end.
    BadEpilogue,
    /// A payload pointer is not double-word aligned.
    MisalignedPayload {
        /// Payload address of the block.
        payload: usize,
    },
    /// A block's footer does not mirror its header.
    TagMismatch {
        /// Payload address of the block.
        payload: usize,
    },
    /// A block's size is below the minimum or not a double-word multiple.
    BadBlockSize {
        /// Payload address of the block.
        payload: usize,
    },
    /// A block runs past the end of the arena.
    OutOfBounds {
        /// Payload address of the block.
        payload: usize,
    },
    /// Two adjacent blocks are both free; coalescing should have merged
    /// them.
    AdjacentFree {
        /// Payload address of the second free block.
        payload: usize,
    },
    /// The head-array block has lost its allocated bit.
    HeadArrayFreed,
    /// A block on a free list is marked allocated.
    AllocatedOnList {
        /// Payload address of the block.
        payload: usize,
        /// The list it was found on.
        class: usize,
    },
    /// A free block sits on a list that does not match its size class.
    WrongClass {
        /// Payload address of the block.
        payload: usize,
        /// The list it was found on.
        class: usize,
    },
    /// A list's prev links disagree with the order of its next links.
    BrokenLinks {
        /// Payload address of the block whose prev link is wrong.
        payload: usize,
    },
    /// A free list holds more entries than the heap has free blocks: a
    /// cycle or a double insertion.
    ListOverrun {
        /// The offending list.
        class: usize,
    },
    /// The number of free blocks seen by the heap walk differs from total
    /// free-list membership.
    FreeCountMismatch {
        /// Free blocks found walking the heap.
        walked: usize,
        /// Entries found walking the lists.
        listed: usize,
    },
}

pub(crate) fn check<A: Arena>(heap: &Heap<A>) -> Result<(), CheckError> {
    let dsize = double_word();
    let hi = heap.arena.hi().as_ptr() as usize;

    unsafe {
        let prologue = heap.prologue;
        if prologue.header().size() != dsize
            || !prologue.header().is_allocated()
            || prologue.header() != prologue.footer()
        {
            return Err(CheckError::BadPrologue);
        }

        // Pass 1: tile the heap from the first real block to the epilogue.
        let mut walked_free = 0;
        let mut prev_free = false;
        let mut block = prologue.next();
        loop {
            let payload = block.addr();
            if payload > hi {
                return Err(CheckError::BadEpilogue);
            }
            let header = block.header();
            if header.size().0 == 0 {
                // Epilogue: allocated, and flush with the heap's end.
                if !header.is_allocated() || payload != hi {
                    return Err(CheckError::BadEpilogue);
                }
                break;
            }
            if payload % dsize.0 != 0 {
                return Err(CheckError::MisalignedPayload { payload });
            }
            if header.size().0 % dsize.0 != 0 || header.size().0 < MIN_BLOCK_BYTES {
                return Err(CheckError::BadBlockSize { payload });
            }
            if payload + header.size().0 - word_size().0 > hi {
                return Err(CheckError::OutOfBounds { payload });
            }
            if header != block.footer() {
                return Err(CheckError::TagMismatch { payload });
            }
            let free = !header.is_allocated();
            if free && prev_free {
                return Err(CheckError::AdjacentFree { payload });
            }
            if free {
                walked_free += 1;
            }
            prev_free = free;
            block = block.next();
        }

        let heads_block = BlockPtr::from_payload(heap.lists.heads_payload());
        if !heads_block.is_allocated() {
            return Err(CheckError::HeadArrayFreed);
        }

        // Pass 2: the segregated lists agree with the alloc bits.
        let mut listed = 0;
        for class in 0..NUM_CLASSES {
            let mut prev: Option<BlockPtr> = None;
            let mut cursor = heap.lists.head(class);
            while let Some(block) = cursor {
                let payload = block.addr();
                if block.is_allocated() {
                    return Err(CheckError::AllocatedOnList { payload, class });
                }
                if class_of(block.size()) != class {
                    return Err(CheckError::WrongClass { payload, class });
                }
                if block.link_prev() != prev {
                    return Err(CheckError::BrokenLinks { payload });
                }
                if listed >= walked_free {
                    return Err(CheckError::ListOverrun { class });
                }
                listed += 1;
                prev = cursor;
                cursor = block.link_next();
            }
        }
        if listed != walked_free {
            return Err(CheckError::FreeCountMismatch {
                walked: walked_free,
                listed,
            });
        }
    }

    Ok(())
}

pub(crate) fn dump<A: Arena>(heap: &Heap<A>, out: &mut dyn Write) -> fmt::Result {
    unsafe {
        let lo = heap.arena.lo().as_ptr() as usize;
        let hi = heap.arena.hi().as_ptr() as usize;
        writeln!(out, "heap [{:#x}, {:#x})", lo, hi)?;

        let mut block = heap.prologue;
        loop {
            let header = block.header();
            if header.size().0 == 0 {
                writeln!(out, "{:#x}: epilogue [0|a]", block.addr())?;
                break;
            }
            let footer = block.footer();
            writeln!(
                out,
                "{:#x}: header [{}|{}] footer [{}|{}]",
                block.addr(),
                header.size().0,
                if header.is_allocated() { 'a' } else { 'f' },
                footer.size().0,
                if footer.is_allocated() { 'a' } else { 'f' },
            )?;
            block = block.next();
        }

        for class in 0..NUM_CLASSES {
            write!(out, "class {}:", class)?;
            let mut cursor = heap.lists.head(class);
            while let Some(block) = cursor {
                write!(out, " {:#x}", block.addr())?;
                cursor = block.link_next();
            }
            writeln!(out)?;
        }
    }
    Ok(())
}
