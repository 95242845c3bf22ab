/*!

## About

`segfit_alloc` is a segregated-fit heap allocator built from the classical
boundary-tag toolkit: every block carries a `(size, alloc)` header word and a
mirrored footer word, free blocks are threaded onto one of a fixed set of
size-class lists through links embedded in their own payload, placement
splits oversized fits, and freeing coalesces with both neighbors in constant
time by reading the adjacent tags.

The backing memory is an sbrk-style [`Arena`]: a contiguous region that only
ever grows, one extension at a time. Two backends ship with the crate (a
unix `mmap` reservation and an OS-independent static scratch region), and
any type upholding the [`Arena`] contract works, which keeps the word-level
surgery testable against plain buffers.

A heap looks like this after initialization:

```text
 low                                                               high
 +-----+----------+-------------------+------------------+----------+
 | pad | PROLOGUE | free-list heads   | regular blocks   | EPILOGUE |
 |     | (DSIZE,1)| (allocated block, | ...              | (0,1)    |
 |     | hdr+ftr  |  K head words)    |                  | hdr only |
 +-----+----------+-------------------+------------------+----------+
```

The prologue and epilogue are synthetic allocated sentinels that rid
coalescing and walking of every edge case; the head array lives in the heap
as an ordinary allocated block so the forward walk simply steps over it.

## Using the allocator

```
use memory_units::Bytes;
use segfit_alloc::{Heap, MmapArena};

# fn main() -> Result<(), segfit_alloc::AllocError> {
let arena = MmapArena::with_capacity(Bytes(1 << 20))?;
let mut heap = Heap::init(arena)?;

let p = heap.allocate(64).expect("arena exhausted");
unsafe {
    p.as_ptr().write(7);
    heap.free(p.as_ptr());
}
# Ok(())
# }
```

## `cargo` Features

- **extra_assertions**: Re-validate the entire invariant set (tag
  mirroring, tiling, alignment, maximal coalescing, list membership) after
  every mutating operation, panicking on the first violation. Large runtime
  overhead; for debugging the allocator itself.

- **static_array_backend**: Replace the unix `mmap` backend with a global
  static scratch region whose size is fixed at build time (default 32 MiB,
  settable through the `SEGFIT_ALLOC_STATIC_ARRAY_BACKEND_BYTES` environment
  variable). Suitable for `#![no_std]` environments without an OS.

## Implementation Notes and Constraints

- Single-threaded by construction: all allocator state lives in a [`Heap`]
  value and every operation takes `&mut self`. Independent heaps over
  independent arenas coexist freely.

- Two words of overhead per block (header + footer); payloads are aligned
  to a double word and the minimum block is four words.

- Allocation is first-fit within size classes: the request's class is
  searched linearly, then each larger class in turn. Freeing and coalescing
  are O(1).

- Memory is never returned to the arena. Freed blocks are merged with free
  neighbors and kept on the free lists for reuse.

- Reallocation moves a block only as a last resort: shrinks happen in
  place, a block at the heap's tail grows by extending the arena under it,
  and a sufficient free right neighbor is absorbed without copying.

*/

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

use cfg_if::cfg_if;

mod block;
mod check;
mod classes;
mod free_lists;

pub mod arena;

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        mod imp_static_array;
        pub use crate::imp_static_array::StaticArena;
    } else if #[cfg(unix)] {
        mod imp_unix;
        pub use crate::imp_unix::MmapArena;
    } else {
        compile_error! {
            "There is no `segfit_alloc` arena backend for this target; \
             enable the `static_array_backend` feature or provide your own `Arena`."
        }
    }
}

pub use crate::arena::Arena;
pub use crate::check::CheckError;

use crate::block::{double_word, BlockPtr, Tag, MIN_BLOCK_BYTES};
use crate::classes::NUM_CLASSES;
use crate::free_lists::SegLists;
use core::cmp;
use core::mem;
use core::ptr::{self, NonNull};
use memory_units::{Bytes, RoundUpTo, Words};

/// The arena could not supply the requested bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

/// Extension quantum for the allocate miss path: a miss grows the heap by
/// at least this much, so a burst of small allocations costs one extension.
const CHUNK_SIZE: Bytes = Bytes(4096);

/// Round a payload request up to a legal block size: header and footer
/// overhead, double-word alignment, minimum block enforcement. `None` when
/// the padded size overflows.
fn adjust(size: Bytes) -> Option<Bytes> {
    let dsize = double_word().0;
    if size.0 <= dsize {
        Some(Bytes(2 * dsize))
    } else {
        let padded = size.0.checked_add(2 * dsize - 1)?;
        Some(Bytes(dsize * (padded / dsize)))
    }
}

/// A heap: one arena plus the boundary-tag block structure built inside it.
///
/// Created by [`Heap::init`]; all allocator state lives here, so there are
/// no globals and no cross-heap interference. The heap is the exclusive
/// mutator of every word of the arena that is not a live allocated payload.
pub struct Heap<A: Arena> {
    pub(crate) arena: A,
    pub(crate) lists: SegLists,
    pub(crate) prologue: BlockPtr,
    /// Adjusted size of the last chunk-sized-or-larger request the free
    /// lists could not satisfy. While a request for exactly this size
    /// repeats, the search is skipped and the arena is asked directly.
    /// Cleared when a block of this size is freed.
    last_miss: Option<usize>,
}

// The raw pointers all target memory owned by `arena`, which moves with the
// heap.
unsafe impl<A: Arena + Send> Send for Heap<A> {}

impl<A: Arena> Heap<A> {
    /// Build the block structure inside a fresh arena: alignment pad,
    /// prologue, the head-array block, and the epilogue.
    ///
    /// Fails if the arena cannot supply the first few words; no heap exists
    /// in that case, so there is no partial state to observe.
    pub fn init(mut arena: A) -> Result<Heap<A>, AllocError> {
        let wsize = mem::size_of::<usize>();
        let dsize = 2 * wsize;

        let base = arena.extend(Bytes(4 * wsize))?;
        debug_assert_eq!(base.as_ptr() as usize % dsize, 0);

        let prologue;
        let lists;
        unsafe {
            let words = base.as_ptr() as *mut usize;
            words.write(0);
            words.add(1).write(Tag::pack(Bytes(dsize), true).raw());
            words.add(2).write(Tag::pack(Bytes(dsize), true).raw());
            words.add(3).write(Tag::pack(Bytes(0), true).raw());
            prologue =
                BlockPtr::from_payload(NonNull::new_unchecked(base.as_ptr().add(2 * wsize)));

            // The head array is an ordinary allocated block, so the forward
            // walk steps over it and coalescing can never reach it. Its
            // header overwrites the epilogue laid down above; a fresh
            // epilogue follows it.
            let head_words = NUM_CLASSES + 2;
            debug_assert_eq!(head_words % 2, 0);
            let heads_payload = arena.extend(Bytes(head_words * wsize))?;
            let heads_block = BlockPtr::from_payload(heads_payload);
            heads_block.stamp(Bytes(head_words * wsize), true);
            heads_block.next().set_header(Tag::pack(Bytes(0), true));

            let heads = heads_payload.cast::<usize>();
            for class in 0..NUM_CLASSES {
                heads.as_ptr().add(class).write(0);
            }
            lists = SegLists::from_raw(heads);
        }

        let heap = Heap {
            arena,
            lists,
            prologue,
            last_miss: None,
        };
        heap.debug_check();
        Ok(heap)
    }

    /// Allocate `size` bytes, returning a double-word-aligned payload
    /// pointer valid until it is freed or reallocated.
    ///
    /// `None` for a zero-size request or when the arena cannot supply
    /// enough memory; the heap is unchanged in either case.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = adjust(Bytes(size))?;

        unsafe {
            // A previous allocate already proved the lists cannot satisfy
            // this exact size; go straight to the arena.
            if self.last_miss != Some(asize.0) {
                if let Some(block) = self.lists.first_fit(asize) {
                    self.place(block, asize);
                    self.debug_check();
                    return Some(block.payload());
                }
            }

            // Remember the miss only for chunk-sized requests or larger; a
            // smaller request is always servable from the remainder of the
            // chunk about to be carved, which would invalidate the hint
            // immediately.
            if asize >= CHUNK_SIZE {
                self.last_miss = Some(asize.0);
            }
            let block = self.extend_heap(cmp::max(asize, CHUNK_SIZE)).ok()?;
            self.place(block, asize);
            self.debug_check();
            Some(block.payload())
        }
    }

    /// Release an allocation. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer previously returned by this
    /// heap and not freed or reallocated since. Nothing here detects double
    /// frees or foreign pointers; passing one corrupts the heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            Some(payload) => payload,
            None => return,
        };
        let block = BlockPtr::from_payload(payload);
        let size = block.size();
        block.stamp(size, false);
        // Freeing a block of the remembered miss size may make that size
        // servable again.
        if self.last_miss == Some(size.0) {
            self.last_miss = None;
        }
        self.coalesce(block);
        self.debug_check();
    }

    /// Resize an allocation, preserving payload bytes up to the smaller of
    /// the old and new payload sizes.
    ///
    /// Null `ptr` behaves as [`Heap::allocate`]; zero `size` behaves as
    /// [`Heap::free`] and returns `None`. On allocation failure the
    /// original block is untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`]: `ptr` is null or a live payload
    /// pointer from this heap.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.free(ptr);
            return None;
        }
        let payload = match NonNull::new(ptr) {
            Some(payload) => payload,
            None => return self.allocate(size),
        };
        let block = BlockPtr::from_payload(payload);
        let old = block.size();
        let asize = adjust(Bytes(size))?;

        // Shrink in place, splitting when the tail can stand alone.
        if asize <= old {
            if old.0 - asize.0 >= MIN_BLOCK_BYTES {
                block.stamp(asize, true);
                let tail = block.next();
                tail.stamp(Bytes(old.0 - asize.0), false);
                self.coalesce(tail);
            }
            self.debug_check();
            return Some(payload);
        }

        let next = block.next();

        if next.header().size().0 == 0 {
            // Last block before the epilogue: grow the arena under it, no
            // copy. If the arena is exhausted a fit may still exist in the
            // lists, so fall through to relocation.
            if self.arena.extend(Bytes(asize.0 - old.0)).is_ok() {
                block.stamp(asize, true);
                block.next().set_header(Tag::pack(Bytes(0), true));
                self.debug_check();
                return Some(payload);
            }
        } else if !next.is_allocated() && old.0 + next.size().0 >= asize.0 {
            // A free right neighbor large enough: absorb it without copying.
            self.lists.unlink(next);
            let merged = Bytes(old.0 + next.size().0);
            if merged.0 - asize.0 >= MIN_BLOCK_BYTES {
                block.stamp(asize, true);
                let tail = block.next();
                tail.stamp(Bytes(merged.0 - asize.0), false);
                self.lists.insert(tail);
            } else {
                block.stamp(merged, true);
            }
            self.debug_check();
            return Some(payload);
        }

        // Relocate: fresh block, payload copy, release the old block.
        let new = self.allocate(size)?;
        let keep = cmp::min(Bytes(size), Bytes(old.0 - double_word().0));
        ptr::copy_nonoverlapping(payload.as_ptr(), new.as_ptr(), keep.0);
        self.free(payload.as_ptr());
        self.debug_check();
        Some(new)
    }

    /// Walk the whole heap read-only and verify every structural invariant.
    pub fn check_heap(&self) -> Result<(), CheckError> {
        check::check(self)
    }

    /// Write a block-by-block picture of the heap and its free lists.
    pub fn dump_heap(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        check::dump(self, out)
    }

    /// Borrow the backing arena.
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Carve an allocated block of `asize` bytes out of the free block
    /// `block`, splitting the remainder back into the lists when it can
    /// stand alone. The allocated half always takes the low address.
    unsafe fn place(&mut self, block: BlockPtr, asize: Bytes) {
        let csize = block.size();
        debug_assert!(csize >= asize);
        self.lists.unlink(block);
        if csize.0 - asize.0 >= MIN_BLOCK_BYTES {
            block.stamp(asize, true);
            let tail = block.next();
            tail.stamp(Bytes(csize.0 - asize.0), false);
            self.lists.insert(tail);
        } else {
            block.stamp(csize, true);
        }
    }

    /// Grow the heap: stamp a free block over the new bytes, refresh the
    /// epilogue, and merge with the old tail if it was free. The merged
    /// block is on its free list when this returns.
    unsafe fn extend_heap(&mut self, request: Bytes) -> Result<BlockPtr, AllocError> {
        // An even word count keeps every block size a double-word multiple.
        let words: Words = request.round_up_to();
        let words = Words(words.0 + (words.0 & 1));
        let size: Bytes = words.into();

        // The new bytes begin one word past the old epilogue header, which
        // is exactly where the new block's payload belongs; the old
        // epilogue word becomes the new block's header.
        let payload = self.arena.extend(size)?;
        let block = BlockPtr::from_payload(payload);
        block.stamp(size, false);
        block.next().set_header(Tag::pack(Bytes(0), true));
        Ok(self.coalesce(block))
    }

    /// Boundary-tag merge of a just-freed block with its neighbors. The
    /// block must be marked free but on no list; the merged result is
    /// inserted into its list and returned.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let prev = block.prev();
        let next = block.next();
        let mut size = block.size();
        let mut merged = block;

        match (prev.is_allocated(), next.is_allocated()) {
            (true, true) => {}
            (true, false) => {
                self.lists.unlink(next);
                size = Bytes(size.0 + next.size().0);
            }
            (false, true) => {
                self.lists.unlink(prev);
                size = Bytes(size.0 + prev.size().0);
                merged = prev;
            }
            (false, false) => {
                self.lists.unlink(prev);
                self.lists.unlink(next);
                size = Bytes(size.0 + prev.size().0 + next.size().0);
                merged = prev;
            }
        }

        merged.stamp(size, false);
        self.lists.insert(merged);
        merged
    }

    #[cfg(feature = "extra_assertions")]
    fn debug_check(&self) {
        if let Err(err) = self.check_heap() {
            panic!("heap invariant violated: {:?}", err);
        }
    }

    #[cfg(not(feature = "extra_assertions"))]
    #[inline(always)]
    fn debug_check(&self) {}
}
