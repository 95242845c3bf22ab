//! Boundary-tag words and payload-relative block geometry.
//!
//! Every block is `[header word | payload ... | footer word]`. Header and
//! footer both encode `(size, alloc bit)`; sizes are always double-word
//! multiples, so the low bits of the size are free and bit 0 carries the
//! alloc flag. A free block keeps its list links in the first two payload
//! words, which is why the minimum block is four words: header, two links,
//! footer.

use core::mem;
use core::ptr::NonNull;
use memory_units::Bytes;

/// One tag word, in bytes.
pub(crate) fn word_size() -> Bytes {
    Bytes(mem::size_of::<usize>())
}

/// A double word, in bytes: the payload alignment and the block size quantum.
pub(crate) fn double_word() -> Bytes {
    Bytes(2 * mem::size_of::<usize>())
}

/// Smallest legal block: header + two link words + footer.
pub(crate) const MIN_BLOCK_BYTES: usize = 4 * mem::size_of::<usize>();

/// A packed `(size, alloc)` boundary-tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
    const ALLOC_BIT: usize = 0b1;

    pub(crate) fn pack(size: Bytes, allocated: bool) -> Tag {
        debug_assert_eq!(size.0 & (double_word().0 - 1), 0);
        Tag(size.0 | allocated as usize)
    }

    pub(crate) fn size(self) -> Bytes {
        Bytes(self.0 & !(double_word().0 - 1))
    }

    pub(crate) fn is_allocated(self) -> bool {
        self.0 & Self::ALLOC_BIT != 0
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }
}

/// A payload pointer: the address one word past a block's header. This is
/// the unit the rest of the allocator (and the caller) speaks in; every
/// other address is derived from it through the adjacent boundary tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    /// Wrap a payload address. The word before it must be a valid header
    /// before any of the derived accessors are used.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> BlockPtr {
        BlockPtr(payload)
    }

    pub(crate) fn payload(self) -> NonNull<u8> {
        self.0
    }

    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn word(self, offset: isize) -> *mut usize {
        unsafe { (self.0.as_ptr() as *mut usize).offset(offset) }
    }

    pub(crate) unsafe fn header(self) -> Tag {
        Tag(self.word(-1).read())
    }

    pub(crate) unsafe fn footer(self) -> Tag {
        let end = self.0.as_ptr().add(self.header().size().0 - double_word().0);
        Tag((end as *mut usize).read())
    }

    pub(crate) unsafe fn size(self) -> Bytes {
        self.header().size()
    }

    pub(crate) unsafe fn is_allocated(self) -> bool {
        self.header().is_allocated()
    }

    /// Write a matching header and footer for a block of `size` bytes
    /// starting at this payload.
    pub(crate) unsafe fn stamp(self, size: Bytes, allocated: bool) {
        let tag = Tag::pack(size, allocated);
        self.word(-1).write(tag.raw());
        let footer = self.0.as_ptr().add(size.0 - double_word().0);
        (footer as *mut usize).write(tag.raw());
    }

    /// Overwrite only the header word. For epilogues, which have no footer.
    pub(crate) unsafe fn set_header(self, tag: Tag) {
        self.word(-1).write(tag.raw());
    }

    pub(crate) unsafe fn next(self) -> BlockPtr {
        BlockPtr(NonNull::new_unchecked(self.0.as_ptr().add(self.size().0)))
    }

    /// Steps backward through the previous block's footer, which sits one
    /// double word below this payload. The prologue guarantees that footer
    /// exists for the first regular block.
    pub(crate) unsafe fn prev(self) -> BlockPtr {
        let prev_footer = Tag(self.word(-2).read());
        BlockPtr(NonNull::new_unchecked(self.0.as_ptr().sub(prev_footer.size().0)))
    }

    // Free-list links, stored in the first two payload words. Only
    // meaningful while the block is free; 0 encodes "none".

    pub(crate) unsafe fn link_prev(self) -> Option<BlockPtr> {
        Self::decode(self.word(0).read())
    }

    pub(crate) unsafe fn link_next(self) -> Option<BlockPtr> {
        Self::decode(self.word(1).read())
    }

    pub(crate) unsafe fn set_link_prev(self, to: Option<BlockPtr>) {
        self.word(0).write(Self::encode(to));
    }

    pub(crate) unsafe fn set_link_next(self, to: Option<BlockPtr>) {
        self.word(1).write(Self::encode(to));
    }

    fn encode(link: Option<BlockPtr>) -> usize {
        link.map_or(0, |block| block.addr())
    }

    fn decode(raw: usize) -> Option<BlockPtr> {
        NonNull::new(raw as *mut u8).map(BlockPtr)
    }
}
