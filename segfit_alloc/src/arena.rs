//! The contract between a heap and its backing memory.

use crate::AllocError;
use core::ptr::NonNull;
use memory_units::Bytes;

/// An sbrk-style growable region of raw memory.
///
/// The heap builds every block inside the span `lo()..hi()` and trusts the
/// arena completely, which is what makes this trait unsafe to implement.
///
/// # Safety
///
/// Implementations must guarantee all of the following:
///
/// - `lo()` is double-word aligned and constant for the arena's life.
/// - A successful `extend(n)` returns exactly the old `hi()`; the new bytes
///   run from there for `n` bytes, writable and aliased by nothing else.
/// - A failed `extend` leaves `hi()` unchanged.
/// - `hi()` is always `lo()` plus the sum of every successful extension.
/// - The span is never read, written, moved, or unmapped behind the heap's
///   back while the heap is alive.
pub unsafe trait Arena {
    /// Grow the region by `n` bytes, returning the address where the new
    /// bytes begin.
    fn extend(&mut self, n: Bytes) -> Result<NonNull<u8>, AllocError>;

    /// First byte of the region.
    fn lo(&self) -> NonNull<u8>;

    /// One past the last byte handed out so far.
    fn hi(&self) -> NonNull<u8>;
}
