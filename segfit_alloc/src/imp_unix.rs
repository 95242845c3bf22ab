//! Unix arena backend: one up-front `mmap` reservation, grown by bumping an
//! internal break pointer. Running out of reservation is the OOM edge.

use crate::arena::Arena;
use crate::AllocError;
use core::ptr::{self, NonNull};
use memory_units::{Bytes, Pages, RoundUpTo};

/// A fixed-capacity arena carved out of an anonymous private mapping.
///
/// The whole reservation is mapped readable and writable at construction;
/// `extend` only moves the break, so extension never fails until the
/// capacity is exhausted. The mapping is released on drop.
pub struct MmapArena {
    base: NonNull<u8>,
    capacity: Bytes,
    brk: Bytes,
}

impl MmapArena {
    /// Reserve `capacity` bytes of address space, rounded up to whole
    /// pages. No byte belongs to a heap until `extend` hands it out.
    pub fn with_capacity(capacity: Bytes) -> Result<MmapArena, AllocError> {
        let pages: Pages = capacity.round_up_to();
        let capacity: Bytes = pages.into();
        unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                capacity.0,
                libc::PROT_WRITE | libc::PROT_READ,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(AllocError);
            }
            let base = NonNull::new(addr as *mut u8).ok_or(AllocError)?;
            Ok(MmapArena {
                base,
                capacity,
                brk: Bytes(0),
            })
        }
    }

    /// Bytes still available before the reservation runs out.
    pub fn remaining(&self) -> Bytes {
        Bytes(self.capacity.0 - self.brk.0)
    }
}

unsafe impl Arena for MmapArena {
    fn extend(&mut self, n: Bytes) -> Result<NonNull<u8>, AllocError> {
        let end = self.brk.0.checked_add(n.0).ok_or(AllocError)?;
        if end > self.capacity.0 {
            return Err(AllocError);
        }
        let old_end = unsafe { self.base.as_ptr().add(self.brk.0) };
        self.brk = Bytes(end);
        Ok(unsafe { NonNull::new_unchecked(old_end) })
    }

    fn lo(&self) -> NonNull<u8> {
        self.base
    }

    fn hi(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk.0)) }
    }
}

impl Drop for MmapArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity.0);
        }
    }
}
