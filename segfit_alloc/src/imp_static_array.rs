//! OS-independent arena backend: a single static scratch region sized at
//! build time, claimed whole by at most one arena at a time.

use crate::arena::Arena;
use crate::AllocError;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use memory_units::Bytes;
use spin::Mutex;

const SCRATCH_LEN_BYTES: usize = include!(concat!(
    env!("OUT_DIR"),
    "/segfit_alloc_static_array_backend_size_bytes.txt"
));

#[repr(C, align(4096))]
struct ScratchHeap(UnsafeCell<[u8; SCRATCH_LEN_BYTES]>);

// The region is only reachable through a claimed `StaticArena`, and CLAIMED
// admits one claimant at a time.
unsafe impl Sync for ScratchHeap {}

static SCRATCH_HEAP: ScratchHeap = ScratchHeap(UnsafeCell::new([0; SCRATCH_LEN_BYTES]));
static CLAIMED: Mutex<bool> = Mutex::new(false);

/// The static scratch region, claimed as an [`Arena`].
///
/// At most one `StaticArena` exists at a time; the claim is released when it
/// is dropped. The region's size is fixed at build time and may be set with
/// the `SEGFIT_ALLOC_STATIC_ARRAY_BACKEND_BYTES` environment variable
/// (default 32 MiB).
pub struct StaticArena {
    brk: Bytes,
}

impl StaticArena {
    /// Claim the scratch region, or `None` if another arena holds it.
    pub fn claim() -> Option<StaticArena> {
        let mut claimed = CLAIMED.lock();
        if *claimed {
            None
        } else {
            *claimed = true;
            Some(StaticArena { brk: Bytes(0) })
        }
    }

    /// Build-time capacity of the scratch region.
    pub fn capacity() -> Bytes {
        Bytes(SCRATCH_LEN_BYTES)
    }

    fn base() -> *mut u8 {
        SCRATCH_HEAP.0.get() as *mut u8
    }
}

unsafe impl Arena for StaticArena {
    fn extend(&mut self, n: Bytes) -> Result<NonNull<u8>, AllocError> {
        let end = self.brk.0.checked_add(n.0).ok_or(AllocError)?;
        if end > SCRATCH_LEN_BYTES {
            return Err(AllocError);
        }
        let old_end = unsafe { Self::base().add(self.brk.0) };
        self.brk = Bytes(end);
        NonNull::new(old_end).ok_or(AllocError)
    }

    fn lo(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(Self::base()) }
    }

    fn hi(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(Self::base().add(self.brk.0)) }
    }
}

impl Drop for StaticArena {
    fn drop(&mut self) {
        *CLAIMED.lock() = false;
    }
}
