//! Size-class mapping for the segregated free lists.

use memory_units::Bytes;

/// Number of segregated free lists.
pub(crate) const NUM_CLASSES: usize = 8;

/// Upper byte bound of every class but the last, which is open-ended. Any
/// monotone staircase works here as long as the head array tracks its
/// length; these are fixed doubling thresholds.
const CLASS_LIMITS: [usize; NUM_CLASSES - 1] = [64, 128, 256, 512, 1024, 2048, 4096];

/// Map a block size to its free-list index.
pub(crate) fn class_of(size: Bytes) -> usize {
    CLASS_LIMITS
        .iter()
        .position(|&limit| size.0 <= limit)
        .unwrap_or(NUM_CLASSES - 1)
}
