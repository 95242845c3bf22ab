//! Randomized workload harness for `segfit_alloc`.
//!
//! Workloads are sequences of allocate/free/reallocate operations. The
//! runner shadows every live allocation with an index-tagged byte pattern,
//! so payload overlap and content loss show up as pattern corruption, and
//! re-verifies the full heap invariant set after every operation. Failing
//! workloads shrink toward minimal traces.

use cfg_if::cfg_if;
use quickcheck::{Arbitrary, Gen};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use segfit_alloc::Heap;
use std::ptr::NonNull;

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        use segfit_alloc::StaticArena;

        type TestArena = StaticArena;

        // The scratch region is a singleton; concurrent tests queue up
        // for it.
        fn new_arena() -> TestArena {
            loop {
                if let Some(arena) = StaticArena::claim() {
                    return arena;
                }
                std::thread::yield_now();
            }
        }
    } else {
        use memory_units::Bytes;
        use segfit_alloc::MmapArena;

        type TestArena = MmapArena;

        const ARENA_CAPACITY: usize = 64 << 20;

        fn new_arena() -> TestArena {
            MmapArena::with_capacity(Bytes(ARENA_CAPACITY)).expect("mmap reservation failed")
        }
    }
}

fn new_heap() -> Heap<TestArena> {
    Heap::init(new_arena()).expect("heap initialization failed")
}

const DOUBLE_WORD: usize = 2 * std::mem::size_of::<usize>();

/// One step of a workload.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Allocate this many bytes.
    Alloc(usize),

    /// Free the n^th allocation made, or no-op if it is already gone.
    Free(usize),

    /// Resize the n^th allocation to this many bytes, or no-op if it is
    /// already gone.
    Realloc(usize, usize),
}

pub use Operation::*;

#[derive(Debug, Clone)]
pub struct Operations(Vec<Operation>);

cfg_if! {
    if #[cfg(feature = "extra_assertions")] {
        const NUM_OPERATIONS: usize = 500;
    } else {
        const NUM_OPERATIONS: usize = 2_000;
    }
}

fn arbitrary_size(rng: &mut SmallRng) -> usize {
    // Zero-sized request 1/1000 times.
    if rng.gen_ratio(1, 1000) {
        return 0;
    }

    // Large allocation spanning extension chunks with P = 1/20.
    if rng.gen_ratio(1, 20) {
        return rng.gen_range(4096..20_000);
    }

    if rng.gen_bool(0.5) {
        // Boundary sizes around the double word.
        [1, DOUBLE_WORD - 1, DOUBLE_WORD, DOUBLE_WORD + 1][rng.gen_range(0..4)]
    } else {
        rng.gen_range(1..512)
    }
}

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        // The allocator, not the RNG, should be the hot path; drive one
        // cheap seeded generator per workload.
        let mut rng = SmallRng::seed_from_u64(u64::arbitrary(g));

        let mut num_allocs = 0usize;
        let mut active: Vec<usize> = vec![];
        let mut ops = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4, resize with P = 1/10, allocate otherwise.
            if !active.is_empty() && rng.gen_ratio(1, 4) {
                let i = rng.gen_range(0..active.len());
                ops.push(Free(active.swap_remove(i)));
            } else if !active.is_empty() && rng.gen_ratio(1, 10) {
                let i = rng.gen_range(0..active.len());
                let size = arbitrary_size(&mut rng);
                let idx = active[i];
                if size == 0 {
                    active.swap_remove(i);
                }
                ops.push(Realloc(idx, size));
            } else {
                active.push(num_allocs);
                num_allocs += 1;
                ops.push(Alloc(arbitrary_size(&mut rng)));
            }
        }

        ops.reserve_exact(active.len());
        while !active.is_empty() {
            let i = rng.gen_range(0..active.len());
            ops.push(Free(active.swap_remove(i)));
        }

        Operations(ops)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        // Prefixes first, then dropping single frees/reallocs (removing an
        // Alloc would renumber every later slot).
        let ops = self.0.clone();
        let prefixes = (0..ops.len()).map(move |i| Operations(ops[..i].to_vec()));

        let skippable: Vec<usize> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Free(_) | Realloc(..) => Some(i),
                Alloc(_) => None,
            })
            .collect();
        let ops = self.0.clone();
        let without_one = skippable.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        Box::new(prefixes.chain(without_one))
    }
}

fn tag(slot: usize) -> u8 {
    (slot as u8) ^ 0xa5
}

fn fill(p: NonNull<u8>, len: usize, tag: u8) {
    unsafe {
        for i in 0..len {
            p.as_ptr().add(i).write(tag ^ (i as u8));
        }
    }
}

fn verify(p: NonNull<u8>, len: usize, tag: u8) {
    unsafe {
        for i in 0..len {
            assert_eq!(
                p.as_ptr().add(i).read(),
                tag ^ (i as u8),
                "payload byte {} of {:p} corrupted",
                i,
                p.as_ptr()
            );
        }
    }
}

impl Operations {
    /// Run the workload against a fresh heap, verifying alignment, payload
    /// integrity, and the full invariant set after every operation.
    pub fn run(&self) {
        let mut heap = new_heap();
        let mut live: Vec<Option<(NonNull<u8>, usize)>> = Vec::new();

        for op in self.0.iter().cloned() {
            match op {
                Alloc(size) => {
                    let slot = live.len();
                    let ptr = heap.allocate(size);
                    if size == 0 {
                        assert!(ptr.is_none(), "allocate(0) must return None");
                        live.push(None);
                    } else {
                        match ptr {
                            Some(p) => {
                                assert_eq!(p.as_ptr() as usize % DOUBLE_WORD, 0);
                                fill(p, size, tag(slot));
                                live.push(Some((p, size)));
                            }
                            None => live.push(None),
                        }
                    }
                }
                Free(idx) => {
                    if let Some(entry) = live.get_mut(idx) {
                        if let Some((p, size)) = entry.take() {
                            verify(p, size, tag(idx));
                            unsafe { heap.free(p.as_ptr()) };
                        }
                    }
                }
                Realloc(idx, size) => {
                    if let Some(entry) = live.get_mut(idx) {
                        if let Some((p, old_size)) = entry.take() {
                            let moved = unsafe { heap.reallocate(p.as_ptr(), size) };
                            if size == 0 {
                                assert!(moved.is_none(), "reallocate(p, 0) must return None");
                            } else {
                                match moved {
                                    Some(q) => {
                                        assert_eq!(q.as_ptr() as usize % DOUBLE_WORD, 0);
                                        verify(q, old_size.min(size), tag(idx));
                                        fill(q, size, tag(idx));
                                        *entry = Some((q, size));
                                    }
                                    // Failure leaves the old block intact.
                                    None => {
                                        verify(p, old_size, tag(idx));
                                        *entry = Some((p, old_size));
                                    }
                                }
                            }
                        }
                    }
                }
            }
            heap.check_heap().expect("heap invariants violated");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ($name:ident) => {
        #[test]
        fn $name() {
            fn workload(ops: Operations) {
                ops.run();
            }

            quickcheck::QuickCheck::new()
                .tests(2)
                .quickcheck(workload as fn(Operations) -> ());
        }
    };
}

// The test harness runs these concurrently with each other.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
// Limit the stress on the limited-size static backend, which the tests
// must share.
cfg_if! {
    if #[cfg(not(feature = "static_array_backend"))] {
        run_quickchecks!(quickchecks_2);
        run_quickchecks!(quickchecks_3);
    }
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn regression_alloc_free_alloc() {
    Operations(vec![Alloc(1414), Free(0), Alloc(1414), Free(1)]).run();
}

#[test]
fn regression_zero_size_interleaved() {
    Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run();
}

#[test]
fn regression_large_then_small() {
    Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run();
}

#[test]
fn regression_realloc_chain() {
    Operations(vec![
        Alloc(100),
        Realloc(0, 3000),
        Realloc(0, 10),
        Realloc(0, 500),
        Free(0),
    ])
    .run();
}

#[test]
fn allocate_size_zero() {
    use std::iter;
    Operations(
        iter::repeat(Alloc(0))
            .take(1000)
            .chain((0..1000).map(Free))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_small() {
    use std::iter;
    Operations(
        iter::repeat(Alloc(48))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(256)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_large() {
    use std::iter;
    Operations(
        iter::repeat(Alloc(5000))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(16 * 1024)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run();
}

////////////////////////////////////////////////////////////////////////////////

// Adapted from
// https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/smoke.rs

#[test]
fn smoke() {
    let mut heap = new_heap();
    unsafe {
        let p = heap.allocate(1).expect("should allocate one byte");
        p.as_ptr().write(9);
        assert_eq!(p.as_ptr().read(), 9);
        heap.free(p.as_ptr());

        let p = heap.allocate(1).expect("should allocate after free");
        p.as_ptr().write(10);
        assert_eq!(p.as_ptr().read(), 10);
        heap.free(p.as_ptr());
    }
}

#[test]
fn freed_block_is_reused_first_fit() {
    let mut heap = new_heap();
    let p1 = heap.allocate(100).expect("first allocation");
    let _p2 = heap.allocate(100).expect("second allocation");
    unsafe { heap.free(p1.as_ptr()) };
    let p3 = heap.allocate(100).expect("third allocation");
    assert_eq!(p1, p3, "the freed block should be handed back first-fit");
}

#[test]
fn reallocate_null_and_zero_are_alloc_and_free() {
    let mut heap = new_heap();
    unsafe {
        let p = heap
            .reallocate(std::ptr::null_mut(), 64)
            .expect("reallocate(null, n) should allocate");
        assert_eq!(heap.reallocate(p.as_ptr(), 0), None);
        heap.free(std::ptr::null_mut());
    }
    heap.check_heap().expect("heap invariants");
}

#[cfg(not(feature = "static_array_backend"))]
#[test]
fn heaps_do_not_interfere() {
    let mut h1 = new_heap();
    let mut h2 = new_heap();

    let p1 = h1.allocate(256).expect("h1 allocation");
    let p2 = h2.allocate(256).expect("h2 allocation");
    fill(p1, 256, 0x0f);
    fill(p2, 256, 0xf0);
    verify(p1, 256, 0x0f);
    verify(p2, 256, 0xf0);

    h1.check_heap().expect("h1 invariants");
    h2.check_heap().expect("h2 invariants");
}
