//! Random operation sequences against a model of the live allocations.

use std::ptr::NonNull;

use brkheap::{FixedBuffer, Heap, HeapConfig, HeapError, MemorySource, VirtualRegion, fragmentation_score};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Allocate(usize),
    ZeroAllocate(usize, usize),
    Reallocate(usize, usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..600).prop_map(Op::Allocate),
        1 => (1usize..16, 1usize..48).prop_map(|(count, size)| Op::ZeroAllocate(count, size)),
        3 => (any::<usize>(), 0usize..900).prop_map(|(pick, size)| Op::Reallocate(pick, size)),
        3 => any::<usize>().prop_map(Op::Release),
    ]
}

/// A live allocation: where it is, how much was asked for and the byte it
/// was filled with.
struct Live {
    ptr: NonNull<u8>,
    len: usize,
    fill: u8,
}

fn fill(live: &Live) {
    unsafe { live.ptr.as_ptr().write_bytes(live.fill, live.len) };
}

fn intact(live: &Live) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(live.ptr.as_ptr(), live.len) };
    bytes.iter().all(|b| *b == live.fill)
}

fn shape<S>(heap: &Heap<S>) -> Vec<(usize, bool)> {
    heap.blocks().map(|b| (b.size, b.in_use)).collect()
}

/// Runs `ops`, checking the heap after every step. Failed requests must leave
/// the heap untouched.
fn run<S: MemorySource>(heap: &mut Heap<S>, ops: &[Op]) -> Result<(), TestCaseError> {
    let alignment = heap.config().alignment;
    let mut live: Vec<Live> = Vec::new();
    let mut tag = 0u8;

    for op in ops {
        tag = tag.wrapping_add(1).max(1);
        let before = shape(heap);

        match *op {
            Op::Allocate(size) => match heap.try_allocate(size) {
                Ok(ptr) => {
                    let entry = Live { ptr, len: size, fill: tag };
                    fill(&entry);
                    live.push(entry);
                }
                Err(err) => {
                    let out_of_memory = matches!(err, HeapError::OutOfMemory { .. });
                    prop_assert!(out_of_memory, "unexpected error {:?}", err);
                    prop_assert_eq!(shape(heap), before);
                }
            },
            Op::ZeroAllocate(count, size) => match heap.zero_allocate(count, size) {
                Some(ptr) => {
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), count * size) };
                    prop_assert!(bytes.iter().all(|b| *b == 0));

                    let entry = Live { ptr, len: count * size, fill: tag };
                    fill(&entry);
                    live.push(entry);
                }
                None => prop_assert_eq!(shape(heap), before),
            },
            Op::Reallocate(_, _) | Op::Release(_) if live.is_empty() => {}
            Op::Reallocate(pick, size) => {
                let index = pick % live.len();
                let kept = live[index].len.min(size);

                match unsafe { heap.try_reallocate(live[index].ptr.as_ptr(), size) } {
                    Ok(Some(ptr)) => {
                        let old = live.swap_remove(index);
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), kept) };
                        prop_assert!(bytes.iter().all(|b| *b == old.fill));

                        let entry = Live { ptr, len: size, fill: tag };
                        fill(&entry);
                        live.push(entry);
                    }
                    Ok(None) => {
                        prop_assert_eq!(size, 0);
                        live.swap_remove(index);
                    }
                    Err(_) => {
                        prop_assert_eq!(shape(heap), before);
                        prop_assert!(intact(&live[index]));
                    }
                }
            }
            Op::Release(pick) => {
                let entry = live.swap_remove(pick % live.len());
                unsafe { heap.release(entry.ptr.as_ptr()) };
            }
        }

        prop_assert_eq!(heap.check_invariants(), Ok(()));

        for entry in &live {
            prop_assert_eq!(entry.ptr.as_ptr() as usize % alignment, 0);
            prop_assert!(heap.owns(entry.ptr.as_ptr()));
            let usable = unsafe { heap.usable_size(entry.ptr) };
            prop_assert!(usable >= entry.len);
            prop_assert!(intact(entry));
        }

        let stats = heap.stats();
        prop_assert_eq!(stats.used_blocks, live.len());
        prop_assert_eq!(
            stats.used_bytes + stats.free_bytes + stats.blocks * stats.header_size,
            stats.total_size
        );
        prop_assert!((0.0..1.0).contains(&stats.fragmentation));
    }

    for entry in live {
        unsafe { heap.release(entry.ptr.as_ptr()) };
    }

    let stats = heap.stats();
    prop_assert!(stats.blocks <= 1);
    prop_assert_eq!(stats.fragmentation, 0.0);

    Ok(())
}

proptest! {
    #[test]
    fn growing_heap_stays_consistent(ops in proptest::collection::vec(op(), 1..120)) {
        let config = HeapConfig::DEFAULT.with_initial_size(256);
        let mut heap = Heap::with_config(VirtualRegion::with_capacity(16 << 20), config).unwrap();

        run(&mut heap, &ops)?;
    }

    #[test]
    fn exhausted_heap_fails_cleanly(ops in proptest::collection::vec(op(), 1..120)) {
        let mut memory = vec![0u8; 4096];
        let config = HeapConfig::DEFAULT.with_initial_size(512);
        let mut heap = Heap::with_config(FixedBuffer::new(&mut memory), config).unwrap();

        run(&mut heap, &ops)?;
    }

    #[test]
    fn wide_alignment_is_honoured(ops in proptest::collection::vec(op(), 1..60)) {
        let config = HeapConfig::DEFAULT.with_initial_size(1024).with_alignment(32);
        let mut heap = Heap::with_config(VirtualRegion::with_capacity(16 << 20), config).unwrap();

        run(&mut heap, &ops)?;
    }

    #[test]
    fn alignment_wider_than_the_buffer_start(ops in proptest::collection::vec(op(), 1..60)) {
        #[repr(C, align(128))]
        struct Aligned([u8; 16384]);

        let mut memory = Box::new(Aligned([0; 16384]));
        let config = HeapConfig::DEFAULT.with_initial_size(1024).with_alignment(128);
        let mut heap = Heap::with_config(FixedBuffer::new(&mut memory.0[64..]), config).unwrap();

        run(&mut heap, &ops)?;
    }

    #[test]
    fn fragmentation_score_is_bounded(sizes in proptest::collection::vec(1usize..1 << 20, 1..64)) {
        let score = fragmentation_score(sizes.iter().copied());
        prop_assert!((0.0..1.0).contains(&score));

        let largest = *sizes.iter().max().unwrap();
        prop_assert_eq!(fragmentation_score([largest]), 0.0);
    }

    #[test]
    fn fragmentation_grows_with_equal_pieces(size in 1usize..1 << 20, k in 1usize..64) {
        let fewer = fragmentation_score(std::iter::repeat_n(size, k));
        let more = fragmentation_score(std::iter::repeat_n(size, k + 1));

        prop_assert!((fewer - (1.0 - 1.0 / k as f64)).abs() < 1e-9);
        prop_assert!(more > fewer);
    }
}
