//! Multi-threaded stress and semantics tests for the per-arena facade.
//!
//! Spawns multiple threads that concurrently allocate, release, and resize
//! from one shared `ArenaTlsf` and verifies per-thread fill-pattern
//! integrity, aggregate statistics, and heap consistency after joining.
use std::{mem::MaybeUninit, ptr::NonNull};

use tlsf_pool::ArenaTlsf;

const POOL_SIZE: usize = 4 * 1024 * 1024;
const NUM_THREADS: usize = 8;
const OPS_PER_THREAD: usize = 50_000;
const MAX_ALLOCS: usize = 128;
const MAX_ALLOC_SIZE: usize = 2048;

/// SplitMix64 sequence; good enough to decorrelate the threads' op
/// streams without pulling in an RNG crate.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

fn region(len: usize) -> Vec<MaybeUninit<u8>> {
    vec![MaybeUninit::uninit(); len]
}

#[test]
fn concurrent_stress() {
    let mut mem = region(POOL_SIZE);
    let arenas: ArenaTlsf = ArenaTlsf::new(&mut mem).unwrap();
    assert_eq!(arenas.arena_count(), 4);

    std::thread::scope(|scope| {
        for id in 0..NUM_THREADS {
            let arenas = &arenas;
            scope.spawn(move || {
                let pattern = id as u8 | 0x40;
                let mut rng = SplitMix64(id as u64 + 1);
                let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

                for _ in 0..OPS_PER_THREAD {
                    match rng.next() % 4 {
                        0 | 1 => {
                            if live.len() < MAX_ALLOCS {
                                let size = (rng.next() as usize % MAX_ALLOC_SIZE) + 1;
                                if let Some(ptr) = arenas.allocate(size) {
                                    unsafe {
                                        std::ptr::write_bytes(ptr.as_ptr(), pattern, size)
                                    };
                                    live.push((ptr, size));
                                }
                            }
                        }
                        2 => {
                            if !live.is_empty() {
                                let idx = rng.next() as usize % live.len();
                                let (ptr, size) = live.swap_remove(idx);
                                for i in 0..size {
                                    assert_eq!(
                                        unsafe { *ptr.as_ptr().add(i) },
                                        pattern,
                                        "thread {} fill pattern corrupted",
                                        id
                                    );
                                }
                                unsafe { arenas.deallocate(ptr) };
                            }
                        }
                        _ => {
                            if !live.is_empty() {
                                let idx = rng.next() as usize % live.len();
                                let (ptr, old_size) = live[idx];
                                let new_size = (rng.next() as usize % MAX_ALLOC_SIZE) + 1;
                                if let Some(new_ptr) =
                                    unsafe { arenas.reallocate(ptr, new_size) }
                                {
                                    let preserved = old_size.min(new_size);
                                    for i in 0..preserved {
                                        assert_eq!(
                                            unsafe { *new_ptr.as_ptr().add(i) },
                                            pattern,
                                            "thread {} resize lost data",
                                            id
                                        );
                                    }
                                    unsafe {
                                        std::ptr::write_bytes(
                                            new_ptr.as_ptr(),
                                            pattern,
                                            new_size,
                                        )
                                    };
                                    live[idx] = (new_ptr, new_size);
                                }
                            }
                        }
                    }
                }

                for (ptr, size) in live {
                    for i in 0..size {
                        assert_eq!(unsafe { *ptr.as_ptr().add(i) }, pattern);
                    }
                    unsafe { arenas.deallocate(ptr) };
                }
            });
        }
    });

    let stats = arenas.stats();
    assert_eq!(stats.total_used, 0, "leaked allocations after join");
    assert_eq!(stats.free_count, arenas.arena_count());
    arenas.check();
}

#[test]
fn basic_semantics() {
    let mut mem = region(1 << 20);
    let arenas: ArenaTlsf = ArenaTlsf::new(&mut mem).unwrap();

    // Zero-size allocations are unique.
    let p = arenas.allocate(0).unwrap();
    let q = arenas.allocate(0).unwrap();
    assert_ne!(p, q);
    unsafe {
        arenas.deallocate(p);
        arenas.deallocate(q);
    }

    // Resize preserves contents, in or across arenas.
    let p = arenas.allocate(100).unwrap();
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xbb, 100) };
    let q = unsafe { arenas.reallocate(p, 50) }.unwrap();
    for i in 0..50 {
        assert_eq!(unsafe { *q.as_ptr().add(i) }, 0xbb);
    }

    // Zero new size releases.
    assert!(unsafe { arenas.reallocate(q, 0) }.is_none());

    // Unknown pointers are ignored by release.
    let mut outside = 0u8;
    unsafe { arenas.deallocate(NonNull::new(&mut outside).unwrap()) };

    // usable_size covers the request.
    let p = arenas.allocate(100).unwrap();
    assert!(unsafe { arenas.usable_size(p) } >= 100);
    unsafe { arenas.deallocate(p) };

    // Aligned allocation through the facade.
    let p = arenas.allocate_aligned(512, 300).unwrap();
    assert_eq!(p.as_ptr() as usize % 512, 0);
    unsafe { arenas.deallocate(p) };

    let stats = arenas.stats();
    assert_eq!(stats.total_used, 0);
    arenas.check();
}

#[test]
fn reset_invalidates_and_restores() {
    let mut mem = region(1 << 18);
    let mut arenas: ArenaTlsf = ArenaTlsf::new(&mut mem).unwrap();

    for _ in 0..32 {
        arenas.allocate(256).unwrap();
    }
    assert!(arenas.stats().total_used > 0);

    arenas.reset();
    let stats = arenas.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, arenas.arena_count());
    arenas.check();

    // The facade is fully usable again.
    let p = arenas.allocate(1000).unwrap();
    unsafe { arenas.deallocate(p) };
    assert_eq!(arenas.stats().total_used, 0);
}
