extern crate std;

use quickcheck_macros::quickcheck;
use std::{mem::MaybeUninit, prelude::v1::*, ptr::NonNull, vec};

use super::*;
use crate::tests::ShadowHeap;

#[repr(align(64))]
struct Align<T>(T);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fixed pool over a heap buffer; the handle aligns the region itself.
macro_rules! fixed_pool {
    ($tlsf:ident, $pool:ident, $len:expr) => {
        let mut $pool = vec![MaybeUninit::<u8>::uninit(); $len];
        let mut $tlsf: Tlsf = Tlsf::INIT;
        let usable = $tlsf.pool_init(&mut $pool);
        assert!(usable > 0);
    };
}

#[test]
fn minimal() {
    init_logger();
    fixed_pool!(tlsf, pool, 65536);

    log::trace!("tlsf = {:?}", tlsf);

    let ptr = tlsf.allocate(1).unwrap();
    log::trace!("ptr = {:?}", ptr);
    assert_eq!(ptr.as_ptr() as usize % ALIGN_SIZE, 0);
    unsafe { tlsf.deallocate(ptr) };
    tlsf.check();
}

#[test]
fn zero_size_allocations_are_unique() {
    init_logger();
    fixed_pool!(tlsf, pool, 4096);

    let ptr1 = tlsf.allocate(0).unwrap();
    let ptr2 = tlsf.allocate(0).unwrap();
    assert_ne!(ptr1, ptr2);
    assert!(unsafe { usable_size(ptr1) } >= BLOCK_SIZE_MIN);

    unsafe {
        tlsf.deallocate(ptr1);
        tlsf.deallocate(ptr2);
    }
    tlsf.check();
}

#[test]
fn pool_init_rejects_too_small_regions() {
    for len in 0..(2 * BLOCK_OVERHEAD + BLOCK_SIZE_MIN) {
        let mut pool = vec![MaybeUninit::<u8>::uninit(); len];
        let mut tlsf: Tlsf = Tlsf::INIT;
        assert_eq!(tlsf.pool_init(&mut pool), 0, "len = {}", len);
        assert!(tlsf.allocate(1).is_none());
    }
}

#[test]
fn pool_init_handles_unaligned_regions() {
    let mut pool = Align([MaybeUninit::<u8>::uninit(); 4096]);
    let mut tlsf: Tlsf = Tlsf::INIT;
    let usable = tlsf.pool_init(&mut pool.0[3..]);
    assert!(usable > 0);
    assert!(usable <= 4093);

    let ptr = tlsf.allocate(17).unwrap();
    assert_eq!(ptr.as_ptr() as usize % ALIGN_SIZE, 0);
    unsafe { tlsf.deallocate(ptr) };
    tlsf.check();
}

#[test]
fn oversized_requests_fail() {
    init_logger();
    fixed_pool!(tlsf, pool, 4096);

    assert!(tlsf.allocate(MAX_ALLOC_SIZE + 1).is_none());
    // Values near usize::MAX must not wrap through the size adjustment and
    // slip past the bounds test.
    for offset in 0..8 {
        assert!(tlsf.allocate(usize::MAX - offset).is_none());
    }
    tlsf.check();
}

#[test]
fn aligned_allocation() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 17);

    for shift in 4..12 {
        let align = 1 << shift;
        let ptr = tlsf.allocate_aligned(align, 100).unwrap();
        assert_eq!(
            ptr.as_ptr() as usize % align,
            0,
            "{:p} is not {}-byte aligned",
            ptr.as_ptr(),
            align
        );
        assert!(unsafe { usable_size(ptr) } >= 100);
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x6b, 100) };
        unsafe { tlsf.deallocate(ptr) };
        tlsf.check();
    }

    // Released blocks all coalesce back into one.
    let stats = tlsf.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, 1);
}

#[test]
fn aligned_allocation_rejects_bad_alignments() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    assert!(tlsf.allocate_aligned(0, 16).is_none());
    assert!(tlsf.allocate_aligned(24, 16).is_none());
    // Alignment equal to the whole pool size cannot be satisfied.
    assert!(tlsf.allocate_aligned(1 << 16, 16).is_none());
    tlsf.check();

    // Zero-size aligned requests still return a valid aligned pointer.
    let ptr = tlsf.allocate_aligned(128, 0).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 128, 0);
    unsafe { tlsf.deallocate(ptr) };
}

/// The search for a small request in a pool whose only free block is the
/// whole pool ends after consulting at most two bitmap words; observably,
/// it succeeds, splits once, and charges only the request's size class.
#[test]
fn small_allocation_from_whole_pool() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 20);

    let before = tlsf.stats();
    assert_eq!(before.free_count, 1);

    let ptr = tlsf.allocate(40).unwrap();
    let stats = tlsf.stats();
    assert_eq!(unsafe { usable_size(ptr) }, 40);
    assert_eq!(stats.block_count, 2);
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.total_used, 40);

    unsafe { tlsf.deallocate(ptr) };
    assert_eq!(tlsf.stats(), before);
}

/// Release order a, c, b: the final release merges both neighbors and
/// performs a single insertion, leaving one coalesced block.
#[test]
fn release_merges_both_neighbors() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(128).unwrap();
    let b = tlsf.allocate(128).unwrap();
    let c = tlsf.allocate(128).unwrap();
    let guard = tlsf.allocate(128).unwrap();

    unsafe { tlsf.deallocate(a) };
    assert_eq!(tlsf.stats().free_count, 2);
    unsafe { tlsf.deallocate(c) };
    assert_eq!(tlsf.stats().free_count, 3);
    unsafe { tlsf.deallocate(b) };
    let stats = tlsf.stats();
    assert_eq!(stats.free_count, 2);
    assert_eq!(stats.total_used, 128);
    tlsf.check();

    unsafe { tlsf.deallocate(guard) };
    let stats = tlsf.stats();
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.total_used, 0);
}

/// Internal fragmentation stays within the second-level subdivision bound:
/// with 32 bins per class the worst case is ~3.125%, and alignment padding
/// keeps observed overhead under 5% (mean under 3%).
#[test]
fn fragmentation_bound() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 20);

    let sizes = [257usize, 513, 1000, 4000, 30000, 100000];
    let mut total_pct = 0.0f64;
    let mut max_pct = 0.0f64;

    for &size in &sizes {
        let before = tlsf.stats();
        let ptr = tlsf.allocate(size).unwrap();
        let after = tlsf.stats();
        let actual = after.total_used - before.total_used;
        assert!(actual >= size);
        let pct = 100.0 * (actual - size) as f64 / size as f64;
        log::trace!("size {} -> {} ({:.2}%)", size, actual, pct);
        total_pct += pct;
        max_pct = max_pct.max(pct);
        unsafe { tlsf.deallocate(ptr) };
    }

    assert!(max_pct < 5.0, "max overhead {:.2}% exceeds 5%", max_pct);
    let avg = total_pct / sizes.len() as f64;
    assert!(avg < 3.0, "mean overhead {:.2}% exceeds 3%", avg);
    tlsf.check();
}

/// Growing into a released predecessor moves the payload backward instead
/// of relocating: the returned pointer is the predecessor's old address.
#[test]
fn reallocate_expands_backward() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(512).unwrap();
    let b = tlsf.allocate(256).unwrap();
    let c = tlsf.allocate(128).unwrap();

    unsafe { core::ptr::write_bytes(b.as_ptr(), 0xab, 256) };
    unsafe { tlsf.deallocate(a) };
    tlsf.check();

    let new_b = unsafe { tlsf.reallocate(b, 768) }.unwrap();
    tlsf.check();

    assert_eq!(new_b, a, "backward expansion should reuse a's address");
    for i in 0..256 {
        assert_eq!(unsafe { *new_b.as_ptr().add(i) }, 0xab);
    }

    unsafe {
        tlsf.deallocate(new_b);
        tlsf.deallocate(c);
    }
    tlsf.check();
}

/// Growing over both a released predecessor and successor combines all
/// three regions in place.
#[test]
fn reallocate_expands_combined() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(512).unwrap();
    let b = tlsf.allocate(256).unwrap();
    let c = tlsf.allocate(512).unwrap();
    let d = tlsf.allocate(128).unwrap();

    unsafe { core::ptr::write_bytes(b.as_ptr(), 0xcd, 256) };
    unsafe {
        tlsf.deallocate(a);
        tlsf.deallocate(c);
    }
    tlsf.check();

    let new_b = unsafe { tlsf.reallocate(b, 1216) }.unwrap();
    tlsf.check();

    assert_eq!(new_b, a);
    for i in 0..256 {
        assert_eq!(unsafe { *new_b.as_ptr().add(i) }, 0xcd);
    }

    unsafe {
        tlsf.deallocate(new_b);
        tlsf.deallocate(d);
    }
    let stats = tlsf.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, 1);
}

/// Forward expansion needs no data movement, so it wins over backward
/// expansion when the successor alone suffices.
#[test]
fn reallocate_prefers_forward_expansion() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(256).unwrap();
    let b = tlsf.allocate(256).unwrap();
    let c = tlsf.allocate(512).unwrap();
    let d = tlsf.allocate(128).unwrap();

    unsafe { core::ptr::write_bytes(b.as_ptr(), 0xef, 256) };
    unsafe {
        tlsf.deallocate(a);
        tlsf.deallocate(c);
    }
    tlsf.check();

    let new_b = unsafe { tlsf.reallocate(b, 256 + 512 - 64) }.unwrap();
    tlsf.check();

    assert_eq!(new_b, b, "forward expansion should keep b's address");
    for i in 0..256 {
        assert_eq!(unsafe { *new_b.as_ptr().add(i) }, 0xef);
    }

    unsafe {
        tlsf.deallocate(new_b);
        tlsf.deallocate(d);
    }
    tlsf.check();
}

#[test]
fn reallocate_shrink_then_grow_backward() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(1024).unwrap();
    let b = tlsf.allocate(512).unwrap();

    unsafe { core::ptr::write_bytes(b.as_ptr(), 0x77, 512) };
    unsafe { tlsf.deallocate(a) };
    tlsf.check();

    let shrunk = unsafe { tlsf.reallocate(b, 128) }.unwrap();
    assert_eq!(shrunk, b, "shrink happens in place");
    for i in 0..128 {
        assert_eq!(unsafe { *shrunk.as_ptr().add(i) }, 0x77);
    }

    let grown = unsafe { tlsf.reallocate(shrunk, 1024 + 128) }.unwrap();
    tlsf.check();
    assert_eq!(grown, a, "growth should expand backward into a's space");
    for i in 0..128 {
        assert_eq!(unsafe { *grown.as_ptr().add(i) }, 0x77);
    }

    unsafe { tlsf.deallocate(grown) };
    let stats = tlsf.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, 1);
}

#[test]
fn reallocate_zero_size_releases() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 14);

    let baseline = tlsf.stats();
    let ptr = tlsf.allocate(100).unwrap();
    assert!(unsafe { tlsf.reallocate(ptr, 0) }.is_none());
    assert_eq!(tlsf.stats(), baseline);
    tlsf.check();
}

#[test]
fn reallocate_relocates_when_neighbors_are_used() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let a = tlsf.allocate(128).unwrap();
    let b = tlsf.allocate(128).unwrap();
    unsafe { core::ptr::write_bytes(a.as_ptr(), 0x42, 128) };

    // a sits at the pool head with b right behind it; growing it must
    // relocate.
    let grown = unsafe { tlsf.reallocate(a, 4096) }.unwrap();
    assert_ne!(grown, a);
    for i in 0..128 {
        assert_eq!(unsafe { *grown.as_ptr().add(i) }, 0x42);
    }

    unsafe {
        tlsf.deallocate(grown);
        tlsf.deallocate(b);
    }
    let stats = tlsf.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, 1);
    tlsf.check();
}

#[test]
fn append_adjacent_extends_the_pool() {
    init_logger();
    let mut buf = Align([MaybeUninit::<u8>::uninit(); 8192]);
    let (first, rest) = buf.0.split_at_mut(4096);

    let mut tlsf: Tlsf = Tlsf::INIT;
    assert!(tlsf.pool_init(first) > 0);

    // Larger than the first half alone can serve.
    assert!(tlsf.allocate(5000).is_none());

    let used = unsafe {
        tlsf.pool_append(NonNull::new(rest as *mut [MaybeUninit<u8>] as *mut [u8]).unwrap())
    };
    assert!(used > 0);
    tlsf.check();

    let ptr = tlsf.allocate(5000).unwrap();
    unsafe { tlsf.deallocate(ptr) };
    let stats = tlsf.stats();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.free_count, 1);
}

#[test]
fn append_non_adjacent_is_rejected() {
    init_logger();
    let mut buf = Align([MaybeUninit::<u8>::uninit(); 8192]);
    let (first, rest) = buf.0.split_at_mut(4096);

    let mut tlsf: Tlsf = Tlsf::INIT;
    assert!(tlsf.pool_init(first) > 0);
    let baseline = tlsf.stats();

    // One byte short of adjacency must be rejected without mutating the
    // pool.
    let gap = &mut rest[1..];
    let used =
        unsafe { tlsf.pool_append(NonNull::new(gap as *mut [MaybeUninit<u8>] as *mut [u8]).unwrap()) };
    assert_eq!(used, 0);
    assert_eq!(tlsf.stats(), baseline);
    tlsf.check();
}

#[test]
fn reset_replays_identical_traces() {
    fn trace(tlsf: &mut Tlsf<'_>, base: usize) -> Vec<usize> {
        let sizes = [24usize, 100, 4000, 57, 8, 1024];
        let mut ptrs: Vec<NonNull<u8>> = Vec::new();
        let mut offsets = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let ptr = tlsf.allocate(size).unwrap();
            offsets.push(ptr.as_ptr() as usize - base);
            ptrs.push(ptr);
            if i % 3 == 2 {
                let victim = ptrs.remove(i / 3);
                unsafe { tlsf.deallocate(victim) };
            }
        }
        offsets
    }

    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);
    let base = tlsf.pool_base().unwrap().as_ptr() as usize;

    let first = trace(&mut tlsf, base);
    tlsf.pool_reset();
    tlsf.check();
    let second = trace(&mut tlsf, base);
    assert_eq!(first, second);
}

#[test]
fn statistics_return_to_baseline() {
    init_logger();
    fixed_pool!(tlsf, pool, 1 << 16);

    let baseline = tlsf.stats();
    assert_eq!(baseline.total_used, 0);
    assert_eq!(baseline.free_count, 1);
    assert_eq!(baseline.block_count, 1);

    let mut ptrs = Vec::new();
    for size in [16usize, 200, 3000, 40, 0, 900] {
        ptrs.push(tlsf.allocate(size).unwrap());
    }
    assert!(tlsf.stats().total_used > 0);

    for ptr in ptrs {
        unsafe { tlsf.deallocate(ptr) };
    }
    assert_eq!(tlsf.stats(), baseline);
    tlsf.check();
}

#[test]
fn growable_pool_grows_and_shrinks() {
    init_logger();
    let source = crate::source::HeapSource::with_capacity(1 << 20).unwrap();
    let mut tlsf = Tlsf::with_source(source);
    assert_eq!(tlsf.pool_size(), 0);

    let ptr = tlsf.allocate(1000).unwrap();
    assert!(tlsf.pool_size() > 0);
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x11, 1000) };
    tlsf.check();

    let ptr2 = tlsf.allocate(5000).unwrap();
    tlsf.check();
    for i in 0..1000 {
        assert_eq!(unsafe { *ptr.as_ptr().add(i) }, 0x11);
    }

    // Releasing the tail gives storage back; releasing everything empties
    // the pool entirely.
    unsafe { tlsf.deallocate(ptr2) };
    tlsf.check();
    unsafe { tlsf.deallocate(ptr) };
    assert_eq!(tlsf.pool_size(), 0);

    // The pool regrows on demand.
    let ptr = tlsf.allocate(64).unwrap();
    unsafe { tlsf.deallocate(ptr) };
    assert_eq!(tlsf.pool_size(), 0);
}

#[test]
fn growable_pool_reallocate() {
    init_logger();
    let source = crate::source::HeapSource::with_capacity(1 << 20).unwrap();
    let mut tlsf = Tlsf::with_source(source);

    let mut ptr = tlsf.allocate(100).unwrap();
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x3c, 100) };

    for new_size in [500usize, 120, 9000, 32] {
        ptr = unsafe { tlsf.reallocate(ptr, new_size) }.unwrap();
        tlsf.check();
        for i in 0..32 {
            assert_eq!(unsafe { *ptr.as_ptr().add(i) }, 0x3c);
        }
    }

    assert!(unsafe { tlsf.reallocate(ptr, 0) }.is_none());
    assert_eq!(tlsf.pool_size(), 0);
}

#[test]
fn growable_pool_without_source_fails() {
    init_logger();
    let mut tlsf: Tlsf = Tlsf::with_source(());
    assert!(tlsf.allocate(1).is_none());
    assert_eq!(tlsf.pool_size(), 0);
}

#[quickcheck]
fn map_roundtrip(size: usize) {
    let size = size % (BLOCK_SIZE_MAX / 2);
    let size = align_up(size.max(BLOCK_SIZE_MIN), ALIGN_SIZE);

    let rounded = map::round_block_size(size);
    assert!(rounded >= size);
    // Rounding never overshoots by more than one second-level step.
    assert!(rounded - size <= (size >> SL_SHIFT).max(ALIGN_SIZE));
    assert_eq!(rounded % ALIGN_SIZE, 0);

    // The rounded size is exactly the floor of its own bin, which is what
    // makes the effective-size recording sound.
    let (fl, sl) = map::mapping(rounded);
    assert_eq!(map::mapping_size(fl, sl), rounded);

    // And every size in between maps to a bin at or below the rounded one.
    let (fl0, sl0) = map::mapping(size);
    assert!(fl0 < fl || (fl0 == fl && sl0 <= sl));
}

#[quickcheck]
fn bin_floor_maps_to_its_bin(fl: u32, sl: u32) {
    let fl = fl % FL_COUNT as u32;
    let sl = sl % SL_COUNT as u32;
    let size = map::mapping_size(fl, sl);
    if size < BLOCK_SIZE_MIN {
        return;
    }
    assert_eq!(map::mapping(size), (fl, sl));
}

#[quickcheck]
fn random(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) {
    random_inner(pool_start, pool_size, bytecode);
}

fn random_inner(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) -> Option<()> {
    init_logger();

    let mut pool = Align([MaybeUninit::<u8>::uninit(); 65536]);
    let pool_start = pool_start % 64;
    let pool_size = pool_size % (pool.0.len() - 63);
    let pool = &mut pool.0[pool_start..pool_start + pool_size];
    log::trace!("pool = {:p}: [u8; {}]", pool, pool.len());

    let mut tlsf: Tlsf = Tlsf::INIT;
    let usable = tlsf.pool_init(pool);
    if usable == 0 {
        return None;
    }
    let base = tlsf.pool_base().unwrap().as_ptr() as usize;
    let mut sa = ShadowHeap::new(base, tlsf.pool_size());

    #[derive(Debug)]
    struct Alloc {
        ptr: NonNull<u8>,
        size: usize,
        tag: u8,
    }
    let mut allocs: Vec<Alloc> = Vec::new();
    let mut next_tag = 1u8;

    let mut it = bytecode.iter().cloned();
    loop {
        match it.next()? % 8 {
            0..=2 => {
                let len = u32::from_le_bytes([it.next()?, it.next()?, it.next()?, 0]);
                let len = ((len as u64 * pool_size as u64) >> 24) as usize;
                let align = 1usize << (it.next()? % 8);
                log::trace!("alloc size {} align {}", len, align);

                let ptr = if align <= ALIGN_SIZE {
                    tlsf.allocate(len)
                } else {
                    tlsf.allocate_aligned(align, len)
                };
                log::trace!(" → {:?}", ptr);

                if let Some(ptr) = ptr {
                    assert!(unsafe { usable_size(ptr) } >= len);
                    let tag = next_tag;
                    next_tag = next_tag.wrapping_add(1).max(1);
                    unsafe { core::ptr::write_bytes(ptr.as_ptr(), tag, len) };
                    sa.mark_used(ptr, len, align.max(ALIGN_SIZE));
                    allocs.push(Alloc { ptr, size: len, tag });
                }
            }
            3..=5 => {
                let alloc_i = it.next()?;
                if !allocs.is_empty() {
                    let alloc = allocs.swap_remove(alloc_i as usize % allocs.len());
                    log::trace!("dealloc {:?}", alloc);

                    for i in 0..alloc.size {
                        assert_eq!(
                            unsafe { *alloc.ptr.as_ptr().add(i) },
                            alloc.tag,
                            "payload corrupted"
                        );
                    }
                    unsafe { tlsf.deallocate(alloc.ptr) };
                    sa.mark_free(alloc.ptr, alloc.size);
                }
            }
            6..=7 => {
                let alloc_i = it.next()?;
                if !allocs.is_empty() {
                    let len = u32::from_le_bytes([it.next()?, it.next()?, it.next()?, 0]);
                    let len = ((len as u64 * pool_size as u64) >> 24) as usize;

                    let alloc_i = alloc_i as usize % allocs.len();
                    let alloc = &mut allocs[alloc_i];
                    log::trace!("realloc {:?} to {}", alloc, len);

                    if len == 0 {
                        let alloc = allocs.swap_remove(alloc_i);
                        assert!(unsafe { tlsf.reallocate(alloc.ptr, 0) }.is_none());
                        sa.mark_free(alloc.ptr, alloc.size);
                    } else if let Some(ptr) = unsafe { tlsf.reallocate(alloc.ptr, len) } {
                        log::trace!(" {:?} → {:?}", alloc.ptr, ptr);
                        let preserved = alloc.size.min(len);
                        for i in 0..preserved {
                            assert_eq!(
                                unsafe { *ptr.as_ptr().add(i) },
                                alloc.tag,
                                "payload lost in resize"
                            );
                        }
                        sa.mark_free(alloc.ptr, alloc.size);
                        alloc.ptr = ptr;
                        alloc.size = len;
                        unsafe { core::ptr::write_bytes(ptr.as_ptr(), alloc.tag, len) };
                        sa.mark_used(ptr, len, ALIGN_SIZE);
                    } else {
                        log::trace!(" {:?} → fail", alloc.ptr);
                    }
                }
            }
            _ => unreachable!(),
        }
        tlsf.check();
        // The allocator's used accounting must cover every byte the mirror
        // believes is live.
        assert!(tlsf.stats().total_used >= sa.used_bytes());
    }
}
