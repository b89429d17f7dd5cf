//! Heap introspection: statistics aggregation and the full consistency
//! check. Both walk the physical block chain, so they are O(blocks) and
//! intended for diagnostics, not the hot path.
use core::ptr::NonNull;

use super::{
    map, BlockHdr, FreeBlockHdr, PoolSource, Tlsf, ALIGN_SIZE, BLOCK_OVERHEAD, BLOCK_SIZE_MAX,
    BLOCK_SIZE_MIN, FL_COUNT, SL_COUNT,
};
use crate::int::BinInteger;

/// A snapshot of pool occupancy, filled by [`Tlsf::stats`].
///
/// `total_free` and `total_used` count payload bytes; `overhead` counts
/// metadata bytes (one header per block plus the sentinel). `free_count`
/// is a fragmentation indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_free: usize,
    pub largest_free: usize,
    pub total_used: usize,
    pub block_count: usize,
    pub free_count: usize,
    pub overhead: usize,
}

impl PoolStats {
    /// Fold another pool's statistics into this one. `largest_free` keeps
    /// the single largest block across both.
    pub fn merge(&mut self, other: &PoolStats) {
        self.total_free += other.total_free;
        self.total_used += other.total_used;
        self.block_count += other.block_count;
        self.free_count += other.free_count;
        self.overhead += other.overhead;
        self.largest_free = self.largest_free.max(other.largest_free);
    }
}

impl<S: PoolSource> Tlsf<'_, S> {
    /// Collect heap statistics by walking every block from the pool start
    /// to the sentinel.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();

        let base = match self.base {
            Some(base) => base,
            None => return stats,
        };

        // Safety: `base`/`size` describe a live pool; the physical chain is
        //         terminated by the zero-size sentinel.
        unsafe {
            let mut block: NonNull<BlockHdr> = base.cast();
            while block.as_ref().size() != 0 {
                let bsize = block.as_ref().size();
                stats.block_count += 1;
                stats.overhead += BLOCK_OVERHEAD;

                if block.as_ref().is_free() {
                    stats.free_count += 1;
                    stats.total_free += bsize;
                    stats.largest_free = stats.largest_free.max(bsize);
                } else {
                    stats.total_used += bsize;
                }

                block = block.as_ref().next_phys();
            }
        }

        // Sentinel header.
        stats.overhead += BLOCK_OVERHEAD;
        stats
    }

    /// Comprehensive heap consistency check; panics with a message naming
    /// the violated invariant.
    ///
    /// Three phases:
    /// 1. physical walk — size, alignment, boundary-tag, and coalescing
    ///    invariants for every block, and the sizes sum to the pool size;
    /// 2. free-list walk — bitmap/bin consistency, bin membership, list
    ///    threading, with Floyd's tortoise-and-hare catching cycles and
    ///    duplicates in O(1) space;
    /// 3. cross-check — both walks agree on the number of free blocks.
    pub fn check(&self) {
        // An empty pool is valid.
        let base = match self.base {
            Some(base) => base,
            None => {
                assert!(self.size == 0, "pool has size but no base");
                return;
            }
        };
        assert!(
            base.as_ptr() as usize % ALIGN_SIZE == 0,
            "pool base not aligned"
        );

        // Safety: same as in `stats`; additionally the free lists only
        //         contain blocks owned by this pool.
        unsafe {
            // Phase 1: walk the physical chain.
            let mut block: NonNull<BlockHdr> = base.cast();
            let mut prev_block: Option<NonNull<BlockHdr>> = None;
            let mut prev_was_free = false;
            let mut walk_free_count = 0usize;
            let mut total_size = 0usize;

            while block.as_ref().size() != 0 {
                let bsize = block.as_ref().size();

                assert!(bsize >= BLOCK_SIZE_MIN, "block smaller than minimum size");
                assert!(bsize <= BLOCK_SIZE_MAX, "block exceeds maximum size");
                assert!(bsize % ALIGN_SIZE == 0, "block size not aligned");
                assert!(
                    block.as_ptr() as usize % ALIGN_SIZE == 0,
                    "block pointer not aligned"
                );

                if prev_block.is_some() {
                    assert!(
                        block.as_ref().is_prev_free() == prev_was_free,
                        "prev_free bit mismatch with actual previous block state"
                    );
                    if prev_was_free {
                        assert!(
                            block.as_ref().prev_phys() == prev_block.unwrap(),
                            "boundary tag doesn't match previous block"
                        );
                    }
                }

                if block.as_ref().is_free() {
                    walk_free_count += 1;
                    assert!(!prev_was_free, "consecutive free blocks (coalescing failed)");
                    prev_was_free = true;
                } else {
                    prev_was_free = false;
                }

                total_size += bsize + BLOCK_OVERHEAD;
                prev_block = Some(block);
                block = block.as_ref().next_phys();
            }

            // Sentinel validation.
            assert!(!block.as_ref().is_free(), "sentinel marked as free");
            assert!(
                block.as_ref().is_prev_free() == prev_was_free,
                "sentinel prev_free bit mismatch"
            );
            if prev_was_free {
                assert!(
                    block.as_ref().prev_phys() == prev_block.unwrap(),
                    "sentinel boundary tag incorrect"
                );
            }

            total_size += BLOCK_OVERHEAD;
            assert!(
                total_size == self.size,
                "block sizes don't sum to pool size"
            );

            // Phase 2: walk the free lists and validate the bitmaps.
            let mut list_free_count = 0usize;

            for i in 0..FL_COUNT {
                let fl_bit = self.fl_bitmap.get_bit(i as u32);
                let sl_map = self.sl_bitmap[i];

                if !fl_bit {
                    assert!(sl_map == 0, "SL bitmap non-zero but FL bit is clear");
                    for j in 0..SL_COUNT {
                        assert!(
                            self.first_free[i][j].is_none(),
                            "bin head not empty but FL bit is clear"
                        );
                    }
                    continue;
                }

                assert!(sl_map != 0, "FL bit set but SL bitmap is empty");

                for j in 0..SL_COUNT {
                    let head = self.first_free[i][j];

                    if !sl_map.get_bit(j as u32) {
                        assert!(head.is_none(), "bin head not empty but SL bit is clear");
                        continue;
                    }
                    assert!(head.is_some(), "SL bit set but bin is empty");

                    // A fast pointer advances two steps per iteration; a
                    // duplicate block forms a cycle, making the pointers
                    // collide within one lap.
                    let mut list_prev: Option<NonNull<FreeBlockHdr>> = None;
                    let mut cursor = head;
                    let mut fast = head;
                    while let Some(node) = cursor {
                        list_free_count += 1;
                        let hdr = node.cast::<BlockHdr>();

                        assert!(hdr.as_ref().is_free(), "block in free list not free");

                        let (fl, sl) = map::mapping(hdr.as_ref().size());
                        assert!(
                            fl as usize == i && sl as usize == j,
                            "block in wrong FL/SL bin"
                        );
                        assert!(
                            hdr.as_ref().size() >= BLOCK_SIZE_MIN,
                            "free block below minimum size"
                        );
                        assert!(
                            !hdr.as_ref().is_prev_free(),
                            "free block has free predecessor (coalescing violated)"
                        );

                        let next_phys = hdr.as_ref().next_phys();
                        assert!(
                            !next_phys.as_ref().is_free(),
                            "free block has free successor (coalescing violated)"
                        );
                        assert!(
                            next_phys.as_ref().is_prev_free(),
                            "next block doesn't know this block is free"
                        );

                        assert!(
                            node.as_ref().prev_free == list_prev,
                            "free list prev pointer incorrect"
                        );
                        if let Some(list_prev) = list_prev {
                            assert!(
                                list_prev.as_ref().next_free == Some(node),
                                "free list next pointer incorrect"
                            );
                        }

                        list_prev = Some(node);
                        cursor = node.as_ref().next_free;

                        for _ in 0..2 {
                            if let Some(f) = fast {
                                fast = f.as_ref().next_free;
                            }
                        }
                        assert!(
                            cursor.is_none() || cursor != fast,
                            "cycle in free list (duplicate block / double free?)"
                        );
                    }
                }
            }

            // Phase 3: cross-validation.
            assert!(
                walk_free_count == list_free_count,
                "free block count mismatch between block walk and free list walk"
            );
        }
    }
}
