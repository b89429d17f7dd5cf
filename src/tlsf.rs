//! The TLSF allocator core: bitmap index, block metadata, allocation and
//! release paths, and the pool life cycle.
use core::{
    fmt,
    hint::unreachable_unchecked,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::NonNull,
};

use crate::{
    int::BinInteger,
    source::PoolSource,
    utils::{align_ptr, align_up, nonnull_slice_end},
};

mod inspect;
pub(crate) mod map;
pub use self::inspect::PoolStats;

/// log2 of the allocation alignment: 8-byte alignment on 64-bit targets,
/// 4-byte on 32-bit.
pub(crate) const ALIGN_SHIFT: u32 = if usize::BITS == 64 { 3 } else { 2 };

/// The allocation granularity. Every payload address and every block size is
/// a multiple of this.
pub const ALIGN_SIZE: usize = 1 << ALIGN_SHIFT;

/// log2 of the second-level bin count per first-level row.
pub(crate) const SL_SHIFT: u32 = 5;

/// Second-level subdivisions: 32 bins per first-level size class. Worst-case
/// internal fragmentation is bounded by `1 / SL_COUNT` = 3.125%.
pub const SL_COUNT: usize = 1 << SL_SHIFT;

/// Sizes below `1 << FL_SHIFT` map linearly into the first row of bins.
pub(crate) const FL_SHIFT: u32 = SL_SHIFT + ALIGN_SHIFT;

/// log2 of the maximum pool size. A pool (including block headers and the
/// trailing sentinel) never exceeds `1 << FL_MAX` bytes.
pub const FL_MAX: u32 = if usize::BITS == 64 { 39 } else { 31 };

/// Number of first-level rows in the bitmap index.
pub const FL_COUNT: usize = (FL_MAX - FL_SHIFT + 1) as usize;

/// Per-block metadata: one machine word holding the packed size-and-status
/// header.
pub const BLOCK_OVERHEAD: usize = mem::size_of::<usize>();

pub(crate) const BLOCK_SIZE_MIN: usize = mem::size_of::<FreeBlockHdr>();
pub(crate) const BLOCK_SIZE_MAX: usize = 1 << (FL_MAX - 1);
pub(crate) const BLOCK_SIZE_SMALL: usize = 1 << FL_SHIFT;

/// The largest request [`Tlsf::allocate`] can satisfy.
pub const MAX_ALLOC_SIZE: usize = BLOCK_SIZE_MAX - BLOCK_OVERHEAD;

/// Minimum remainder size for trimming. Raising this above `BLOCK_SIZE_MIN`
/// avoids creating tiny free blocks whose metadata overhead is large relative
/// to their usable payload.
pub(crate) const SPLIT_THRESHOLD: usize = BLOCK_SIZE_MIN;

/// The bit of [`BlockHdr::header`] indicating the block is on a free list.
pub(crate) const FREE_BIT: usize = 1;
/// The bit of [`BlockHdr::header`] indicating the physically preceding block
/// is free. When set, the boundary tag below this block's header is valid.
pub(crate) const PREV_FREE_BIT: usize = 2;
pub(crate) const BLOCK_BITS: usize = FREE_BIT | PREV_FREE_BIT;

const _: () = assert!(ALIGN_SIZE == BLOCK_SIZE_SMALL / SL_COUNT);
const _: () = assert!(BLOCK_SIZE_MIN < BLOCK_SIZE_SMALL);
const _: () = assert!(FL_COUNT >= 1 && FL_COUNT <= 32);
const _: () = assert!(SL_COUNT <= 32);
const _: () = assert!(SPLIT_THRESHOLD >= BLOCK_SIZE_MIN);
const _: () = assert!(FL_MAX < usize::BITS);
const _: () = assert!(mem::size_of::<usize>() == mem::size_of::<*mut u8>());

#[cfg_attr(doc, svgbobdoc::transform)]
/// The TLSF pool handle.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                    FL_COUNT = 8
///                               ,-----+-----+-----+-----+-----+-----+-----+-----,
///          fl_bitmap: u32     = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+-----+-----+
///                      min size | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  2⁷ |  2⁶ |  2⁵ |  2⁴ |
///                               '-----+-----+-----+--+--+-----+-----+-----+-----'
///                                                    |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                                     |
///                                                    v                SL_COUNT = 8
///                                  ,-----+-----+-----+-----+-----+-----+-----+-----,
///          "sl_bitmap[4]: u32"   = |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///               min size 2⁸(1+n/8) |  7  |  6  |  5  |  4  |  3  |  2  |  1  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///                       first_free |     |     |  O  |     |     |     |     |     |
///                                  '-----+-----+--|--+-----+-----+-----+-----+-----'
///                                                 |
///                                                 |  size = 416..448
///                                                 v
///   Free blocks                      doubly-linked list of free blocks
/// ```
/// </center>
///
/// # Properties
///
/// All bookkeeping lives inside the handle and the managed region itself;
/// the only per-block metadata is a one-word header. The boundary tag (the
/// `prev` pointer of the physically following block) overlaps the tail of
/// this block's payload and is consulted only when the predecessor is known
/// to be free.
///
/// A handle is either a *fixed* pool ([`Tlsf::pool_init`]) backed by
/// caller-supplied memory, or a *growable* pool ([`Tlsf::with_source`])
/// that acquires and releases storage through a [`PoolSource`].
pub struct Tlsf<'pool, S: PoolSource = ()> {
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_COUNT],
    first_free: [[Option<NonNull<FreeBlockHdr>>; SL_COUNT]; FL_COUNT],
    /// Total pool size in bytes including all block headers and the
    /// sentinel. Zero means uninitialized.
    size: usize,
    /// Current pool base. `None` iff `size == 0`.
    base: Option<NonNull<u8>>,
    /// `true` for fixed pools, which never call into `source`.
    fixed: bool,
    source: S,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf`
//         and have no interior mutability.
unsafe impl<S: PoolSource + Send> Send for Tlsf<'_, S> {}
unsafe impl<S: PoolSource + Sync> Sync for Tlsf<'_, S> {}

/// The header of a memory block.
///
/// A block pointer addresses the header word. The payload starts
/// [`BLOCK_OVERHEAD`] bytes above it; the following block's header starts
/// `BLOCK_OVERHEAD + size` bytes above it. The word *below* the header is
/// the boundary tag: the address of the physically previous block, valid
/// only while [`PREV_FREE_BIT`] is set (it overlaps the previous block's
/// payload tail otherwise).
#[repr(C)]
pub(crate) struct BlockHdr {
    /// The payload size in the high bits, [`FREE_BIT`] and [`PREV_FREE_BIT`]
    /// in the two low bits (alignment forces them to zero in any size).
    header: usize,
}

/// The header of a free memory block, extending [`BlockHdr`] with the
/// doubly-linked free-list threading.
#[repr(C)]
pub(crate) struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

impl BlockHdr {
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.header & !BLOCK_BITS
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert!(size % ALIGN_SIZE == 0, "invalid size");
        self.header = size | (self.header & BLOCK_BITS);
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.header & FREE_BIT != 0
    }

    #[inline]
    pub(crate) fn is_prev_free(&self) -> bool {
        self.header & PREV_FREE_BIT != 0
    }

    #[inline]
    fn set_prev_free(&mut self, free: bool) {
        self.header = if free {
            self.header | PREV_FREE_BIT
        } else {
            self.header & !PREV_FREE_BIT
        };
    }

    /// The payload address of this block.
    #[inline]
    pub(crate) fn payload(&self) -> NonNull<u8> {
        // Safety: `self` is a valid block header, so the payload address is
        //         non-null.
        unsafe { NonNull::new_unchecked((self as *const _ as *mut u8).add(BLOCK_OVERHEAD)) }
    }

    /// Recover the block header owning a payload pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload address previously handed out by a `Tlsf`
    /// whose block is still live.
    #[inline]
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
        debug_assert!(
            ptr.as_ptr() as usize % ALIGN_SIZE == 0,
            "block not aligned properly"
        );
        NonNull::new_unchecked(ptr.as_ptr().sub(BLOCK_OVERHEAD)).cast()
    }

    /// The physically next block.
    ///
    /// # Safety
    ///
    /// Must not be called on the sentinel (`size() == 0`).
    #[inline]
    pub(crate) unsafe fn next_phys(&self) -> NonNull<BlockHdr> {
        debug_assert!(self.size() != 0, "block is last");
        NonNull::new_unchecked((self as *const _ as *mut u8).add(BLOCK_OVERHEAD + self.size()))
            .cast()
    }

    /// The physically previous block, located through the boundary tag.
    ///
    /// # Safety
    ///
    /// [`PREV_FREE_BIT`] must be set; otherwise the tag word holds payload
    /// bytes of the previous block.
    #[inline]
    pub(crate) unsafe fn prev_phys(&self) -> NonNull<BlockHdr> {
        debug_assert!(self.is_prev_free(), "previous block must be free");
        *((self as *const _ as *const u8).wrapping_sub(BLOCK_OVERHEAD)
            as *const NonNull<BlockHdr>)
    }

    /// Write this block's address into the next block's boundary tag and
    /// return the next block.
    ///
    /// # Safety
    ///
    /// As [`Self::next_phys`]; additionally the tag word (the last word of
    /// this block's payload) must be writable.
    #[inline]
    unsafe fn link_next(&mut self) -> NonNull<BlockHdr> {
        let this = NonNull::new_unchecked(self as *mut BlockHdr);
        let next = self.next_phys();
        (next.as_ptr() as *mut u8)
            .sub(BLOCK_OVERHEAD)
            .cast::<NonNull<BlockHdr>>()
            .write(this);
        next
    }

    #[inline]
    fn can_split(&self, size: usize) -> bool {
        self.size() >= size + BLOCK_SIZE_MIN + BLOCK_OVERHEAD
    }

    /// Trimming requires the remainder to reach [`SPLIT_THRESHOLD`] so the
    /// trimmed-off piece is worth tracking.
    #[inline]
    fn can_trim(&self, size: usize) -> bool {
        self.size() >= BLOCK_OVERHEAD + SPLIT_THRESHOLD + size
    }

    /// Flip the free bit and propagate it into the next block's
    /// `PREV_FREE_BIT` (writing the boundary tag on the way).
    ///
    /// # Safety
    ///
    /// The block must not be the sentinel and the next block header must be
    /// in bounds.
    #[inline]
    unsafe fn set_free(&mut self, free: bool) {
        debug_assert!(self.is_free() != free, "block free bit unchanged");
        self.header = if free {
            self.header | FREE_BIT
        } else {
            self.header & !FREE_BIT
        };
        self.link_next().as_mut().set_prev_free(free);
    }

    /// Split off the tail of this block beyond `size` payload bytes into a
    /// new free block and return it.
    ///
    /// # Safety
    ///
    /// The block must be splittable (`can_split`-style size relation) and
    /// owned by the caller.
    unsafe fn split(&mut self, size: usize) -> NonNull<FreeBlockHdr> {
        let mut rest: NonNull<BlockHdr> =
            NonNull::new_unchecked((self as *mut _ as *mut u8).add(BLOCK_OVERHEAD + size)).cast();
        let rest_size = self.size() - (size + BLOCK_OVERHEAD);
        debug_assert!(
            self.size() == rest_size + size + BLOCK_OVERHEAD,
            "rest block size is wrong"
        );
        debug_assert!(rest_size >= BLOCK_SIZE_MIN, "block split with invalid size");
        debug_assert!(rest_size % ALIGN_SIZE == 0, "invalid block size");
        rest.as_mut().header = rest_size;
        rest.as_mut().set_free(true);
        self.set_size(size);
        rest.cast()
    }

    /// Absorb the storage of the physically next block `block` into `self`.
    ///
    /// # Safety
    ///
    /// `block` must be the physically next block of `self` and must not be
    /// on any free list. Leaves `self`'s flags untouched.
    unsafe fn absorb(&mut self, block: NonNull<BlockHdr>) {
        debug_assert!(self.size() != 0, "previous block can't be last");
        self.header += block.as_ref().size() + BLOCK_OVERHEAD;
        self.link_next();
    }
}

#[inline]
pub(crate) fn check_sentinel(block: NonNull<BlockHdr>) {
    let block = unsafe { block.as_ref() };
    debug_assert!(block.size() == 0, "sentinel should be last");
    debug_assert!(!block.is_free(), "sentinel block should not be free");
    let _ = block;
}

/// Adjust an allocation size to be aligned and no smaller than the internal
/// minimum. Bounds are checked *before* alignment: `align_up` wraps to zero
/// near `usize::MAX`, which would bypass the caller's subsequent
/// `MAX_ALLOC_SIZE` test, so oversized values pass through unchanged.
#[inline]
fn adjust_size(size: usize, align: usize) -> usize {
    if size > MAX_ALLOC_SIZE {
        return size;
    }
    let size = align_up(size, align);
    size.max(BLOCK_SIZE_MIN)
}

impl<'pool> Tlsf<'pool> {
    /// An empty, uninitialized handle with no backing store.
    pub const INIT: Self = Self::with_source(());
}

impl<S: PoolSource + Default> Default for Tlsf<'_, S> {
    fn default() -> Self {
        Self::with_source(S::default())
    }
}

impl<'pool, S: PoolSource> Tlsf<'pool, S> {
    /// Create an empty growable handle. Storage is acquired from `source`
    /// on first demand.
    pub const fn with_source(source: S) -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            first_free: [[None; SL_COUNT]; FL_COUNT],
            size: 0,
            base: None,
            fixed: false,
            source,
            _phantom: PhantomData,
        }
    }

    /// The total pool size in bytes, including per-block and sentinel
    /// overhead. Zero for an uninitialized pool.
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn pool_base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Initialize the handle as a fixed pool over `mem`.
    ///
    /// Returns the usable bytes, or 0 on failure (region too small once
    /// aligned). The handle is reset first; any previous pool state is
    /// discarded. A fixed pool never grows through the [`PoolSource`];
    /// when it is exhausted, allocations return `None`. It may still be
    /// extended with physically adjacent memory via [`Self::pool_append`].
    pub fn pool_init(&mut self, mem: &'pool mut [MaybeUninit<u8>]) -> usize {
        // Safety: `mem` is an exclusive reference, which guarantees the
        // absence of aliasing references, and being `'pool` means it
        // outlives `self`.
        unsafe {
            self.pool_init_ptr(NonNull::new_unchecked(
                mem as *mut [MaybeUninit<u8>] as *mut [u8],
            ))
        }
    }

    /// [`Self::pool_init`] taking a raw slice pointer.
    ///
    /// # Safety
    ///
    /// The memory region is considered owned by `self` and must outlive it.
    /// No other code may access the region while the pool is live.
    pub unsafe fn pool_init_ptr(&mut self, mem: NonNull<[u8]>) -> usize {
        // Reset the handle wholesale, as if freshly constructed.
        self.fl_bitmap = 0;
        self.sl_bitmap = [0; FL_COUNT];
        self.first_free = [[None; SL_COUNT]; FL_COUNT];
        self.size = 0;
        self.base = None;
        self.fixed = false;

        let bytes = mem.len();
        let start = align_ptr(mem.as_ptr() as *mut u8, ALIGN_SIZE);
        let adj = start as usize - mem.as_ptr() as *mut u8 as usize;
        if bytes <= adj {
            return 0;
        }

        // Usable pool size, aligned down.
        let pool_bytes = (bytes - adj) & !(ALIGN_SIZE - 1);
        if pool_bytes < 2 * BLOCK_OVERHEAD + BLOCK_SIZE_MIN {
            return 0;
        }

        let free_size = (pool_bytes - 2 * BLOCK_OVERHEAD) & !(ALIGN_SIZE - 1);
        if free_size < BLOCK_SIZE_MIN || free_size > BLOCK_SIZE_MAX {
            return 0;
        }

        self.fixed = true;
        self.base = Some(NonNull::new_unchecked(start));

        // The initial free block's header occupies the first word of the
        // region; its boundary tag slot would sit below the region and is
        // never read because the first block has no predecessor.
        let mut block: NonNull<BlockHdr> = NonNull::new_unchecked(start).cast();
        block.as_mut().header = free_size | FREE_BIT;
        self.insert_block(block);

        let mut sentinel = block.as_mut().link_next();
        sentinel.as_mut().header = PREV_FREE_BIT;

        self.size = free_size + 2 * BLOCK_OVERHEAD;
        free_size
    }

    /// Restore the empty-pool state of a fixed pool in time proportional
    /// only to the bin-table size. Every outstanding pointer is
    /// invalidated. No-op on growable or uninitialized handles.
    pub fn pool_reset(&mut self) {
        let base = match (self.fixed, self.base) {
            (true, Some(base)) => base,
            _ => return,
        };
        self.fl_bitmap = 0;
        self.sl_bitmap = [0; FL_COUNT];
        self.first_free = [[None; SL_COUNT]; FL_COUNT];

        // Safety: `base` and `size` still describe the region handed to
        //         `pool_init`; all block pointers derived from them are
        //         in bounds.
        unsafe {
            let free_size = self.size - 2 * BLOCK_OVERHEAD;
            let mut block: NonNull<BlockHdr> = base.cast();
            block.as_mut().header = free_size | FREE_BIT;
            self.insert_block(block);
            let mut sentinel = block.as_mut().link_next();
            sentinel.as_mut().header = PREV_FREE_BIT;
        }
    }

    /// Extend the pool with physically adjacent memory, coalescing with the
    /// last block if it is free. Returns the number of bytes accepted, or 0
    /// if the region is not adjacent, too small, or would push the pool
    /// past `1 << FL_MAX` bytes. The pool is left untouched on failure.
    ///
    /// # Safety
    ///
    /// The memory region is considered owned by `self` and must outlive it.
    pub unsafe fn pool_append(&mut self, mem: NonNull<[u8]>) -> usize {
        let size = mem.len();
        if self.size == 0 || size < 2 * BLOCK_OVERHEAD {
            return 0;
        }

        let start = align_ptr(mem.as_ptr() as *mut u8, ALIGN_SIZE);
        let end = nonnull_slice_end(mem);
        let mut aligned_size = (end as usize).wrapping_sub(start as usize) & !(ALIGN_SIZE - 1);

        // For fixed pools the relocated sentinel must fit inside the
        // appended region itself; a growable pool's backend provides the
        // extra word instead.
        if self.fixed {
            if aligned_size <= BLOCK_OVERHEAD {
                return 0;
            }
            aligned_size -= BLOCK_OVERHEAD;
        }
        if aligned_size < 2 * BLOCK_OVERHEAD {
            return 0;
        }

        let mut pool_start = match self.base {
            Some(base) => base,
            None => return 0,
        };

        // Only coalescing with immediately adjacent memory is supported.
        if start != pool_start.as_ptr().add(self.size) {
            return 0;
        }

        let old_size = self.size;
        let new_total = self.size + aligned_size + BLOCK_OVERHEAD;
        if new_total > 1 << FL_MAX {
            return 0;
        }

        if !self.fixed {
            pool_start = match self.source.resize(new_total) {
                Some(p) => p,
                None => return 0,
            };
        }

        self.size = new_total;
        self.base = Some(pool_start);

        let old_sentinel: NonNull<BlockHdr> =
            NonNull::new_unchecked(pool_start.as_ptr().add(old_size - BLOCK_OVERHEAD)).cast();
        check_sentinel(old_sentinel);

        // If the block before the old sentinel is free, it is re-created
        // spanning the appended region as well.
        let last_block = if old_sentinel.as_ref().is_prev_free() {
            let prev = old_sentinel.as_ref().prev_phys();
            debug_assert!(prev.as_ref().is_free(), "last block should be free");
            self.remove_block(prev);
            Some(prev)
        } else {
            None
        };

        // The old sentinel header becomes the new block's header (when not
        // merging) or is absorbed as overhead (when merging).
        let mut new_free_size = aligned_size;
        let mut new_free_block = match last_block {
            Some(prev) => {
                new_free_size += prev.as_ref().size() + BLOCK_OVERHEAD;
                prev
            }
            None => old_sentinel,
        };

        // When not merging, the previous block is allocated, so
        // PREV_FREE_BIT stays clear; the boundary tag slot is left alone
        // because it overlaps that block's payload tail.
        new_free_block.as_mut().header = new_free_size | FREE_BIT;
        self.insert_block(new_free_block);

        let mut new_sentinel = new_free_block.as_mut().link_next();
        new_sentinel.as_mut().header = PREV_FREE_BIT;
        check_sentinel(new_sentinel);

        aligned_size
    }

    /// Request more storage from the backing source and graft it onto the
    /// end of the pool, repurposing the old sentinel as the head of the new
    /// free region.
    unsafe fn grow_pool(&mut self, size: usize) -> bool {
        // Fixed pools cannot grow.
        if self.fixed {
            return false;
        }

        let req_size = (if self.size != 0 {
            self.size + BLOCK_OVERHEAD
        } else {
            2 * BLOCK_OVERHEAD
        })
        .wrapping_add(size);

        // The pool cannot exceed the addressable range of the first-level
        // index; a merged block past that would overflow the mapping.
        if req_size > 1 << FL_MAX {
            return false;
        }

        let addr = match self.source.resize(req_size) {
            Some(addr) => addr,
            None => return false,
        };
        debug_assert!(
            addr.as_ptr() as usize % ALIGN_SIZE == 0,
            "wrong heap alignment address"
        );

        let mut block: NonNull<BlockHdr> = if self.size != 0 {
            NonNull::new_unchecked(addr.as_ptr().add(self.size - BLOCK_OVERHEAD)).cast()
        } else {
            addr.cast()
        };
        if self.size == 0 {
            block.as_mut().header = 0;
        }
        check_sentinel(block);

        // The old sentinel keeps its PREV_FREE_BIT and becomes a free block
        // spanning the new storage.
        block.as_mut().header |= size | FREE_BIT;
        let mut block = self.merge_prev(block);
        self.insert_block(block);

        let mut sentinel = block.as_mut().link_next();
        sentinel.as_mut().header = PREV_FREE_BIT;

        self.size = req_size;
        self.base = Some(addr);
        check_sentinel(sentinel);
        true
    }

    /// Give the tail block's storage back to the backing source. Called when
    /// a growable pool's last-before-sentinel block becomes free.
    unsafe fn shrink_pool(&mut self, mut block: NonNull<BlockHdr>) {
        check_sentinel(block.as_ref().next_phys());
        let size = block.as_ref().size();
        debug_assert!(
            self.size >= size + BLOCK_OVERHEAD,
            "invalid heap size before shrink"
        );
        self.size = self.size - size - BLOCK_OVERHEAD;
        if self.size == BLOCK_OVERHEAD {
            self.size = 0;
        }
        let addr = self.source.resize(self.size);
        if self.size != 0 {
            if let Some(addr) = addr {
                self.base = Some(addr);
            }
            // The freed block becomes the new sentinel.
            block.as_mut().header = 0;
            check_sentinel(block);
        } else {
            self.base = None;
        }
    }

    /// Insert `block` at the head of its mapped bin and set the bitmap bits.
    ///
    /// # Safety
    ///
    /// `block` must be owned by `self`, sized for bin `(fl, sl)`, and not
    /// currently on any free list.
    unsafe fn insert_free_block_at(&mut self, mut block: NonNull<FreeBlockHdr>, fl: u32, sl: u32) {
        let current = self.first_free[fl as usize][sl as usize];
        block.as_mut().next_free = current;
        block.as_mut().prev_free = None;
        if let Some(mut current) = current {
            current.as_mut().prev_free = Some(block);
        }
        self.first_free[fl as usize][sl as usize] = Some(block);
        self.fl_bitmap.set_bit(fl);
        self.sl_bitmap[fl as usize].set_bit(sl);
    }

    /// Splice `block` out of bin `(fl, sl)`, clearing the bitmap bits when
    /// the bin empties.
    ///
    /// # Safety
    ///
    /// `(fl, sl)` must be the bin `block` currently lives in.
    unsafe fn remove_free_block_at(&mut self, block: NonNull<FreeBlockHdr>, fl: u32, sl: u32) {
        debug_assert!((fl as usize) < FL_COUNT, "wrong first level");
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        let prev = block.as_ref().prev_free;
        let next = block.as_ref().next_free;
        if let Some(mut next) = next {
            next.as_mut().prev_free = prev;
        }
        if let Some(mut prev) = prev {
            prev.as_mut().next_free = next;
        }

        if self.first_free[fl as usize][sl as usize] == Some(block) {
            self.first_free[fl as usize][sl as usize] = next;

            if next.is_none() {
                self.sl_bitmap[fl as usize].clear_bit(sl);
                if self.sl_bitmap[fl as usize] == 0 {
                    self.fl_bitmap.clear_bit(fl);
                }
            }
        }
    }

    /// Insert a block into the bin mapped from its current size.
    unsafe fn insert_block(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = map::mapping(block.as_ref().size());
        self.insert_free_block_at(block.cast(), fl, sl);
    }

    /// Remove a block from the bin mapped from its current size.
    unsafe fn remove_block(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = map::mapping(block.as_ref().size());
        self.remove_free_block_at(block.cast(), fl, sl);
    }

    /// Find a non-empty bin whose floor is at least `bin_floor(fl, sl)`.
    /// Touches at most two bitmap words.
    #[inline]
    fn find_suitable(&self, fl: u32, sl: u32) -> Option<(u32, u32, NonNull<FreeBlockHdr>)> {
        debug_assert!((fl as usize) < FL_COUNT, "wrong first level");
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        // Search in range `(fl, sl..SL_COUNT)`.
        let mut fl = fl;
        let mut sl = self.sl_bitmap[fl as usize].bit_scan_forward(sl);
        if sl as usize >= SL_COUNT {
            // No block in this row at or above `sl`; take the first block of
            // the next non-empty row.
            fl = self.fl_bitmap.bit_scan_forward(fl + 1);
            if fl as usize >= FL_COUNT {
                // Memory has been exhausted.
                return None;
            }

            sl = self.sl_bitmap[fl as usize].trailing_zeros();
            debug_assert!((sl as usize) < SL_COUNT, "second level bitmap is null");
        }

        self.first_free[fl as usize][sl as usize].map(|block| (fl, sl, block))
    }

    /// Locate and extract a free block for a request of `*size` bytes,
    /// growing the pool if necessary. On success `*size` has been promoted
    /// to the floor of the request's mapped bin (the rounded size), so the
    /// trimmed block maps to a consistent bin on release.
    unsafe fn find_free(&mut self, size: &mut usize) -> Option<NonNull<BlockHdr>> {
        *size = map::round_block_size(*size);
        let (fl, sl) = map::mapping(*size);
        let (fl, sl, block) = match self.find_suitable(fl, sl) {
            Some(found) => found,
            None => {
                if !self.grow_pool(*size) {
                    return None;
                }
                match self.find_suitable(fl, sl) {
                    Some(found) => found,
                    None => {
                        debug_assert!(false, "no block found");
                        unreachable_unchecked()
                    }
                }
            }
        };

        debug_assert!(
            block.cast::<BlockHdr>().as_ref().size() >= *size,
            "insufficient block size"
        );
        self.remove_free_block_at(block, fl, sl);
        Some(block.cast())
    }

    /// Trim trailing space off a free block and return the rest to the pool.
    unsafe fn rtrim_free(&mut self, mut block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(block.as_ref().is_free(), "block must be free");
        if !block.as_ref().can_trim(size) {
            return;
        }
        let mut rest = block.as_mut().split(size);
        block.as_mut().link_next();
        rest.as_mut().common.set_prev_free(true);
        self.insert_block(rest.cast());
    }

    /// Trim trailing space off a used block, merging the remainder forward
    /// before returning it to the pool.
    unsafe fn rtrim_used(&mut self, mut block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(!block.as_ref().is_free(), "block must be used");
        if !block.as_ref().can_trim(size) {
            return;
        }
        let mut rest = block.as_mut().split(size);
        rest.as_mut().common.set_prev_free(false);
        let rest = self.merge_next(rest.cast());
        self.insert_block(rest);
    }

    /// Trim `size` bytes of leading alignment slack off a free block into
    /// its own free block; the trimmed remainder is returned.
    unsafe fn ltrim_free(
        &mut self,
        mut block: NonNull<BlockHdr>,
        size: usize,
    ) -> NonNull<BlockHdr> {
        debug_assert!(block.as_ref().is_free(), "block must be free");
        debug_assert!(block.as_ref().can_split(size), "block is too small");
        let mut rest = block.as_mut().split(size - BLOCK_OVERHEAD);
        rest.as_mut().common.set_prev_free(true);
        block.as_mut().link_next();
        self.insert_block(block);
        rest.cast()
    }

    /// Merge a just-freed block with a free physical predecessor.
    unsafe fn merge_prev(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        if block.as_ref().is_prev_free() {
            let mut prev = block.as_ref().prev_phys();
            debug_assert!(
                prev.as_ref().is_free(),
                "prev block is not free though marked as such"
            );
            self.remove_block(prev);
            prev.as_mut().absorb(block);
            prev
        } else {
            block
        }
    }

    /// Merge a just-freed block with a free physical successor.
    unsafe fn merge_next(&mut self, mut block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        let next = block.as_ref().next_phys();
        if next.as_ref().is_free() {
            debug_assert!(block.as_ref().size() != 0, "previous block can't be last");
            self.remove_block(next);
            block.as_mut().absorb(next);
        }
        block
    }

    /// Trim a freshly extracted block to `size`, mark it used, and return
    /// its payload.
    unsafe fn use_block(&mut self, mut block: NonNull<BlockHdr>, size: usize) -> NonNull<u8> {
        self.rtrim_free(block, size);
        block.as_mut().set_free(false);
        block.as_ref().payload()
    }

    /// Attempt to allocate `size` bytes. Returns the payload address, or
    /// `None` when no suitable free block exists and the pool cannot grow.
    ///
    /// A zero `size` yields a unique minimum-sized allocation. The payload
    /// is aligned to [`ALIGN_SIZE`].
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time (modulo the backing source of
    /// a growable pool).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut size = adjust_size(size, ALIGN_SIZE);
        if size > MAX_ALLOC_SIZE {
            return None;
        }

        // Safety: the handle owns every block reachable from its bins.
        unsafe {
            // Fast path: small sizes map linearly into row zero, so the
            // log2/rounding machinery can be skipped entirely.
            if size < BLOCK_SIZE_SMALL {
                let sl = (size >> ALIGN_SHIFT) as u32;
                let found = self.sl_bitmap[0].bit_scan_forward(sl);
                if (found as usize) < SL_COUNT {
                    // Use the bin's minimum size so the block maps back to
                    // the same bin on release.
                    let size = map::mapping_size(0, found);
                    let block = match self.first_free[0][found as usize] {
                        Some(block) => block,
                        None => unreachable_unchecked(),
                    };
                    self.remove_free_block_at(block, 0, found);
                    return Some(self.use_block(block.cast(), size));
                }
                // Fall through: search larger classes via the generic path.
            }

            let block = self.find_free(&mut size)?;
            Some(self.use_block(block, size))
        }
    }

    /// Attempt to allocate `size` bytes whose payload address is a multiple
    /// of `align`, which must be a non-zero power of two (`size` need not
    /// be a multiple of `align`). A zero `size` returns a valid aligned
    /// minimum-sized allocation.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let adjust = adjust_size(size, ALIGN_SIZE);

        if !align.is_power_of_two()
            || align > MAX_ALLOC_SIZE
            || adjust > MAX_ALLOC_SIZE.checked_sub(align + BLOCK_SIZE_MIN + BLOCK_OVERHEAD)?
        {
            return None;
        }

        if align <= ALIGN_SIZE {
            return self.allocate(size);
        }

        // Reserve enough slack to carve an aligned payload out of whatever
        // block the search produces.
        let mut asize = adjust_size(
            adjust + align - 1 + BLOCK_SIZE_MIN + BLOCK_OVERHEAD,
            align,
        );

        // Safety: same as in `allocate`.
        unsafe {
            let block = self.find_free(&mut asize)?;

            // The payload moves up by at least a whole block header so the
            // leading slack forms a valid free block.
            let payload = block.as_ref().payload().as_ptr();
            let mem = align_ptr(payload.add(BLOCK_SIZE_MIN + BLOCK_OVERHEAD), align);
            let lead = mem as usize - payload as usize;
            let block = self.ltrim_free(block, lead);
            Some(self.use_block(block, adjust))
        }
    }

    /// Release a previously allocated block, coalescing with free physical
    /// neighbors. For growable pools, storage at the pool tail is returned
    /// to the backing source.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a live memory block previously allocated via
    ///    `self`.
    ///  - Double release is undefined (debug builds detect it through the
    ///    free-bit assertion).
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let mut block = BlockHdr::from_payload(ptr);
        debug_assert!(!block.as_ref().is_free(), "block already marked as free");

        block.as_mut().set_free(true);
        let block = self.merge_prev(block);
        let block = self.merge_next(block);

        if block.as_ref().next_phys().as_ref().size() == 0 && !self.fixed {
            self.shrink_pool(block);
        } else {
            self.insert_block(block);
        }
    }

    /// Resize a previously allocated block.
    ///
    /// Four strategies are attempted in order: in-place shrink or fit,
    /// forward expansion into a free successor, backward expansion into a
    /// free predecessor (moving the payload), and relocation. On failure
    /// the original allocation is preserved and `None` is returned.
    ///
    /// A `new_size` of zero releases the block and returns `None`. (For the
    /// null-pointer case of the classic `realloc` contract, call
    /// [`Self::allocate`].)
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via
    /// `self`. After a non-`None` return the old pointer is invalid.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        // Zero-size requests are treated as release.
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let mut block = BlockHdr::from_payload(ptr);
        let avail = block.as_ref().size();
        let size = adjust_size(new_size, ALIGN_SIZE);
        if size > MAX_ALLOC_SIZE {
            return None;
        }
        debug_assert!(!block.as_ref().is_free(), "block already marked as free");

        let mut mem = ptr;
        if size > avail {
            let next = block.as_ref().next_phys();
            let next_free = next.as_ref().is_free();
            let next_size = if next_free {
                next.as_ref().size() + BLOCK_OVERHEAD
            } else {
                0
            };

            if next_free && size <= avail + next_size {
                // Forward expansion: no data movement required.
                self.merge_next(block);
                block
                    .as_ref()
                    .next_phys()
                    .as_mut()
                    .set_prev_free(false);
            } else if block.as_ref().is_prev_free() {
                // Backward expansion: requires moving the payload.
                let mut prev = block.as_ref().prev_phys();
                let prev_size = prev.as_ref().size();
                let mut combined = prev_size + avail + BLOCK_OVERHEAD;
                if next_free {
                    combined += next_size;
                }

                if size <= combined {
                    self.remove_block(prev);

                    // Move the payload down into the predecessor's payload
                    // area; the regions may overlap.
                    core::ptr::copy(mem.as_ptr(), prev.as_ref().payload().as_ptr(), avail);

                    // Merge prev + current into one used block, preserving
                    // prev's own PREV_FREE_BIT.
                    let merged_size = prev_size + avail + BLOCK_OVERHEAD;
                    prev.as_mut().header =
                        merged_size | (prev.as_ref().header & PREV_FREE_BIT);
                    prev.as_mut().link_next();

                    if next_free {
                        self.remove_block(next);
                        prev.as_mut().header += next.as_ref().size() + BLOCK_OVERHEAD;
                        prev.as_mut().link_next();
                    }

                    prev.as_ref()
                        .next_phys()
                        .as_mut()
                        .set_prev_free(false);

                    block = prev;
                    mem = block.as_ref().payload();
                } else {
                    // Combined space still insufficient; relocate.
                    return self.relocate(mem, avail, size);
                }
            } else {
                // No in-place expansion possible; relocate.
                return self.relocate(mem, avail, size);
            }
        }

        // Trim the resulting block and return the (possibly moved) pointer.
        self.rtrim_used(block, size);
        Some(mem)
    }

    /// Allocate a fresh block, copy the payload over, release the original.
    unsafe fn relocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let dst = self.allocate(size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), old_size);
        self.deallocate(ptr);
        Some(dst)
    }

}

/// The payload capacity of the block owning `ptr`. At least as large as
/// the size requested when the block was allocated.
///
/// # Safety
///
/// `ptr` must denote a live memory block previously allocated from a
/// [`Tlsf`] pool.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    BlockHdr::from_payload(ptr).as_ref().size()
}

impl<S: PoolSource> fmt::Debug for Tlsf<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlsf")
            .field("fl_bitmap", &self.fl_bitmap)
            .field("sl_bitmap", &self.sl_bitmap)
            .field("size", &self.size)
            .field("fixed", &self.fixed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
