//! Thread-safe facade: one region partitioned into independently locked
//! TLSF arenas.
//!
//! Instead of a single coarse mutex around the allocator, the caller's
//! region is split into up to `ARENAS` sub-pools, each with its own lock.
//! Threads are steered to arenas by a hash of a per-thread hint, so
//! concurrent allocations from different threads typically hit different
//! locks with zero contention.
//!
//! Thread-safety contract (same as `malloc`/`free`):
//!
//!  - Different threads may call any method concurrently.
//!  - Concurrent operations on the *same* pointer are undefined behavior.
//!    Each live pointer is owned by exactly one thread at a time; the owner
//!    may release or resize it, but no other thread may touch it
//!    simultaneously.
//!  - [`ArenaTlsf::reset`] takes `&mut self`, so quiescence is enforced by
//!    the borrow checker.
//!
//! The lock primitive is pluggable through [`RawMutex`]; the default
//! [`Spinlock`] works on bare metal. The cross-arena resize fallback
//! briefly holds no lock between the failed in-place attempt and the
//! release of the original block; this is sound because the pointer is
//! owned by the calling thread throughout, but it does mean another thread
//! may observe the owning arena allocate before the original block returns
//! to it.
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{PoolStats, Tlsf};

/// Default number of independent arenas.
///
/// More arenas lower contention but partition the memory (one arena can
/// exhaust while others have space); fewer arenas utilize memory better at
/// the cost of contention.
pub const DEFAULT_ARENA_COUNT: usize = 4;

/// Arena records are padded to this many bytes so two arenas never share a
/// cache line.
const CACHELINE_SIZE: usize = 64;

/// An arena share below this is not viable as a TLSF pool; the arena count
/// is halved until every share reaches it.
const MIN_ARENA_BYTES: usize = 256;

const _: () = assert!(CACHELINE_SIZE.is_power_of_two());

/// A mutual-exclusion primitive usable by [`ArenaTlsf`].
///
/// The required operations are blocking acquire, non-blocking acquire, and
/// release; construction and destruction fold into [`INIT`](Self::INIT)
/// and `Drop`. Acquires are expected to complete; there are no timeouts.
///
/// # Safety
///
/// An implementation must provide mutual exclusion: between a successful
/// `lock`/`try_lock` and the matching `unlock`, no other acquire on the
/// same instance may succeed, and `unlock` must synchronize-with the next
/// acquire.
pub unsafe trait RawMutex {
    /// The unlocked initial state.
    const INIT: Self;

    /// Acquire the lock, waiting as long as necessary.
    fn lock(&self);

    /// Try to acquire the lock without suspending. Returns `true` on
    /// success.
    fn try_lock(&self) -> bool;

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller.
    unsafe fn unlock(&self);
}

/// The default [`RawMutex`]: a test-and-set spinlock. Usable on bare metal;
/// hosts with a preemptive scheduler may prefer to supply a native
/// primitive through the trait instead.
pub struct Spinlock {
    locked: AtomicBool,
}

unsafe impl RawMutex for Spinlock {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    #[inline]
    fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// One sub-pool with its lock and the address range it owns, padded to a
/// cache line.
#[repr(align(64))]
struct Arena<'pool, L> {
    lock: L,
    pool: UnsafeCell<Tlsf<'pool>>,
    base: *mut u8,
    capacity: usize,
}

const _: () = assert!(core::mem::align_of::<Arena<'static, Spinlock>>() == CACHELINE_SIZE);

impl<L: RawMutex> Arena<'_, L> {
    const INIT: Self = Self {
        lock: L::INIT,
        pool: UnsafeCell::new(Tlsf::INIT),
        base: core::ptr::null_mut(),
        capacity: 0,
    };
}

/// A thread-safe TLSF allocator over a caller-supplied region, partitioned
/// into `ARENAS` independently locked sub-pools.
///
/// Every live pointer is owned by exactly one arena, determined by its
/// address range; release and resize find the owner with a linear scan of
/// the arena table (O(`ARENAS`), cache-resident). Allocations try the
/// calling thread's *preferred arena* first and fall back to the others,
/// first without blocking and then blocking, so `None` is only returned
/// once every arena has been tried.
pub struct ArenaTlsf<'pool, L: RawMutex = Spinlock, const ARENAS: usize = 4> {
    arenas: [Arena<'pool, L>; ARENAS],
    count: usize,
    thread_hint: fn() -> usize,
}

// Safety: the arena pools are only reached through their locks, and the
//         raw base pointers refer to memory owned by the pools.
unsafe impl<L: RawMutex + Send, const ARENAS: usize> Send for ArenaTlsf<'_, L, ARENAS> {}
unsafe impl<L: RawMutex + Send + Sync, const ARENAS: usize> Sync for ArenaTlsf<'_, L, ARENAS> {}

/// A stable per-thread integer for arena selection.
///
/// The address of a thread-local is unique per live thread, which is all
/// the dispatch hash needs.
#[cfg(any(test, feature = "std"))]
fn default_thread_hint() -> usize {
    std::thread_local!(static ANCHOR: u8 = const { 0 });
    ANCHOR.with(|anchor| anchor as *const u8 as usize)
}

/// Without a host there is no portable thread identity; all threads share
/// arena 0 until the application supplies a hint via
/// [`ArenaTlsf::set_thread_hint`].
#[cfg(not(any(test, feature = "std")))]
fn default_thread_hint() -> usize {
    0
}

impl<'pool, L: RawMutex, const ARENAS: usize> ArenaTlsf<'pool, L, ARENAS> {
    /// Partition `mem` into up to `ARENAS` equal sub-pools and initialize
    /// each. The arena count is halved while per-arena shares are too
    /// small to be viable. Returns `None` when no partitioning yields
    /// working pools.
    pub fn new(mem: &'pool mut [MaybeUninit<u8>]) -> Option<Self> {
        let bytes = mem.len();
        if bytes == 0 || ARENAS == 0 {
            return None;
        }

        let mut count = ARENAS;
        while count > 1 && bytes / count < MIN_ARENA_BYTES {
            count >>= 1;
        }

        let per_arena = (bytes / count) & !(CACHELINE_SIZE - 1);
        let base = mem.as_mut_ptr() as *mut u8;

        let mut this = Self {
            arenas: [Arena::INIT; ARENAS],
            count: 0,
            thread_hint: default_thread_hint,
        };

        for i in 0..count {
            // The last arena absorbs the remainder of the division.
            let chunk = if i == count - 1 {
                bytes - i * per_arena
            } else {
                per_arena
            };

            let arena = &mut this.arenas[i];
            arena.base = base.wrapping_add(i * per_arena);
            arena.capacity = chunk;

            // Safety: the sub-regions are disjoint slices of `mem`, which
            //         outlives `self` by the `'pool` bound.
            let usable = unsafe {
                (*arena.pool.get()).pool_init_ptr(NonNull::new_unchecked(
                    core::ptr::slice_from_raw_parts_mut(arena.base, chunk),
                ))
            };
            if usable == 0 {
                return None;
            }
        }

        this.count = count;
        Some(this)
    }

    /// The number of initialized arenas (at most `ARENAS`).
    pub fn arena_count(&self) -> usize {
        self.count
    }

    /// Replace the thread-hint function. The hint must be stable per
    /// thread; it need not be unique.
    pub fn set_thread_hint(&mut self, hint: fn() -> usize) {
        self.thread_hint = hint;
    }

    /// Hash the thread hint to a preferred arena. The mixer spreads hints
    /// that differ only in their low bits (sequential ids, page-aligned
    /// stack addresses) across all arenas.
    fn arena_select(&self) -> usize {
        let raw = (self.thread_hint)();
        let mut h = (raw ^ (raw >> 16)) as u32;
        h ^= h >> 16;
        h = h.wrapping_mul(0x45d9f3b);
        h ^= h >> 16;
        h as usize % self.count
    }

    /// Find which arena owns `ptr` by range check. O(`ARENAS`).
    fn arena_find(&self, ptr: *const u8) -> Option<usize> {
        let p = ptr as usize;
        (0..self.count).find(|&i| {
            let base = self.arenas[i].base as usize;
            p >= base && p - base < self.arenas[i].capacity
        })
    }

    /// Run `f` on one arena's pool under its lock.
    #[inline]
    fn with_arena<R>(&self, idx: usize, f: impl FnOnce(&mut Tlsf<'pool>) -> R) -> R {
        let arena = &self.arenas[idx];
        arena.lock.lock();
        // Safety: the lock is held, so the pool is not aliased.
        let result = f(unsafe { &mut *arena.pool.get() });
        // Safety: acquired above.
        unsafe { arena.lock.unlock() };
        result
    }

    /// Try the arenas other than `skip` in order: first a non-blocking
    /// sweep, then a blocking one.
    fn fallback<R>(&self, skip: usize, mut f: impl FnMut(&mut Tlsf<'pool>) -> Option<R>) -> Option<R> {
        for i in 1..self.count {
            let idx = (skip + i) % self.count;
            let arena = &self.arenas[idx];
            if arena.lock.try_lock() {
                // Safety: try_lock succeeded.
                let result = f(unsafe { &mut *arena.pool.get() });
                unsafe { arena.lock.unlock() };
                if result.is_some() {
                    return result;
                }
            }
        }

        for i in 1..self.count {
            let idx = (skip + i) % self.count;
            let result = self.with_arena(idx, &mut f);
            if result.is_some() {
                return result;
            }
        }

        None
    }

    /// Allocate `size` bytes from the calling thread's preferred arena,
    /// falling back to the others. Returns `None` only after every arena
    /// has been tried.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if self.count == 0 {
            return None;
        }
        let preferred = self.arena_select();
        if let Some(ptr) = self.with_arena(preferred, |pool| pool.allocate(size)) {
            return Some(ptr);
        }
        self.fallback(preferred, |pool| pool.allocate(size))
    }

    /// As [`Self::allocate`] with an alignment requirement (a non-zero
    /// power of two).
    pub fn allocate_aligned(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if self.count == 0 {
            return None;
        }
        let preferred = self.arena_select();
        if let Some(ptr) = self.with_arena(preferred, |pool| pool.allocate_aligned(align, size)) {
            return Some(ptr);
        }
        self.fallback(preferred, |pool| pool.allocate_aligned(align, size))
    }

    /// Release `ptr` into its owning arena. Pointers not owned by any
    /// arena are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and previously returned by this instance, and no
    /// other thread may operate on it concurrently.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let idx = match self.arena_find(ptr.as_ptr()) {
            Some(idx) => idx,
            None => return,
        };
        // Safety: upheld by the caller.
        self.with_arena(idx, |pool| unsafe { pool.deallocate(ptr) });
    }

    /// Resize `ptr` in its owning arena, relocating across arenas when the
    /// owner lacks space. Zero `new_size` releases and returns `None`; on
    /// failure the original allocation is preserved.
    ///
    /// # Safety
    ///
    /// As [`Self::deallocate`]; after a non-`None` return the old pointer
    /// is invalid.
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let idx = self.arena_find(ptr.as_ptr())?;

        // In-place attempt within the owning arena; grab the old usable
        // size under the same lock in case relocation is needed.
        let mut old_size = 0;
        // Safety: upheld by the caller.
        let new_ptr = self.with_arena(idx, |pool| unsafe {
            old_size = crate::usable_size(ptr);
            pool.reallocate(ptr, new_size)
        });
        if new_ptr.is_some() {
            return new_ptr;
        }

        // The owning arena is exhausted for the new size and the original
        // block is untouched. Allocate anywhere, copy, then release the
        // original. The pointer stays owned by this thread throughout.
        let new_ptr = self.allocate(new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        // Safety: `ptr` is still live; the failed resize did not touch it.
        self.with_arena(idx, |pool| unsafe { pool.deallocate(ptr) });
        Some(new_ptr)
    }

    /// The payload capacity of the block owning `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and previously returned by this instance.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        crate::usable_size(ptr)
    }

    /// The index of the arena owning `ptr`, if any.
    pub fn owning_arena(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.arena_find(ptr.as_ptr())
    }

    /// Aggregate statistics across all arenas. `largest_free` reports the
    /// single largest free block in any arena.
    pub fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for i in 0..self.count {
            let arena_stats = self.with_arena(i, |pool| pool.stats());
            total.merge(&arena_stats);
        }
        total
    }

    /// Run the full consistency check on every arena.
    pub fn check(&self) {
        for i in 0..self.count {
            self.with_arena(i, |pool| pool.check());
        }
    }

    /// Reset every arena to its initial state in bounded time. All
    /// outstanding pointers become invalid; exclusive access enforces the
    /// required quiescence.
    pub fn reset(&mut self) {
        for i in 0..self.count {
            self.arenas[i].pool.get_mut().pool_reset();
        }
    }
}

impl<L: RawMutex, const ARENAS: usize> core::fmt::Debug for ArenaTlsf<'_, L, ARENAS> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaTlsf")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}
