//! Backing-store sources for growable pools.
use core::ptr::NonNull;

use crate::ALIGN_SIZE;

/// The storage provider behind a growable [`Tlsf`] pool.
///
/// The core calls [`resize`](Self::resize) from within allocation (to grow),
/// from release-that-empties-the-tail (to shrink), and from
/// [`pool_append`](crate::Tlsf::pool_append) on growable pools.
///
/// [`Tlsf`]: crate::Tlsf
///
/// # Safety
///
/// Implementations must uphold all of the following; the core builds block
/// headers inside the returned region based on them.
///
///  - The returned region is at least `req_bytes` long and its base is
///    aligned to [`ALIGN_SIZE`].
///  - While any allocation is outstanding, growth happens in place: the
///    returned base equals the previous base and the old contents are
///    preserved.
///  - A call with `req_bytes` equal to the current size is an idempotent
///    query returning the current base without side effects.
///  - Shrink requests never move the region; they may release the tail
///    storage. A request of zero releases everything.
pub unsafe trait PoolSource {
    /// Grow, shrink, or query the backing region to `req_bytes` total
    /// bytes. Returns the region base, or `None` on failure (the pool is
    /// left unchanged).
    unsafe fn resize(&mut self, req_bytes: usize) -> Option<NonNull<u8>>;
}

/// The default source of a fixed pool: every growth request fails, so the
/// core compiles and runs without any backing store.
unsafe impl PoolSource for () {
    #[inline]
    unsafe fn resize(&mut self, _req_bytes: usize) -> Option<NonNull<u8>> {
        None
    }
}

/// A [`PoolSource`] over one up-front heap allocation: the full capacity is
/// reserved at construction and `resize` hands out a growing prefix, so the
/// base never moves.
#[cfg(any(test, feature = "std"))]
pub struct HeapSource {
    buf: NonNull<u8>,
    capacity: usize,
    committed: usize,
}

#[cfg(any(test, feature = "std"))]
impl HeapSource {
    /// Reserve `capacity` bytes. Returns `None` when the host allocator
    /// fails or `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let layout = std::alloc::Layout::from_size_align(capacity, ALIGN_SIZE).ok()?;
        // Safety: `layout` has non-zero size.
        let buf = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        Some(Self {
            buf,
            capacity,
            committed: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// Safety: the buffer is exclusively owned by this value.
#[cfg(any(test, feature = "std"))]
unsafe impl Send for HeapSource {}

#[cfg(any(test, feature = "std"))]
unsafe impl PoolSource for HeapSource {
    unsafe fn resize(&mut self, req_bytes: usize) -> Option<NonNull<u8>> {
        if req_bytes > self.capacity {
            return None;
        }
        self.committed = req_bytes;
        Some(self.buf)
    }
}

#[cfg(any(test, feature = "std"))]
impl Drop for HeapSource {
    fn drop(&mut self) {
        // Safety: `buf` was allocated with this exact layout.
        unsafe {
            std::alloc::dealloc(
                self.buf.as_ptr(),
                std::alloc::Layout::from_size_align_unchecked(self.capacity, ALIGN_SIZE),
            );
        }
    }
}

/// A [`PoolSource`] over reserved address space: `reserve` maps `capacity`
/// bytes of inaccessible memory and `resize` commits or releases pages at
/// the tail, so a growable pool consumes physical memory proportional to
/// its live size.
#[cfg(unix)]
pub struct MmapSource {
    base: NonNull<u8>,
    capacity: usize,
    committed: usize,
    page_mask: usize,
}

#[cfg(unix)]
impl MmapSource {
    /// Reserve `capacity` bytes of address space without committing it.
    pub fn reserve(capacity: usize) -> Option<Self> {
        // Safety: sysconf is always safe to call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if !page_size.is_power_of_two() || capacity == 0 {
            return None;
        }
        let page_mask = page_size - 1;
        let capacity = capacity.checked_add(page_mask)? & !page_mask;

        // Safety: a fresh anonymous mapping with no requirements on `addr`.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                capacity,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }

        Some(Self {
            base: NonNull::new(ptr as *mut u8)?,
            capacity,
            committed: 0,
            page_mask,
        })
    }
}

// Safety: the mapping is exclusively owned by this value.
#[cfg(unix)]
unsafe impl Send for MmapSource {}

#[cfg(unix)]
unsafe impl PoolSource for MmapSource {
    unsafe fn resize(&mut self, req_bytes: usize) -> Option<NonNull<u8>> {
        if req_bytes > self.capacity {
            return None;
        }
        let new_committed = (req_bytes + self.page_mask) & !self.page_mask;

        if new_committed > self.committed {
            let rc = libc::mprotect(
                self.base.as_ptr().add(self.committed) as *mut _,
                new_committed - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if rc != 0 {
                return None;
            }
            self.committed = new_committed;
        } else if new_committed < self.committed {
            // Give the tail pages back; failure to do so is not an error
            // for the caller, the storage is merely retained.
            let rc = libc::mprotect(
                self.base.as_ptr().add(new_committed) as *mut _,
                self.committed - new_committed,
                libc::PROT_NONE,
            );
            if rc == 0 {
                self.committed = new_committed;
            }
        }

        Some(self.base)
    }
}

#[cfg(unix)]
impl Drop for MmapSource {
    fn drop(&mut self) {
        // Safety: `base`/`capacity` describe the mapping created in
        //         `reserve`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut _, self.capacity);
        }
    }
}
