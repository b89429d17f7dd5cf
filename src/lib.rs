//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹ over caller-supplied memory pools.
//!
//!  - **Every allocation and deallocation completes in constant time,**
//!    independent of heap state or pool occupancy. TLSF is suitable for
//!    hard-real-time applications.
//!
//!  - **The memory pool is provided by an application.** A `static` array,
//!    a region carved out of another allocator, or address space committed
//!    on demand through a [`PoolSource`] all work.
//!
//!  - **A per-arena thread-safe facade** ([`ArenaTlsf`]) partitions one
//!    region into independent sub-pools with per-arena locking, so threads
//!    mapped to different arenas allocate with zero contention.
//!
//!  - **This crate supports `#![no_std]`.** Disable the default `std`
//!    feature for bare-metal and RTOS-based applications.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy,
//! 2004, pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## `Tlsf`: Core API
//!
//! ```rust
//! use tlsf_pool::Tlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//!
//! let mut tlsf: Tlsf = Tlsf::INIT;
//! let usable = tlsf.pool_init(&mut pool);
//! assert!(usable > 0);
//!
//! unsafe {
//!     let ptr1 = tlsf.allocate(8).unwrap().cast::<u64>();
//!     let ptr2 = tlsf.allocate(8).unwrap().cast::<u64>();
//!     *ptr1.as_ptr() = 42;
//!     *ptr2.as_ptr() = 56;
//!     assert_eq!(*ptr1.as_ptr(), 42);
//!     assert_eq!(*ptr2.as_ptr(), 56);
//!     tlsf.deallocate(ptr1.cast());
//!     tlsf.deallocate(ptr2.cast());
//! }
//! ```
//!
//! ## `ArenaTlsf`: Thread-safe facade
//!
//! ```rust
//! use tlsf_pool::ArenaTlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut region = vec![MaybeUninit::<u8>::uninit(); 1 << 20];
//! let arenas: ArenaTlsf = ArenaTlsf::new(&mut region).unwrap();
//!
//! let ptr = arenas.allocate(128).unwrap();
//! unsafe { arenas.deallocate(ptr) };
//! ```
//!
//! # Details
//!
//! ## Changes from the original algorithm
//!
//!  - The end of each memory pool is capped by a sentinel block (a zero-size,
//!    permanently used block) instead of a normal block with a
//!    last-block-in-pool flag.
//!
//!  - Free-list heads and links use `Option<NonNull<_>>` instead of an
//!    embedded null-sentinel block, so insertion and removal never write
//!    through an invalid pointer.
#![no_std]

mod arena;
pub mod int;
pub mod source;
mod tlsf;
mod utils;
pub use self::{
    arena::{ArenaTlsf, RawMutex, Spinlock, DEFAULT_ARENA_COUNT},
    source::PoolSource,
    tlsf::{
        usable_size, PoolStats, Tlsf, ALIGN_SIZE, BLOCK_OVERHEAD, FL_COUNT, FL_MAX,
        MAX_ALLOC_SIZE, SL_COUNT,
    },
};

#[cfg(any(test, feature = "std"))]
extern crate std;
