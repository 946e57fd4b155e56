//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹ with a sharded thread-safe wrapper on top.
//!
//!  - **Allocation, deallocation, and in-place reallocation are guaranteed
//!    to complete in constant time.** TLSF is suitable for real-time
//!    applications.
//!
//!  - **Bounded internal fragmentation.** With 32 second-level bins,
//!    overhead for requests beyond the linear regime stays below
//!    1/32 ≈ 3.1% plus alignment slack.
//!
//!  - **The memory pool is provided by an application.** A pool is either
//!    bound to a fixed region ([`Tlsf::bind_pool`]) or grows on demand
//!    through a [`PoolSource`] resize callback.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal
//!    and RTOS-based applications.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## `Tlsf`: Single-pool core
//!
//! ```rust
//! use shardalloc::Tlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! let mut tlsf: Tlsf = Tlsf::INIT;
//! // Safety: `tlsf` stays in place for the rest of this scope
//! let usable = unsafe { tlsf.bind_pool(&mut pool) };
//! assert!(usable > 0);
//!
//! let ptr = tlsf.allocate(100).unwrap();
//! unsafe { tlsf.deallocate(ptr) };
//! ```
//!
//! ## `ShardedTlsf`: Thread-safe sharding
//!
//! ```rust
//! use shardalloc::ShardedTlsf;
//! use std::ptr::NonNull;
//!
//! let pool: &'static mut [u8] = Box::leak(vec![0u8; 1 << 20].into_boxed_slice());
//! let shard: &'static mut ShardedTlsf = Box::leak(Box::new(ShardedTlsf::INIT));
//! // Safety: both the region and the shard are leaked and never move
//! let usable = unsafe { shard.init(NonNull::from(pool)) };
//! assert!(usable > 0);
//!
//! let ptr = shard.allocate(100).unwrap();
//! unsafe { shard.deallocate(ptr) };
//! ```
//!
//! # Details
//!
//! ## Changes from the original algorithm
//!
//!  - Every bin's free list is terminated by a shared sentinel block that
//!    absorbs link writes, so the list insert/remove hot paths contain no
//!    branches on list emptiness.
//!
//!  - The physical end of a pool is capped by a zero-size sentinel block,
//!    which lets the coalescing code step to the next block unconditionally.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod init;
mod shard;
mod source;
mod tlsf;
mod utils;
pub use self::{
    init::*,
    shard::*,
    source::*,
    tlsf::{
        usable_size, PoolStats, Tlsf, ALIGN_SIZE, BLOCK_OVERHEAD, BLOCK_SIZE_MIN,
        BLOCK_SIZE_SMALL, FL_COUNT_DEFAULT, SL_COUNT, SPLIT_THRESHOLD_DEFAULT,
    },
};

#[cfg(any(test, feature = "std"))]
extern crate std;
