//! A buddy-block memory pool.
//!
//! A [`Pool`] carves one power-of-two sized arena into power-of-two blocks.
//! Requests are served by splitting larger free blocks, and freed blocks are
//! coalesced with their buddies as soon as both halves are free.
//!
//! ```
//! use buddy_pool::{Global, Pool, PoolConfig};
//!
//! // A 1 KiB pool serving blocks from 16 to 256 bytes.
//! let mut pool = Pool::new_in(PoolConfig::new(1024, 4, 8), Global).unwrap();
//!
//! let block = pool.allocate(100).unwrap();
//! assert_eq!(pool.size_of(block.cast()).unwrap(), 128);
//!
//! pool.free(block.cast()).unwrap();
//! pool.delete().unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_pool/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods provided by the
// standard library on newer toolchains.
#![allow(unstable_name_collisions)]

use std::{collections::TryReserveError, io};

use thiserror::Error;

mod arena;
mod base;
mod bitmap;
mod buddy_map;
mod engine;
mod free_list;
pub mod pool;


#[cfg(unix)]
pub use crate::arena::Mmap;
pub use crate::{
    arena::{Backing, Global},
    pool::{Pool, PoolConfig, PoolStats},
};

/// The largest supported block-size exponent.
pub const MAX_EXPONENT: u32 = 50;

/// The broad category of a pool error.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The pool's parameters are impossible to satisfy.
    Configuration,
    /// The operating system or backing allocator failed.
    Resource,
    /// No free block is large enough for the request.
    Capacity,
    /// The caller passed an invalid argument.
    Usage,
}

/// The error type for pool constructors.
#[derive(Debug, Error)]
pub enum InitError {
    /// The requested pool size was zero.
    #[error("pool size must be nonzero")]
    ZeroSize,

    /// The lower exponent bound exceeds the upper bound.
    #[error("lower exponent {lower} exceeds upper exponent {upper}")]
    InvalidBounds {
        /// The requested lower exponent.
        lower: u32,
        /// The requested upper exponent.
        upper: u32,
    },

    /// The upper exponent is larger than the pool supports.
    #[error("upper exponent {upper} exceeds the maximum of {max}")]
    ExponentTooLarge {
        /// The requested upper exponent.
        upper: u32,
        /// The largest supported exponent.
        max: u32,
    },

    /// The rounded pool size cannot hold a single block of the upper size.
    #[error("{size} bytes is too small for blocks of 2^{upper} bytes")]
    TooSmallForUpper {
        /// The requested pool size.
        size: usize,
        /// The requested upper exponent.
        upper: u32,
    },

    /// The requested size cannot be rounded up to a power of two.
    #[error("{size} bytes cannot be rounded up to a power of two")]
    SizeOverflow {
        /// The requested pool size.
        size: usize,
    },

    /// The arena could not be reserved.
    #[error("failed to reserve an arena of {size} bytes")]
    MapFailed {
        /// The arena size that was requested from the backing.
        size: usize,
        /// The backing's error.
        #[source]
        source: io::Error,
    },

    /// The bookkeeping for the arena's blocks could not be allocated.
    #[error("failed to allocate block metadata for an arena of {size} bytes")]
    MetadataAlloc {
        /// The arena size.
        size: usize,
        /// The allocation error.
        #[source]
        source: TryReserveError,
    },
}

impl InitError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InitError::MapFailed { .. } | InitError::MetadataAlloc { .. } => ErrorKind::Resource,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an
/// unsupported request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The requested size is zero or larger than the largest block.
    #[error("cannot allocate {size} bytes; sizes must be between 1 and {max}")]
    InvalidSize {
        /// The requested size.
        size: usize,
        /// The largest block size of the pool.
        max: usize,
    },

    /// No free block is large enough.
    #[error("no free block of at least {size} bytes")]
    OutOfMemory {
        /// The requested size.
        size: usize,
    },
}

impl AllocError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::InvalidSize { .. } => ErrorKind::Usage,
            AllocError::OutOfMemory { .. } => ErrorKind::Capacity,
        }
    }
}

/// The error type for operations on an allocated block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FreeError {
    /// The pointer does not lie within the pool's arena.
    #[error("pointer does not belong to this pool")]
    OutOfBounds,

    /// The pointer does not start a block.
    #[error("offset {offset:#x} is not the start of a block")]
    Misaligned {
        /// The pointer's offset from the arena base.
        offset: usize,
    },

    /// No block is allocated at the pointer.
    #[error("offset {offset:#x} is not allocated")]
    NotAllocated {
        /// The pointer's offset from the arena base.
        offset: usize,
    },

    /// The block at the pointer is already on a free list.
    ///
    /// A block that was freed earlier and a top-level block that was never
    /// handed out are indistinguishable, so both report this error while the
    /// other member of their top-level pair is in use.
    #[error("block at offset {offset:#x} freed twice")]
    DoubleFree {
        /// The pointer's offset from the arena base.
        offset: usize,
    },
}

impl FreeError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Usage
    }
}

/// The error type for pool deletion.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The arena could not be returned to its backing.
    #[error("failed to release an arena of {size} bytes")]
    UnmapFailed {
        /// The arena size.
        size: usize,
        /// The backing's error.
        #[source]
        source: io::Error,
    },
}

impl ReleaseError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Resource
    }
}
