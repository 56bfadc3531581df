//! Buddy-block pools.
//!
//! A pool reserves a single arena whose size is a power of two and manages it
//! as a set of levels, one per block size `2^lower ..= 2^upper`. Each level
//! has an address-ordered free list and a buddy bitmap holding one bit per
//! pair of blocks.
//!
//! Allocation takes the lowest free block of the requested size. If there is
//! none, the nearest larger free block is split in half repeatedly until a
//! block of the right size is produced. Freeing a block coalesces it with its
//! buddy, and the result with its own buddy, for as long as both halves are
//! free.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                   |
//! |--------------------------|-----------|------------------------------|
//! | Allocate                 | O(1)      | O(levels)                    |
//! | Free                     | O(1)      | O(levels × free blocks)      |
//! | Size query               | O(1)      | O(levels)                    |
//!
//! #### Fragmentation
//!
//! Every request is rounded up to a power of two no smaller than `2^lower`,
//! so internal fragmentation is at most half of each block. Blocks are always
//! fully coalesced when freed.

use std::{fmt, fmt::Write as _, num::NonZeroUsize, ptr::NonNull};

use log::debug;

#[cfg(unix)]
use crate::arena::Mmap;

use crate::{
    arena::{Arena, Backing},
    base::Offset,
    engine::Engine,
    AllocError, FreeError, InitError, ReleaseError, MAX_EXPONENT,
};

/// The parameters of a [`Pool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// The requested arena size in bytes. It is rounded up to a power of two.
    pub size: usize,
    /// The exponent of the smallest block size.
    pub lower: u32,
    /// The exponent of the largest block size.
    pub upper: u32,
    /// A preferred base address for the arena.
    pub hint: Option<NonZeroUsize>,
}

impl PoolConfig {
    /// Creates a configuration for a pool of `size` bytes serving blocks of
    /// `2^lower` to `2^upper` bytes.
    pub fn new(size: usize, lower: u32, upper: u32) -> PoolConfig {
        PoolConfig {
            size,
            lower,
            upper,
            hint: None,
        }
    }

    /// Sets the preferred base address of the arena.
    pub fn with_hint(self, hint: NonZeroUsize) -> PoolConfig {
        PoolConfig {
            hint: Some(hint),
            ..self
        }
    }

    /// Returns the largest upper exponent supported on this target.
    pub fn max_exponent() -> u32 {
        MAX_EXPONENT.min(usize::BITS - 2)
    }

    /// Checks the configuration and returns the arena size it implies.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero, the bounds are out of order or
    /// too large, or the rounded size cannot hold a block of `2^upper` bytes.
    pub fn validate(&self) -> Result<usize, InitError> {
        let PoolConfig {
            size, lower, upper, ..
        } = *self;

        if size == 0 {
            return Err(InitError::ZeroSize);
        }

        if lower > upper {
            return Err(InitError::InvalidBounds { lower, upper });
        }

        let max = Self::max_exponent();
        if upper > max {
            return Err(InitError::ExponentTooLarge { upper, max });
        }

        let arena_size = size
            .checked_next_power_of_two()
            .ok_or(InitError::SizeOverflow { size })?;

        if arena_size < 1 << upper {
            return Err(InitError::TooSmallForUpper { size, upper });
        }

        Ok(arena_size)
    }
}

/// A snapshot of a pool's usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// The size of the arena in bytes.
    pub arena_size: usize,
    /// The total size of all free blocks.
    pub free_bytes: usize,
    /// The total size of all allocated blocks, after rounding.
    pub allocated_bytes: usize,
    /// The number of outstanding allocations.
    pub allocations: usize,
}

/// A buddy-block memory pool.
///
/// For a discussion of the algorithm, see the [module-level documentation].
///
/// The pool is not synchronized; wrap it in a `Mutex` to share it between
/// threads.
///
/// [module-level documentation]: crate::pool
pub struct Pool<B: Backing> {
    // The engine is declared first so that it is dropped before the arena.
    engine: Engine,
    arena: Arena<B>,
    allocated_bytes: usize,
    allocations: usize,
}

#[cfg(unix)]
impl Pool<Mmap> {
    /// Constructs a new pool backed by an anonymous memory mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the mapping fails.
    pub fn new(config: PoolConfig) -> Result<Pool<Mmap>, InitError> {
        Pool::new_in(config, Mmap)
    }

    /// Constructs a pool of at least `size` bytes serving blocks of
    /// `2^lower` to `2^upper` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or the mapping fails.
    pub fn create(size: usize, lower: u32, upper: u32) -> Result<Pool<Mmap>, InitError> {
        Pool::new(PoolConfig::new(size, lower, upper))
    }
}

impl<B: Backing> Pool<B> {
    /// Constructs a new pool whose arena is reserved from `backing`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the arena cannot be
    /// reserved.
    pub fn new_in(config: PoolConfig, backing: B) -> Result<Pool<B>, InitError> {
        let arena_size = config.validate()?;

        let arena = Arena::reserve(arena_size, config.hint, backing).map_err(|source| {
            InitError::MapFailed {
                size: arena_size,
                source,
            }
        })?;

        let engine = Engine::new(arena_size, config.lower, config.upper).map_err(|source| {
            InitError::MetadataAlloc {
                size: arena_size,
                source,
            }
        })?;

        debug!(
            "created pool of {arena_size} bytes at {:p}, levels {}..={}",
            arena.base().ptr(),
            config.lower,
            config.upper
        );

        Ok(Pool {
            engine,
            arena,
            allocated_bytes: 0,
            allocations: 0,
        })
    }

    /// Returns the exponent of the smallest block size.
    #[inline]
    pub fn lower(&self) -> u32 {
        self.engine.lower()
    }

    /// Returns the exponent of the largest block size.
    #[inline]
    pub fn upper(&self) -> u32 {
        self.engine.upper()
    }

    /// Returns a pointer to the start of the arena.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.arena.base().ptr()
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.arena.size()
    }

    /// Returns `true` if `ptr` lies within the arena.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena.base().offset_to(ptr).is_some()
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The block is `2^e` bytes, where `e` is the smallest exponent no lower
    /// than [`lower`] with `2^e >= size`. The returned slice is `size` bytes
    /// long and its contents are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidSize`] if `size` is zero or larger than
    /// `2^upper`, and [`AllocError::OutOfMemory`] if no free block is large
    /// enough.
    ///
    /// [`lower`]: Pool::lower
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let max = 1 << self.upper();
        if size == 0 || size > max {
            return Err(AllocError::InvalidSize { size, max });
        }

        let exp = size.next_power_of_two().trailing_zeros().max(self.lower());

        let block = self
            .engine
            .allocate(exp)
            .ok_or(AllocError::OutOfMemory { size })?;

        self.allocated_bytes += 1 << exp;
        self.allocations += 1;

        Ok(self.arena.base().with_offset_and_size(block, size))
    }

    /// Finds the offset and exponent of the allocated block at `ptr`.
    fn locate(&self, ptr: NonNull<u8>) -> Result<(Offset, u32), FreeError> {
        let block = self
            .arena
            .base()
            .offset_to(ptr)
            .ok_or(FreeError::OutOfBounds)?;
        let offset = block.get();

        if !block.is_aligned_to(self.lower()) {
            return Err(FreeError::Misaligned { offset });
        }

        let exp = self
            .engine
            .size_of(block)
            .ok_or(FreeError::NotAllocated { offset })?;

        if !block.is_aligned_to(exp) {
            return Err(FreeError::Misaligned { offset });
        }

        Ok((block, exp))
    }

    /// Returns the size of the block allocated at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` is not the start of an allocated block.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Result<usize, FreeError> {
        let (block, exp) = self.locate(ptr)?;

        if self.engine.is_free(block, exp) {
            return Err(FreeError::NotAllocated {
                offset: block.get(),
            });
        }

        Ok(1 << exp)
    }

    /// Frees the block allocated at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` is not the start of an allocated block,
    /// including when the block has already been freed. The pool is left
    /// unchanged on error.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let (block, exp) = self.locate(ptr)?;

        self.engine
            .free(block, exp)
            .map_err(|_| FreeError::DoubleFree {
                offset: block.get(),
            })?;

        self.allocated_bytes -= 1 << exp;
        self.allocations -= 1;

        Ok(())
    }

    /// Returns a snapshot of the pool's usage.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            arena_size: self.arena_size(),
            free_bytes: self.engine.free_bytes(),
            allocated_bytes: self.allocated_bytes,
            allocations: self.allocations,
        }
    }

    /// Returns the offsets of the free blocks of `2^exp` bytes, in ascending
    /// order.
    ///
    /// Returns an empty list if `exp` is outside `lower..=upper`.
    pub fn free_blocks(&self, exp: u32) -> Vec<usize> {
        if !(self.lower()..=self.upper()).contains(&exp) {
            return Vec::new();
        }

        self.engine.free_blocks(exp).map(Offset::get).collect()
    }

    /// Verifies that every level's buddy bitmap agrees with its free list and
    /// that no pair of free buddies is left unmerged.
    pub fn check(&self) -> bool {
        self.engine.check()
    }

    /// Renders the bitmaps and free lists of every level.
    ///
    /// The format is meant for debugging and may change.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        // Writing to a `String` cannot fail.
        let _ = writeln!(
            out,
            "pool at {:p}: {} bytes, levels {}..={}, {} allocated in {} blocks",
            self.base(),
            self.arena_size(),
            self.lower(),
            self.upper(),
            self.allocated_bytes,
            self.allocations
        );
        let _ = write!(out, "{}", self.engine);

        out
    }

    /// Destroys the pool and releases its arena.
    ///
    /// All outstanding allocations are invalidated. Dropping the pool has the
    /// same effect, but cannot report a failure to release the arena.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing fails to release the arena.
    pub fn delete(self) -> Result<(), ReleaseError> {
        let Pool { engine, arena, .. } = self;
        let size = arena.size();

        drop(engine);
        arena
            .release()
            .map_err(|source| ReleaseError::UnmapFailed { size, source })?;

        debug!("deleted pool of {size} bytes");

        Ok(())
    }
}

impl<B: Backing> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("arena", &self.arena)
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .field("stats", &self.stats())
            .finish()
    }
}
