use std::{fmt, num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

/// A byte offset from the base of an arena.
///
/// Blocks are tracked by offset rather than by address; a pointer to a block
/// must be rebuilt from the arena's [`BasePtr`], never by casting an offset.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(usize);

impl Offset {
    #[inline]
    pub const fn new(ofs: usize) -> Offset {
        Offset(ofs)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the offset `n` bytes past `self`.
    #[inline]
    pub fn add(self, n: usize) -> Offset {
        Offset(self.0.checked_add(n).expect("offset overflows usize"))
    }

    #[inline]
    pub const fn with_bit_cleared(self, exp: u32) -> Offset {
        Offset(self.0 & !(1 << exp))
    }

    #[inline]
    pub const fn with_bit_inverted(self, exp: u32) -> Offset {
        Offset(self.0 ^ (1 << exp))
    }

    /// Returns `true` if the offset is a multiple of `2^exp`.
    #[inline]
    pub const fn is_aligned_to(self, exp: u32) -> bool {
        self.0 & ((1 << exp) - 1) == 0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A pointer to the base of the region of memory managed by a pool.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.as_ptr()
            .addr()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        // The pointer is non-null, so its address is non-zero.
        NonZeroUsize::new(self.ptr.as_ptr().addr()).unwrap()
    }

    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: usize) -> bool {
        self.addr().get() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `ptr`.
    ///
    /// Returns `None` if `ptr` lies outside the region.
    #[inline]
    pub fn offset_to(self, ptr: NonNull<u8>) -> Option<Offset> {
        let addr = ptr.as_ptr().addr();

        self.contains_addr(addr)
            .then(|| Offset(addr - self.addr().get()))
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: Offset) -> NonNull<u8> {
        debug_assert!(ofs.get() < self.extent, "offset {ofs:?} out of region");

        let addr = self.addr().get() + ofs.get();
        let raw = self.ptr.as_ptr().with_addr(addr);

        // `addr` lies within the region, which does not wrap around.
        NonNull::new(raw).unwrap()
    }

    /// Creates a slice pointer of `len` bytes at the given offset.
    #[inline]
    pub fn with_offset_and_size(self, ofs: Offset, len: usize) -> NonNull<[u8]> {
        debug_assert!(ofs.get().checked_add(len).unwrap() <= self.extent);

        NonNull::slice_from_raw_parts(self.with_offset(ofs), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_bit_ops() {
        let ofs = Offset::new(0b1010_0000);

        assert_eq!(ofs.with_bit_cleared(5), Offset::new(0b1000_0000));
        assert_eq!(ofs.with_bit_inverted(5), Offset::new(0b1000_0000));
        assert_eq!(ofs.with_bit_inverted(6), Offset::new(0b1110_0000));
        assert!(ofs.is_aligned_to(5));
        assert!(!ofs.is_aligned_to(6));
        assert!(Offset::new(0).is_aligned_to(40));
    }

    #[test]
    fn round_trip_through_base() {
        let mut buf = vec![0u8; 64];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let base = BasePtr::new(ptr, buf.len());

        let p = base.with_offset(Offset::new(24));
        assert_eq!(base.offset_to(p), Some(Offset::new(24)));
        assert_eq!(base.offset_to(ptr), Some(Offset::new(0)));

        let past_end = NonNull::new(ptr.as_ptr().wrapping_add(64)).unwrap();
        assert_eq!(base.offset_to(past_end), None);
    }
}
