//! Buddy bitmaps.
//!
//! A buddy bitmap holds one bit per *pair* of same-sized blocks rather than
//! one bit per block. Both members of a pair map to the same bit, which is set
//! while the pair is not fully free: one or both halves are allocated, or
//! split into smaller blocks.

use std::{collections::TryReserveError, fmt};

use crate::{base::Offset, bitmap::Bitmap};

/// The buddy bitmap for a single level of a pool.
pub struct BuddyMap {
    exp: u32,
    bits: Bitmap,
}

impl BuddyMap {
    /// Returns the number of buddy pairs at level `exp` in a region of `size`
    /// bytes.
    pub fn map_size(size: usize, exp: u32) -> usize {
        let blocks = size.div_ceil(1 << exp);
        blocks.div_ceil(2)
    }

    /// Creates a cleared buddy bitmap for level `exp` of a region of `size`
    /// bytes.
    pub fn new(size: usize, exp: u32) -> Result<BuddyMap, TryReserveError> {
        Ok(BuddyMap {
            exp,
            bits: Bitmap::new(Self::map_size(size, exp))?,
        })
    }

    #[inline]
    pub fn exp(&self) -> u32 {
        self.exp
    }

    /// Retrieves the index of the buddy bit for the block at `ofs`.
    ///
    /// The offset is first moved to the left member of its pair, so both
    /// buddies yield the same index.
    #[inline]
    pub fn bit_index(&self, ofs: Offset) -> usize {
        let left = ofs.with_bit_cleared(self.exp);
        (left.get() >> self.exp) / 2
    }

    /// Retrieves the offset of the buddy of the block at `ofs`.
    #[inline]
    pub fn buddy_of(&self, ofs: Offset) -> Offset {
        ofs.with_bit_inverted(self.exp)
    }

    /// Returns the lower member of the pair containing `ofs`.
    #[inline]
    pub fn left_of(&self, ofs: Offset) -> Offset {
        ofs.with_bit_cleared(self.exp)
    }

    #[inline]
    pub fn set(&mut self, ofs: Offset) {
        let bit = self.bit_index(ofs);
        self.bits.set(bit, true);
    }

    #[inline]
    pub fn clear(&mut self, ofs: Offset) {
        let bit = self.bit_index(ofs);
        self.bits.set(bit, false);
    }

    #[inline]
    pub fn test(&self, ofs: Offset) -> bool {
        self.bits.get(self.bit_index(ofs))
    }

    /// Returns the number of pairs currently marked.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bits
    }
}

impl fmt::Debug for BuddyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyMap")
            .field("exp", &self.exp)
            .field("bits", &self.bits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing() {
        assert_eq!(BuddyMap::map_size(64, 5), 1);
        assert_eq!(BuddyMap::map_size(64, 4), 2);
        assert_eq!(BuddyMap::map_size(64, 3), 4);
        assert_eq!(BuddyMap::map_size(64, 6), 1);
        assert_eq!(BuddyMap::map_size(64, 0), 32);
        assert_eq!(BuddyMap::map_size(96, 5), 2);
    }

    #[test]
    fn buddies_share_a_bit() {
        let map = BuddyMap::new(1024, 4).unwrap();

        for pair in 0..32 {
            let left = Offset::new(pair * 32);
            let right = left.add(16);

            assert_eq!(map.bit_index(left), pair);
            assert_eq!(map.bit_index(right), pair);
            assert_eq!(map.buddy_of(left), right);
            assert_eq!(map.buddy_of(right), left);
            assert_eq!(map.left_of(left), left);
            assert_eq!(map.left_of(right), left);
        }
    }

    #[test]
    fn set_clear_test() {
        let mut map = BuddyMap::new(64, 3).unwrap();

        map.set(Offset::new(8));
        assert!(map.test(Offset::new(0)));
        assert!(map.test(Offset::new(8)));
        assert!(!map.test(Offset::new(16)));
        assert_eq!(map.count(), 1);

        map.clear(Offset::new(0));
        assert!(!map.test(Offset::new(8)));
        assert_eq!(map.count(), 0);
    }
}
