use std::{collections::TryReserveError, fmt};

/// A fixed-length array of bits packed into `u64` words.
pub struct Bitmap {
    num_bits: usize,
    map: Box<[u64]>,
}

impl Bitmap {
    /// Constructs a new bitmap of `num_bits` bits, all clear.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage for the bits cannot be allocated.
    pub fn new(num_bits: usize) -> Result<Bitmap, TryReserveError> {
        let num_blocks = Self::num_blocks(num_bits);

        let mut map = Vec::new();
        map.try_reserve_exact(num_blocks)?;
        map.resize(num_blocks, 0);

        Ok(Bitmap {
            num_bits,
            map: map.into_boxed_slice(),
        })
    }

    /// Returns the number of `u64` words needed to hold `num_bits` bits.
    #[inline]
    pub fn num_blocks(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    #[inline]
    fn check(&self, index: usize) {
        assert!(
            index < self.len(),
            "bitmap index {index} out of range for {} bits",
            self.len()
        );
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.check(index);

        let (block_idx, mask) = Self::index_and_mask(index);
        self.map[block_idx] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        self.check(index);

        let (block_idx, mask) = Self::index_and_mask(index);
        let block = &mut self.map[block_idx];
        *block = match value {
            true => *block | mask,
            false => *block & !mask,
        };
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.map.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the bytes holding the bits, lowest byte first.
    fn bytes(&self) -> Vec<u8> {
        let num_bytes = self.num_bits.div_ceil(8);
        self.map
            .iter()
            .flat_map(|b| b.to_le_bytes())
            .take(num_bytes)
            .collect()
    }
}

/// Renders the bitmap as hex bytes, highest byte first.
impl fmt::LowerHex for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for byte in self.bytes().into_iter().rev() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
            first = false;
        }

        Ok(())
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("num_bits", &self.num_bits)
            .field("map", &format_args!("{self:x}"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let b = Bitmap::new(num_bits).unwrap();
            assert_eq!(b.len(), num_bits);
            assert_eq!(b.count_ones(), 0);
        }
    }

    #[test]
    fn set_and_clear() {
        let mut b = Bitmap::new(130).unwrap();

        b.set(0, true);
        b.set(64, true);
        b.set(129, true);
        assert!(b.get(0) && b.get(64) && b.get(129));
        assert!(!b.get(1) && !b.get(63) && !b.get(128));
        assert_eq!(b.count_ones(), 3);

        b.set(64, false);
        assert!(!b.get(64));
        assert_eq!(b.count_ones(), 2);
    }

    #[test]
    fn oversized_bitmap_is_an_error() {
        assert!(Bitmap::new(usize::MAX).is_err());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn get_out_of_range() {
        let b = Bitmap::new(8).unwrap();
        b.get(8);
    }

    #[test]
    fn empty_bitmap_renders_nothing() {
        let b = Bitmap::new(0).unwrap();
        assert_eq!(format!("{b:x}"), "");
    }

    #[test]
    fn hex_rendering() {
        let mut b = Bitmap::new(12).unwrap();
        b.set(0, true);
        b.set(9, true);
        assert_eq!(format!("{b:x}"), "02 01");
    }
}
