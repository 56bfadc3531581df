//! Per-level free lists and buddy bitmaps, and the split and coalesce
//! algorithms over them.

use std::{
    collections::{HashSet, TryReserveError},
    fmt,
};

use log::trace;

use crate::{
    base::Offset,
    buddy_map::BuddyMap,
    free_list::{Duplicate, FreeList, NodePool},
};

/// One level of the pool: every block at this level is `2^exp` bytes.
struct BuddyLevel {
    buddies: BuddyMap,
    free_list: FreeList,
}

impl BuddyLevel {
    #[inline]
    fn exp(&self) -> u32 {
        self.buddies.exp()
    }

    #[inline]
    fn block_size(&self) -> usize {
        1 << self.exp()
    }

    /// Pops the lowest free block and marks its pair.
    fn allocate_one(&mut self, nodes: &mut NodePool) -> Option<Offset> {
        let block = self.free_list.pop_front(nodes)?;
        self.buddies.set(block);

        Some(block)
    }

    /// Returns `true` if the buddy of `block` is on this level's free list.
    ///
    /// A buddy lying past the end of the region never exists, so it is
    /// reported as free.
    fn buddy_is_free(&self, nodes: &NodePool, block: Offset, region_size: usize) -> bool {
        let buddy = self.buddies.buddy_of(block);

        buddy.get() >= region_size || self.free_list.contains(nodes, buddy)
    }
}

/// The free lists and buddy bitmaps of every level of a pool.
pub struct Engine {
    size: usize,
    lower: u32,
    upper: u32,
    /// Levels in ascending order of block size; `levels[i]` holds blocks of
    /// `2^(lower + i)` bytes.
    levels: Vec<BuddyLevel>,
    nodes: NodePool,
}

impl Engine {
    /// Builds the levels for a region of `size` bytes.
    ///
    /// The top level is seeded with `ceil(size / 2^upper)` free blocks
    /// covering the whole region.
    ///
    /// # Errors
    ///
    /// Returns an error if the bitmaps or the seed list nodes cannot be
    /// allocated.
    pub fn new(size: usize, lower: u32, upper: u32) -> Result<Engine, TryReserveError> {
        assert!(lower <= upper);
        assert!(size >= 1 << upper);

        let levels = (lower..=upper)
            .map(|exp| {
                Ok(BuddyLevel {
                    buddies: BuddyMap::new(size, exp)?,
                    free_list: FreeList::new(),
                })
            })
            .collect::<Result<Vec<_>, TryReserveError>>()?;

        let num_blocks = size.div_ceil(1 << upper);

        let mut engine = Engine {
            size,
            lower,
            upper,
            levels,
            nodes: NodePool::with_capacity(num_blocks)?,
        };

        let Engine { levels, nodes, .. } = &mut engine;
        let top = levels.last_mut().unwrap();

        // Seed from the highest offset down so each push lands at the head.
        for idx in (0..num_blocks).rev() {
            top.free_list
                .push_front(nodes, Offset::new(idx * top.block_size()));
        }

        Ok(engine)
    }

    #[inline]
    pub fn lower(&self) -> u32 {
        self.lower
    }

    #[inline]
    pub fn upper(&self) -> u32 {
        self.upper
    }

    #[inline]
    fn level(&self, exp: u32) -> &BuddyLevel {
        &self.levels[(exp - self.lower) as usize]
    }

    /// Allocates a block of `2^exp` bytes.
    ///
    /// Exponents below the lowest level are raised to it. Returns `None` if no
    /// free block of at least that size exists.
    pub fn allocate(&mut self, exp: u32) -> Option<Offset> {
        let exp = exp.max(self.lower);
        if exp > self.upper {
            return None;
        }

        let lower = self.lower;
        let Engine { levels, nodes, .. } = self;
        let target = (exp - lower) as usize;

        // If there is a free block of the correct size, return it immediately.
        if let Some(block) = levels[target].allocate_one(nodes) {
            trace!("allocated {block:?} from level {exp}");
            return Some(block);
        }

        // Otherwise, scan increasing block sizes until a free block is found.
        let found = (target + 1..levels.len()).find(|&li| !levels[li].free_list.is_empty())?;
        let mut block = levels[found].allocate_one(nodes)?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for li in (target..found).rev() {
            let level = &mut levels[li];
            let back_half = block.add(level.block_size());

            trace!(
                "splitting {block:?} into {block:?} and {back_half:?} at level {}",
                level.exp()
            );

            debug_assert!(level.free_list.is_empty(), "split into a non-empty level");
            debug_assert!(!level.buddies.test(block), "split pair already marked");

            level.free_list.push_front(nodes, back_half);
            level.free_list.push_front(nodes, block);

            block = level.allocate_one(nodes)?;
        }

        trace!("allocated {block:?} from level {exp}");

        Some(block)
    }

    /// Returns the block at `block`, of `2^exp` bytes, to the free lists and
    /// coalesces it with its buddy as far up as possible.
    ///
    /// # Errors
    ///
    /// Returns `Err(Duplicate)` if the block is already free. Nothing is
    /// modified in that case.
    pub fn free(&mut self, block: Offset, exp: u32) -> Result<(), Duplicate> {
        let (size, lower, upper) = (self.size, self.lower, self.upper);
        let Engine { levels, nodes, .. } = self;

        let mut exp = exp;
        let mut block = block;

        levels[(exp - lower) as usize]
            .free_list
            .insert_sorted(nodes, block)?;

        loop {
            let level = &mut levels[(exp - lower) as usize];
            let buddy_free = level.buddy_is_free(nodes, block, size);

            if exp == upper {
                // Top-level blocks never merge; the pair is clear once both
                // of its members are free.
                if buddy_free {
                    level.buddies.clear(block);
                }

                return Ok(());
            }

            if !buddy_free {
                trace!("freed {block:?} at level {exp}");
                return Ok(());
            }

            let buddy = level.buddies.buddy_of(block);
            let merged = level.buddies.left_of(block);

            level.buddies.clear(block);
            let removed =
                level.free_list.remove(nodes, block) && level.free_list.remove(nodes, buddy);
            assert!(removed, "buddy pair missing from level {exp} free list");

            trace!("merged {block:?} and {buddy:?} into {merged:?} at level {}", exp + 1);

            exp += 1;
            block = merged;

            let parent = &mut levels[(exp - lower) as usize];
            debug_assert!(parent.buddies.test(block), "merged into an unmarked pair");
            if parent.free_list.insert_sorted(nodes, block).is_err() {
                panic!("merged block {block:?} already free at level {exp}");
            }
        }
    }

    /// Returns the exponent of the allocated block starting at `block`.
    ///
    /// Scans down from the top level while the pair containing `block` stays
    /// marked; the block lives at the lowest marked level. Returns `None` if
    /// the top-level pair is clear, which means nothing at `block` can be
    /// allocated.
    pub fn size_of(&self, block: Offset) -> Option<u32> {
        if !self.level(self.upper).buddies.test(block) {
            return None;
        }

        let mut exp = self.upper;
        while exp > self.lower && self.level(exp - 1).buddies.test(block) {
            exp -= 1;
        }

        Some(exp)
    }

    /// Returns `true` if `block` is on the free list for `exp`.
    pub fn is_free(&self, block: Offset, exp: u32) -> bool {
        self.level(exp).free_list.contains(&self.nodes, block)
    }

    /// Iterates over the free blocks of `2^exp` bytes.
    pub fn free_blocks(&self, exp: u32) -> impl Iterator<Item = Offset> + '_ {
        self.level(exp).free_list.iter(&self.nodes)
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.levels
            .iter()
            .map(|l| l.free_list.len() * l.block_size())
            .sum()
    }

    /// Walks every level and verifies that the bitmaps agree with the free
    /// lists and that no two free buddies were left unmerged.
    pub fn check(&self) -> bool {
        let mut marked: Vec<HashSet<usize>> = vec![HashSet::new(); self.levels.len()];
        let mut free_seen = 0;

        let top_size = 1 << self.upper;
        let num_top = self.size.div_ceil(top_size);
        let mut top_states = Vec::with_capacity(num_top);
        for idx in 0..num_top {
            let block = Offset::new(idx * top_size);
            match self.walk(block, self.upper, &mut marked, &mut free_seen) {
                Some(state) => top_states.push((block, state)),
                None => return false,
            }
        }

        for (block, state) in top_states {
            if state != BlockState::Free {
                marked[(self.upper - self.lower) as usize]
                    .insert(self.level(self.upper).buddies.bit_index(block));
            }
        }

        // Every listed block must have been reached by the walk.
        if free_seen != self.nodes.live() {
            return false;
        }

        self.levels
            .iter()
            .zip(&marked)
            .all(|(level, expected)| {
                level.buddies.count() == expected.len()
                    && expected.iter().all(|&bit| level.buddies.bitmap().get(bit))
            })
    }

    /// Classifies the block at `block` and, if it is split, its descendants.
    ///
    /// Returns `None` on an inconsistency.
    fn walk(
        &self,
        block: Offset,
        exp: u32,
        marked: &mut [HashSet<usize>],
        free_seen: &mut usize,
    ) -> Option<BlockState> {
        if self.is_free(block, exp) {
            *free_seen += 1;
            return Some(BlockState::Free);
        }

        if exp == self.lower || !self.level(exp - 1).buddies.test(block) {
            return Some(BlockState::Allocated);
        }

        let half = exp - 1;
        let left = self.walk(block, half, marked, free_seen)?;
        let right = self.walk(block.add(1 << half), half, marked, free_seen)?;

        if left == BlockState::Free && right == BlockState::Free {
            // Two free buddies should have been merged.
            return None;
        }

        marked[(half - self.lower) as usize].insert(self.level(half).buddies.bit_index(block));

        Some(BlockState::Split)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BlockState {
    Free,
    Allocated,
    Split,
}

/// Renders each level's bitmap and free list, largest blocks first.
impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for level in self.levels.iter().rev() {
            write!(
                f,
                "level {:>2} ({} bytes): bitmap [{:x}] free [",
                level.exp(),
                level.block_size(),
                level.buddies.bitmap()
            )?;

            let mut first = true;
            for block in level.free_list.iter(&self.nodes) {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{block}")?;
                first = false;
            }

            f.write_str("]\n")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("size", &self.size)
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("free_bytes", &self.free_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_list(engine: &Engine, exp: u32) -> Vec<usize> {
        engine.free_blocks(exp).map(Offset::get).collect()
    }

    #[test]
    fn seeds_top_level() {
        let engine = Engine::new(128, 3, 5).unwrap();

        assert_eq!(free_list(&engine, 5), [0, 32, 64, 96]);
        assert!(free_list(&engine, 4).is_empty());
        assert!(free_list(&engine, 3).is_empty());
        assert_eq!(engine.free_bytes(), 128);
        assert!(engine.check());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_metadata_is_an_error() {
        assert!(Engine::new(1 << 60, 0, 0).is_err());
    }

    #[test]
    fn split_and_coalesce() {
        let mut engine = Engine::new(64, 3, 5).unwrap();

        let a = engine.allocate(4).unwrap();
        assert_eq!(a, Offset::new(0));
        assert_eq!(free_list(&engine, 5), [32]);
        assert_eq!(free_list(&engine, 4), [16]);

        let b = engine.allocate(3).unwrap();
        assert_eq!(b, Offset::new(16));
        assert_eq!(free_list(&engine, 4), Vec::<usize>::new());
        assert_eq!(free_list(&engine, 3), [24]);
        assert!(engine.check());

        assert_eq!(engine.size_of(a), Some(4));
        assert_eq!(engine.size_of(b), Some(3));

        engine.free(b, 3).unwrap();
        assert_eq!(free_list(&engine, 4), [16]);
        assert!(free_list(&engine, 3).is_empty());

        engine.free(a, 4).unwrap();
        assert_eq!(free_list(&engine, 5), [0, 32]);
        assert!(free_list(&engine, 4).is_empty());
        assert_eq!(engine.free_bytes(), 64);
        assert!(engine.check());
    }

    #[test]
    fn exponent_is_raised_to_lower() {
        let mut engine = Engine::new(64, 3, 5).unwrap();

        let a = engine.allocate(0).unwrap();
        assert_eq!(engine.size_of(a), Some(3));
    }

    #[test]
    fn exhaustion() {
        let mut engine = Engine::new(32, 4, 5).unwrap();

        assert!(engine.allocate(4).is_some());
        assert!(engine.allocate(4).is_some());
        assert_eq!(engine.allocate(4), None);
        assert_eq!(engine.allocate(5), None);
        assert_eq!(engine.allocate(6), None);
        assert_eq!(engine.free_bytes(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut engine = Engine::new(64, 3, 5).unwrap();

        let a = engine.allocate(3).unwrap();
        let _b = engine.allocate(3).unwrap();

        engine.free(a, 3).unwrap();
        assert_eq!(engine.free(a, 3), Err(Duplicate(a)));
        assert!(engine.check());
    }

    #[test]
    fn freed_region_is_not_allocated() {
        let mut engine = Engine::new(64, 3, 5).unwrap();

        let a = engine.allocate(3).unwrap();
        engine.free(a, 3).unwrap();

        assert_eq!(engine.size_of(a), None);
    }

    #[test]
    fn top_level_pair_stays_marked_while_buddy_is_used() {
        let mut engine = Engine::new(64, 5, 5).unwrap();

        let a = engine.allocate(5).unwrap();
        let b = engine.allocate(5).unwrap();
        assert_eq!((a.get(), b.get()), (0, 32));

        engine.free(a, 5).unwrap();
        assert_eq!(engine.size_of(b), Some(5));
        assert!(engine.check());

        engine.free(b, 5).unwrap();
        assert_eq!(engine.size_of(a), None);
        assert_eq!(engine.size_of(b), None);
        assert!(engine.check());
    }

    #[test]
    fn single_top_block_has_no_buddy() {
        let mut engine = Engine::new(32, 2, 5).unwrap();

        let a = engine.allocate(5).unwrap();
        assert_eq!(engine.size_of(a), Some(5));
        engine.free(a, 5).unwrap();
        assert_eq!(engine.size_of(a), None);
        assert!(engine.check());
    }

    #[test]
    fn display_lists_levels() {
        let mut engine = Engine::new(64, 3, 5).unwrap();
        engine.allocate(3).unwrap();

        let text = engine.to_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "level  5 (32 bytes): bitmap [01] free [0x20]");
        assert_eq!(lines[1], "level  4 (16 bytes): bitmap [01] free [0x10]");
        assert_eq!(lines[2], "level  3 (8 bytes): bitmap [01] free [0x8]");
    }
}
