//! Address-ordered free lists backed by a shared node pool.
//!
//! Each level of a pool keeps a singly linked list of the offsets of its free
//! blocks. Nodes are not embedded in the blocks themselves, since the smallest
//! blocks may be too small to hold a link; instead every list draws its nodes
//! from one [`NodePool`] and links them by index.

use std::collections::TryReserveError;

use crate::base::Offset;

/// A list node. `next` is the index of the following node in the same list.
#[derive(Copy, Clone, Debug)]
struct Node {
    ofs: Offset,
    next: Option<usize>,
}

/// Storage for the nodes of every free list in a pool.
///
/// Released nodes are chained through `next` and reused before the backing
/// vector grows.
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: Vec<Node>,
    free_head: Option<usize>,
    live: usize,
}

impl NodePool {
    /// Creates a pool with room for `capacity` nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be allocated.
    pub fn with_capacity(capacity: usize) -> Result<NodePool, TryReserveError> {
        let mut nodes = Vec::new();
        nodes.try_reserve_exact(capacity)?;

        Ok(NodePool {
            nodes,
            ..NodePool::default()
        })
    }

    /// Returns the number of nodes currently linked into some list.
    pub fn live(&self) -> usize {
        self.live
    }

    fn alloc(&mut self, ofs: Offset, next: Option<usize>) -> usize {
        self.live += 1;

        match self.free_head {
            Some(idx) => {
                let node = &mut self.nodes[idx];
                self.free_head = node.next;
                *node = Node { ofs, next };
                idx
            }

            None => {
                self.nodes.push(Node { ofs, next });
                self.nodes.len() - 1
            }
        }
    }

    fn dealloc(&mut self, idx: usize) {
        self.live -= 1;

        self.nodes[idx].next = self.free_head;
        self.free_head = Some(idx);
    }

    #[inline]
    fn get(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    #[inline]
    fn get_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }
}

/// The offset was already present in the list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Duplicate(pub Offset);

/// A singly linked list of block offsets in ascending order.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<usize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the lowest offset in the list without removing it.
    pub fn peek(&self, pool: &NodePool) -> Option<Offset> {
        self.head.map(|idx| pool.get(idx).ofs)
    }

    /// Removes and returns the lowest offset in the list.
    pub fn pop_front(&mut self, pool: &mut NodePool) -> Option<Offset> {
        let head = self.head?;

        let node = *pool.get(head);
        self.head = node.next;
        self.len -= 1;
        pool.dealloc(head);

        Some(node.ofs)
    }

    /// Pushes `ofs` onto the front of the list.
    ///
    /// `ofs` must be lower than every offset already in the list.
    pub fn push_front(&mut self, pool: &mut NodePool, ofs: Offset) {
        debug_assert!(self.peek(pool).map_or(true, |head| ofs < head));

        self.head = Some(pool.alloc(ofs, self.head));
        self.len += 1;
    }

    /// Inserts `ofs` before the first node with a greater offset.
    ///
    /// # Errors
    ///
    /// Returns `Err(Duplicate)` if `ofs` is already in the list; the list is
    /// left unchanged.
    pub fn insert_sorted(&mut self, pool: &mut NodePool, ofs: Offset) -> Result<(), Duplicate> {
        let mut prev = None;
        let mut cur = self.head;

        while let Some(idx) = cur {
            let node = pool.get(idx);

            if node.ofs == ofs {
                return Err(Duplicate(ofs));
            }

            if node.ofs > ofs {
                break;
            }

            prev = cur;
            cur = node.next;
        }

        let new = pool.alloc(ofs, cur);

        match prev {
            Some(p) => pool.get_mut(p).next = Some(new),
            None => self.head = Some(new),
        }

        self.len += 1;
        Ok(())
    }

    /// Removes `ofs` from the list.
    ///
    /// Returns `false` if `ofs` was not present.
    pub fn remove(&mut self, pool: &mut NodePool, ofs: Offset) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = self.head;

        while let Some(idx) = cur {
            let node = *pool.get(idx);

            if node.ofs > ofs {
                // Sorted, so `ofs` cannot appear further on.
                return false;
            }

            if node.ofs == ofs {
                match prev {
                    Some(p) => pool.get_mut(p).next = node.next,
                    None => self.head = node.next,
                }

                pool.dealloc(idx);
                self.len -= 1;
                return true;
            }

            prev = cur;
            cur = node.next;
        }

        false
    }

    /// Returns `true` if `ofs` is in the list.
    pub fn contains(&self, pool: &NodePool, ofs: Offset) -> bool {
        self.iter(pool).take_while(|&o| o <= ofs).any(|o| o == ofs)
    }

    /// Iterates over the offsets in the list in ascending order.
    pub fn iter<'a>(&self, pool: &'a NodePool) -> Iter<'a> {
        Iter {
            pool,
            cur: self.head,
        }
    }
}

/// An iterator over the offsets of a [`FreeList`].
#[derive(Debug)]
pub struct Iter<'a> {
    pool: &'a NodePool,
    cur: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        let node = self.pool.get(self.cur?);
        self.cur = node.next;
        Some(node.ofs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(list: &FreeList, pool: &NodePool) -> Vec<usize> {
        list.iter(pool).map(Offset::get).collect()
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut pool = NodePool::default();
        let mut list = FreeList::new();

        for ofs in [48, 0, 32, 16, 64] {
            list.insert_sorted(&mut pool, Offset::new(ofs)).unwrap();
        }

        assert_eq!(offsets(&list, &pool), [0, 16, 32, 48, 64]);
        assert_eq!(list.len(), 5);
        assert_eq!(pool.live(), 5);
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut pool = NodePool::default();
        let mut list = FreeList::new();

        list.insert_sorted(&mut pool, Offset::new(8)).unwrap();
        list.insert_sorted(&mut pool, Offset::new(16)).unwrap();
        assert_eq!(
            list.insert_sorted(&mut pool, Offset::new(16)),
            Err(Duplicate(Offset::new(16)))
        );
        assert_eq!(offsets(&list, &pool), [8, 16]);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn remove_and_pop() {
        let mut pool = NodePool::default();
        let mut list = FreeList::new();

        for ofs in [0, 8, 16, 24] {
            list.insert_sorted(&mut pool, Offset::new(ofs)).unwrap();
        }

        assert!(list.remove(&mut pool, Offset::new(16)));
        assert!(!list.remove(&mut pool, Offset::new(16)));
        assert!(!list.remove(&mut pool, Offset::new(100)));
        assert!(list.contains(&pool, Offset::new(24)));
        assert!(!list.contains(&pool, Offset::new(16)));

        assert_eq!(list.pop_front(&mut pool), Some(Offset::new(0)));
        assert_eq!(list.peek(&pool), Some(Offset::new(8)));
        assert!(list.remove(&mut pool, Offset::new(8)));
        assert!(list.remove(&mut pool, Offset::new(24)));
        assert!(list.is_empty());
        assert_eq!(list.pop_front(&mut pool), None);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn capacity_is_reserved_up_front() {
        let pool = NodePool::with_capacity(16).unwrap();
        assert!(pool.nodes.capacity() >= 16);
        assert_eq!(pool.live(), 0);

        assert!(NodePool::with_capacity(usize::MAX).is_err());
    }

    #[test]
    fn nodes_are_reused() {
        let mut pool = NodePool::default();
        let mut a = FreeList::new();
        let mut b = FreeList::new();

        for ofs in 0..8 {
            a.insert_sorted(&mut pool, Offset::new(ofs * 4)).unwrap();
        }
        while a.pop_front(&mut pool).is_some() {}

        for ofs in 0..8 {
            b.insert_sorted(&mut pool, Offset::new(ofs * 8)).unwrap();
        }

        assert_eq!(pool.nodes.len(), 8);
        assert_eq!(pool.live(), 8);
        assert!(a.is_empty());
        assert_eq!(b.len(), 8);
    }
}
