#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_pool::{AllocError, FreeError, Global, InitError, Pool, PoolConfig};

pub struct PoolSubject(Pool<Global>);

impl PoolSubject {
    pub fn new(size: usize, lower: u32, upper: u32) -> Result<Self, InitError> {
        let pool = Pool::new_in(PoolConfig::new(size, lower, upper), Global)?;
        Ok(PoolSubject(pool))
    }

    pub fn pool(&self) -> &Pool<Global> {
        &self.0
    }
}

impl Subject for PoolSubject {
    type AllocError = AllocError;
    type FreeError = FreeError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::FreeError> {
        self.0.free(ptr)
    }

    fn check(&self) -> bool {
        self.0.check()
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};

    use super::*;

    #[test]
    fn scripted_traffic() {
        let subject = PoolSubject::new(4096, 4, 10).unwrap();
        let mut eval = Evaluator::new(subject);

        let ops = [
            AllocatorOp::Alloc(1),
            AllocatorOp::Alloc(100),
            AllocatorOp::Alloc(1024),
            AllocatorOp::Alloc(2048),
            AllocatorOp::Dealloc(1),
            AllocatorOp::Alloc(17),
            AllocatorOp::Dealloc(0),
            AllocatorOp::Dealloc(7),
        ];
        eval.evaluate(ops).unwrap();

        let subject = eval.into_subject();
        let stats = subject.pool().stats();
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.free_bytes, stats.arena_size);
    }
}
