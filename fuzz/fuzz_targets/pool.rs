#![no_main]

use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use buddy_pool_hater::PoolSubject;
use libfuzzer_sys::fuzz_target;

// Keeps arenas small enough to reserve quickly.
const MAX_ARENA_BITS: u32 = 20;

#[derive(Clone, Debug)]
struct Args {
    size: usize,
    lower: u32,
    upper: u32,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let lower = u32::arbitrary(un)? % 12;
        let upper = lower + u32::arbitrary(un)? % (MAX_ARENA_BITS - lower);
        let size = usize::arbitrary(un)? % (1 << MAX_ARENA_BITS) + 1;
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            size,
            lower,
            upper,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = match PoolSubject::new(args.size, args.lower, args.upper) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(subject);
    eval.evaluate(args.ops).unwrap();
});
