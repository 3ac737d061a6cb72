//! Fork/join helpers over the rayon pool.
//!
//! Every per-chunk stage of a diff cycle goes through these so that the whole
//! engine can be switched to single-threaded execution with one flag.

use rayon::prelude::*;

/// Map `f` over `items`, one task per item, preserving order.
pub fn par_map<T, R, F>(parallel: bool, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    if parallel {
        items.par_iter().map(f).collect()
    } else {
        items.iter().map(f).collect()
    }
}

/// Run two closures, concurrently when `parallel` is set.
pub fn join<A, B, RA, RB>(parallel: bool, a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    if parallel {
        rayon::join(a, b)
    } else {
        (a(), b())
    }
}
