//! Range partitioning used to seed the worklist.
//!
//! Each worker seeds the worklist with its own contiguous block of the input
//! range, which keeps initial locality and spreads the seeding work across
//! the pool.

use std::ops::Range;

/// The half-open index range assigned to part `idx` of `parts` when `len`
/// items are split as evenly as possible.
///
/// The first `len % parts` parts receive one extra item. Empty ranges are
/// returned for surplus parts when `parts > len`.
///
/// # Panics
/// Panics if `parts` is 0 or `idx >= parts`.
pub fn split_evenly(len: usize, parts: usize, idx: usize) -> Range<usize> {
    assert!(parts > 0, "parts must be > 0");
    assert!(idx < parts, "idx {} out of range for {} parts", idx, parts);
    let base = len / parts;
    let extra = len % parts;
    let start = idx * base + idx.min(extra);
    let end = start + base + usize::from(idx < extra);
    start..end
}

/// Split `items` into `parts` contiguous blocks, front-loaded the same way as
/// [`split_evenly`].
pub fn partition<T>(mut items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    assert!(parts > 0, "parts must be > 0");
    let len = items.len();
    let mut blocks = Vec::with_capacity(parts);
    // Split from the back so each block is a cheap tail split.
    for idx in (0..parts).rev() {
        let range = split_evenly(len, parts, idx);
        blocks.push(items.split_off(range.start));
    }
    blocks.reverse();
    blocks
}
