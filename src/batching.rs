//! Contiguous, order-preserving batch splitting.

use std::num::NonZeroUsize;

/// Split `items` into contiguous batches of at most `max` elements.
///
/// Concatenating the batches yields `items` unchanged. The ceiling is the
/// caller's: the per-category and whole-corpus grouping calls use different
/// values.
pub fn split_batches<T: Clone>(items: &[T], max: NonZeroUsize) -> Vec<Vec<T>> {
    items.chunks(max.get()).map(<[T]>::to_vec).collect()
}

/// Number of batches [`split_batches`] would produce.
pub fn batch_count(len: usize, max: NonZeroUsize) -> usize {
    len.div_ceil(max.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn forty_seven_in_batches_of_twenty() {
        let items: Vec<usize> = (0..47).collect();
        let batches = split_batches(&items, nz(20));
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 7]);
        assert_eq!(batches.concat(), items);
        assert_eq!(batch_count(47, nz(20)), 3);
    }

    #[test]
    fn small_and_empty_inputs() {
        assert!(split_batches::<u8>(&[], nz(8)).is_empty());
        assert_eq!(split_batches(&[1, 2], nz(8)), vec![vec![1, 2]]);
        assert_eq!(batch_count(0, nz(8)), 0);
        assert_eq!(batch_count(16, nz(8)), 2);
    }
}
