/// Split `total` items into `n_batches` sizes differing by at most one.
pub fn subdivide_into_batches(total: usize, n_batches: usize) -> Vec<usize> {
    if n_batches == 0 {
        return Vec::new();
    }
    let base = total / n_batches;
    let remainder = total % n_batches;
    (0..n_batches)
        .map(|i| if i < remainder { base + 1 } else { base })
        .filter(|&size| size > 0)
        .collect()
}

/// Cursor over balanced `(start, end)` half-open ranges covering `total`
/// items in batches of at most `max_batch`.
#[derive(Debug, Clone)]
pub struct BatchRanges {
    sizes: Vec<usize>,
    next_batch: usize,
    cursor: usize,
}

impl BatchRanges {
    pub fn new(total: usize, max_batch: usize) -> Self {
        let max_batch = max_batch.max(1);
        let n_batches = total.div_ceil(max_batch);
        Self {
            sizes: subdivide_into_batches(total, n_batches),
            next_batch: 0,
            cursor: 0,
        }
    }
}

impl Iterator for BatchRanges {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        let size = *self.sizes.get(self.next_batch)?;
        let start = self.cursor;
        self.next_batch += 1;
        self.cursor += size;
        Some((start, self.cursor))
    }
}

/// Batch size derived from an available-memory budget.
///
/// Degrades gracefully: a tiny or zero budget yields a batch of one rather
/// than failing, and the result never exceeds `cap`.
pub fn memory_limited_batch(
    available_bytes: usize,
    fraction: f64,
    bytes_per_item: usize,
    cap: usize,
) -> usize {
    let budget = available_bytes as f64 * fraction;
    let fit = (budget / bytes_per_item.max(1) as f64) as usize;
    fit.clamp(1, cap.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdivision_is_balanced_and_complete() {
        let sizes = subdivide_into_batches(10, 3);
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn ranges_cover_the_whole_set_in_order() {
        let ranges: Vec<_> = BatchRanges::new(10, 4).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn single_batch_when_max_exceeds_total() {
        let ranges: Vec<_> = BatchRanges::new(5, 100).collect();
        assert_eq!(ranges, vec![(0, 5)]);
    }

    #[test]
    fn empty_set_yields_no_ranges() {
        assert_eq!(BatchRanges::new(0, 8).count(), 0);
    }

    #[test]
    fn memory_limited_batch_never_returns_zero() {
        assert_eq!(memory_limited_batch(0, 0.4, 1024, 32), 1);
        assert_eq!(memory_limited_batch(100, 0.2, usize::MAX, 32), 1);
    }

    #[test]
    fn memory_limited_batch_respects_the_cap() {
        let batch = memory_limited_batch(usize::MAX, 0.4, 1, 32);
        assert_eq!(batch, 32);
    }
}
