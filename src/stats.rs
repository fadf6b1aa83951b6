//! Read-only views over the heap: per block snapshots, totals and the
//! fragmentation score. Nothing in here allocates.

/// Snapshot of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the beginning of the arena.
    pub offset: usize,
    /// Address of the header.
    pub address: usize,
    /// Address of the header of the block before, if any.
    pub previous: Option<usize>,
    /// Payload size in bytes.
    pub size: usize,
    pub in_use: bool,
}

/// Totals over the whole arena, see [`crate::Heap::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeapStats {
    /// First byte of the arena, 0 if nothing was claimed yet.
    pub begin: usize,
    /// One past the last byte of the arena.
    pub end: usize,
    /// `end - begin`.
    pub total_size: usize,
    /// Bytes of metadata in front of every payload.
    pub header_size: usize,
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Payload bytes of allocated blocks.
    pub used_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Biggest request that can be served without growing.
    pub largest_free: usize,
    /// See [`fragmentation_score`].
    pub fragmentation: f64,
}

/// Scores how fragmented free memory is, from the sizes of the free blocks.
///
/// With `T` the total free bytes and `s_i` the free block sizes, the quality
/// of the free space is `Q = sqrt(Σ s_i²) / T` and the score is `1 - Q²`.
///
/// - `0` when all free memory is in a single block, or there is none.
/// - `1 - 1/k` for `k` free blocks of the same size, approaching `1` as the
///   free memory breaks into more and more pieces.
///
/// See <https://asawicki.info/news_1757_a_metric_for_memory_fragmentation>.
pub fn fragmentation_score<I>(free_sizes: I) -> f64
where
    I: IntoIterator<Item = usize>,
{
    let (total, squares) = free_sizes
        .into_iter()
        .fold((0u128, 0u128), |(total, squares), size| {
            let size = size as u128;
            (total + size, squares + size * size)
        });

    if total == 0 {
        return 0.0;
    }

    // Q² = Σ s_i² / T², no need to take the square root first.
    let total = total as f64;
    1.0 - squares as f64 / (total * total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_free_memory_scores_zero() {
        assert_eq!(fragmentation_score([0usize; 0]), 0.0);
        assert_eq!(fragmentation_score([0, 0]), 0.0);
    }

    #[test]
    fn single_free_block_scores_zero() {
        assert_eq!(fragmentation_score([4096]), 0.0);
        assert_eq!(fragmentation_score([1 << 40]), 0.0);
    }

    #[test]
    fn equal_pieces_score_one_minus_one_over_k() {
        let mut last = 0.0;

        for k in 2..=64 {
            let score = fragmentation_score(std::iter::repeat_n(1024 / k, k));
            assert!((score - (1.0 - 1.0 / k as f64)).abs() < 1e-12, "k = {k}: {score}");
            assert!(score > last);
            assert!(score < 1.0);
            last = score;
        }
    }

    #[test]
    fn one_big_block_dominates() {
        let score = fragmentation_score([1_000_000, 8, 8, 8]);
        assert!(score > 0.0);
        assert!(score < 0.001);
    }
}
