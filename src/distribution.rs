//! Deterministic placement of block ranges onto ranks.
//!
//! Every rank computes the same distribution from three numbers (original
//! rank count, total block count, replication level) without exchanging any
//! metadata. The id space `[0, num_blocks)` is cut into one primary range
//! per original rank, as evenly as possible, and range `j` is replicated on
//! ranks `{j, j+1, .., j+k-1} mod P`. The replica sets are rotations of one
//! cycle: losing fewer than `k` consecutive ranks leaves every range with at
//! least one survivor.

use crate::transport::OriginalRank;
use crate::BlockId;

/// One primary range of the distribution: the blocks `[start, start+len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryRange {
    pub index: usize,
    pub start: BlockId,
    pub len: u64,
}

impl PrimaryRange {
    /// Exclusive end id.
    pub fn end(&self) -> BlockId {
        self.start + self.len
    }

    pub fn contains(&self, id: BlockId) -> bool {
        id >= self.start && id < self.end()
    }
}

/// Immutable map from block ids to replica rank sets.
#[derive(Debug)]
pub struct BlockDistribution {
    num_ranks: usize,
    num_blocks: u64,
    /// Effective replication, `min(k, P)`.
    effective: usize,
    /// `floor(num_blocks / num_ranks)`.
    base_len: u64,
    /// The first `num_long` ranges are one block longer.
    num_long: u64,
}

impl BlockDistribution {
    pub fn new(num_ranks: usize, num_blocks: u64, replication: usize) -> Self {
        debug_assert!(num_ranks > 0);
        debug_assert!(num_blocks > 0);
        debug_assert!(replication > 0);
        Self {
            num_ranks,
            num_blocks,
            effective: replication.min(num_ranks),
            base_len: num_blocks / num_ranks as u64,
            num_long: num_blocks % num_ranks as u64,
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    /// Replication actually achieved, `min(k, P)`.
    pub fn effective_replication(&self) -> usize {
        self.effective
    }

    /// The `index`-th primary range. Ranges may be empty when there are more
    /// ranks than blocks.
    pub fn range(&self, index: usize) -> PrimaryRange {
        debug_assert!(index < self.num_ranks);
        let idx = index as u64;
        let (start, len) = if idx < self.num_long {
            (idx * (self.base_len + 1), self.base_len + 1)
        } else {
            (
                self.num_long * (self.base_len + 1) + (idx - self.num_long) * self.base_len,
                self.base_len,
            )
        };
        PrimaryRange { index, start, len }
    }

    /// The primary range containing `id`.
    pub fn range_of_block(&self, id: BlockId) -> PrimaryRange {
        debug_assert!(id < self.num_blocks);
        let long_span = self.num_long * (self.base_len + 1);
        let index = if id < long_span {
            id / (self.base_len + 1)
        } else {
            self.num_long + (id - long_span) / self.base_len
        };
        self.range(index as usize)
    }

    /// The ranks storing the range with the given index, in rotation order.
    pub fn replica_ranks(&self, range_index: usize) -> Vec<OriginalRank> {
        debug_assert!(range_index < self.num_ranks);
        (0..self.effective)
            .map(|d| (range_index + d) % self.num_ranks)
            .collect()
    }

    /// The ranks storing the block `id`, in rotation order.
    pub fn ranks_for_block(&self, id: BlockId) -> Vec<OriginalRank> {
        self.replica_ranks(self.range_of_block(id).index)
    }

    /// Whether `rank` holds a replica of block `id`. `O(1)`.
    pub fn is_stored_on(&self, id: BlockId, rank: OriginalRank) -> bool {
        let j = self.range_of_block(id).index;
        (rank + self.num_ranks - j) % self.num_ranks < self.effective
    }

    /// All primary ranges replicated on `rank`, by ascending index.
    pub fn ranges_stored_on(&self, rank: OriginalRank) -> Vec<PrimaryRange> {
        debug_assert!(rank < self.num_ranks);
        let mut indices: Vec<usize> = (0..self.effective)
            .map(|d| (rank + self.num_ranks - d) % self.num_ranks)
            .collect();
        indices.sort_unstable();
        indices.into_iter().map(|j| self.range(j)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_rotation_literals() {
        let dist = BlockDistribution::new(10, 100, 3);
        assert_eq!(dist.replica_ranks(0), vec![0, 1, 2]);
        assert_eq!(dist.replica_ranks(5), vec![5, 6, 7]);
        assert_eq!(dist.replica_ranks(9), vec![9, 0, 1]);
        assert_eq!(dist.range_of_block(5).index, 0);
        assert_eq!(dist.range_of_block(99).index, 9);
    }

    #[test]
    fn test_ranges_partition_evenly() {
        for (num_ranks, num_blocks) in [(10usize, 100u64), (10, 101), (10, 7), (4, 50), (1, 1)] {
            let dist = BlockDistribution::new(num_ranks, num_blocks, 1);
            let mut total = 0;
            let mut min_len = u64::MAX;
            let mut max_len = 0;
            let mut next_start = 0;
            for j in 0..num_ranks {
                let range = dist.range(j);
                assert_eq!(range.start, next_start);
                next_start = range.end();
                total += range.len;
                min_len = min_len.min(range.len);
                max_len = max_len.max(range.len);
            }
            assert_eq!(total, num_blocks);
            assert!(max_len - min_len <= 1);
        }
    }

    #[test]
    fn test_every_block_has_effective_replication() {
        for (num_ranks, num_blocks, k) in [
            (10usize, 100u64, 3usize),
            (10, 101, 3),
            (10, 7, 2),
            (4, 50, 5),
            (1, 1, 1),
            (5, 13, 13),
        ] {
            let dist = BlockDistribution::new(num_ranks, num_blocks, k);
            let expected = k.min(num_ranks);
            for id in 0..num_blocks {
                let replicas = dist.ranks_for_block(id);
                assert_eq!(replicas.len(), expected);
                let mut sorted = replicas.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), expected, "duplicate replica for id {}", id);
                for rank in 0..num_ranks {
                    assert_eq!(dist.is_stored_on(id, rank), replicas.contains(&rank));
                }
            }
        }
    }

    #[test]
    fn test_consecutive_failures_below_k_leave_a_survivor() {
        let dist = BlockDistribution::new(10, 100, 3);
        for first_dead in 0..10 {
            let dead = [first_dead, (first_dead + 1) % 10];
            for j in 0..10 {
                let survivors: Vec<_> = dist
                    .replica_ranks(j)
                    .into_iter()
                    .filter(|r| !dead.contains(r))
                    .collect();
                assert!(
                    !survivors.is_empty(),
                    "range {} lost with dead ranks {:?}",
                    j,
                    dead
                );
            }
        }
    }

    #[test]
    fn test_ranges_stored_on_matches_membership() {
        let dist = BlockDistribution::new(4, 40, 3);
        for rank in 0..4 {
            let stored = dist.ranges_stored_on(rank);
            assert_eq!(stored.len(), 3);
            for range in &stored {
                assert!(dist.replica_ranks(range.index).contains(&rank));
            }
        }
        // Rank 0 replicates its own range plus the two wrapping ones.
        let indices: Vec<_> = dist.ranges_stored_on(0).iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[test]
    fn test_more_ranks_than_blocks() {
        let dist = BlockDistribution::new(10, 3, 2);
        for id in 0..3 {
            assert_eq!(dist.range_of_block(id).len, 1);
        }
        let empty: Vec<_> = (0..10).map(|j| dist.range(j)).filter(|r| r.len == 0).collect();
        assert_eq!(empty.len(), 7);
    }
}
