//! Per-rank byte arenas holding the replicas stored on this rank.
//!
//! One arena per primary range assigned to this rank by the distribution,
//! preallocated and zero-filled. In constant-offset mode block `b` of range
//! `R` sits at `(b - R.start) * block_size`; no per-block table is kept.
//! The storage borrows the distribution as a shared handle and never owns
//! range metadata itself.

use std::sync::Arc;

use ahash::AHashMap;

use crate::distribution::{BlockDistribution, PrimaryRange};
use crate::error::{Error, Result};
use crate::BlockId;

pub struct SerializedBlockStorage {
    distribution: Arc<BlockDistribution>,
    block_size: usize,
    /// Primary-range index to arena slot.
    slots: AHashMap<usize, usize>,
    arenas: Vec<RangeArena>,
}

struct RangeArena {
    range: PrimaryRange,
    data: Vec<u8>,
}

impl SerializedBlockStorage {
    /// Allocate arenas for every non-empty primary range replicated on
    /// `my_rank`.
    pub fn new(
        distribution: Arc<BlockDistribution>,
        block_size: usize,
        my_rank: usize,
    ) -> Self {
        debug_assert!(block_size > 0);
        let mut slots = AHashMap::new();
        let mut arenas = Vec::new();
        for range in distribution.ranges_stored_on(my_rank) {
            if range.len == 0 {
                continue;
            }
            slots.insert(range.index, arenas.len());
            arenas.push(RangeArena {
                range,
                data: vec![0; range.len as usize * block_size],
            });
        }
        Self {
            distribution,
            block_size,
            slots,
            arenas,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn arena_of(&self, id: BlockId) -> Option<(&RangeArena, usize)> {
        let range = self.distribution.range_of_block(id);
        let slot = *self.slots.get(&range.index)?;
        let arena = &self.arenas[slot];
        Some((arena, (id - arena.range.start) as usize * self.block_size))
    }

    /// Store one block. `bytes` must be exactly `block_size` long and the
    /// block must belong to a range assigned to this rank.
    pub fn write_block(&mut self, id: BlockId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.block_size {
            return Err(Error::MalformedFrame);
        }
        let range = self.distribution.range_of_block(id);
        let slot = *self.slots.get(&range.index).ok_or(Error::MalformedFrame)?;
        let arena = &mut self.arenas[slot];
        let offset = (id - arena.range.start) as usize * self.block_size;
        arena.data[offset..offset + self.block_size].copy_from_slice(bytes);
        Ok(())
    }

    /// Store the blocks `[lo, hi]` (inclusive) from one flat byte image,
    /// splitting at primary-range boundaries as needed.
    pub fn write_consecutive_blocks(
        &mut self,
        lo: BlockId,
        hi: BlockId,
        bytes: &[u8],
    ) -> Result<()> {
        debug_assert!(lo <= hi);
        if bytes.len() != (hi - lo + 1) as usize * self.block_size {
            return Err(Error::MalformedFrame);
        }
        let mut id = lo;
        let mut consumed = 0;
        while id <= hi {
            let range = self.distribution.range_of_block(id);
            let span = (range.end().min(hi + 1) - id) as usize;
            let slot = *self.slots.get(&range.index).ok_or(Error::MalformedFrame)?;
            let arena = &mut self.arenas[slot];
            let offset = (id - arena.range.start) as usize * self.block_size;
            let len = span * self.block_size;
            arena.data[offset..offset + len].copy_from_slice(&bytes[consumed..consumed + len]);
            consumed += len;
            id += span as u64;
        }
        Ok(())
    }

    /// Byte image of one stored block.
    pub fn read_block(&self, id: BlockId) -> Result<&[u8]> {
        let (arena, offset) = self
            .arena_of(id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("block {} is not stored on this rank", id)))?;
        Ok(&arena.data[offset..offset + self.block_size])
    }

    /// Byte image of the blocks `[lo, hi]` (inclusive). The chunk must lie
    /// inside one primary range, which the callers guarantee by splitting
    /// their runs at range boundaries.
    pub fn read_chunk(&self, lo: BlockId, hi: BlockId) -> Result<&[u8]> {
        debug_assert!(lo <= hi);
        let (arena, offset) = self.arena_of(lo).ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "blocks [{}, {}] are not stored on this rank",
                lo, hi
            ))
        })?;
        if hi >= arena.range.end() {
            return Err(Error::InvalidConfiguration(format!(
                "blocks [{}, {}] span a range boundary",
                lo, hi
            )));
        }
        let len = (hi - lo + 1) as usize * self.block_size;
        Ok(&arena.data[offset..offset + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(num_ranks: usize, num_blocks: u64, k: usize, c: usize, rank: usize) -> SerializedBlockStorage {
        let dist = Arc::new(BlockDistribution::new(num_ranks, num_blocks, k));
        SerializedBlockStorage::new(dist, c, rank)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut store = storage(2, 10, 1, 2, 0);
        // Rank 0 with k=1 stores only range 0, blocks [0, 5).
        store.write_block(3, &[0xAB, 0xCD]).unwrap();
        assert_eq!(store.read_block(3).unwrap(), &[0xAB, 0xCD]);
        // Untouched blocks read back zeroed.
        assert_eq!(store.read_block(0).unwrap(), &[0, 0]);
    }

    #[test]
    fn test_unassigned_block_is_rejected() {
        let mut store = storage(2, 10, 1, 2, 0);
        assert!(matches!(
            store.write_block(7, &[1, 2]),
            Err(Error::MalformedFrame)
        ));
        assert!(store.read_block(7).is_err());
    }

    #[test]
    fn test_wrong_block_length_is_rejected() {
        let mut store = storage(2, 10, 1, 2, 0);
        assert!(matches!(
            store.write_block(1, &[1, 2, 3]),
            Err(Error::MalformedFrame)
        ));
    }

    #[test]
    fn test_consecutive_write_splits_at_range_boundary() {
        // k=2 over 2 ranks: rank 0 stores both ranges [0, 5) and [5, 10).
        let mut store = storage(2, 10, 2, 1, 0);
        let bytes: Vec<u8> = (10..15).collect();
        store.write_consecutive_blocks(3, 7, &bytes).unwrap();
        for (i, id) in (3..=7).enumerate() {
            assert_eq!(store.read_block(id).unwrap(), &[10 + i as u8]);
        }
    }

    #[test]
    fn test_read_chunk_within_one_range() {
        let mut store = storage(2, 10, 2, 2, 1);
        for id in 5..10u64 {
            store.write_block(id, &[id as u8, 0]).unwrap();
        }
        let chunk = store.read_chunk(5, 9).unwrap();
        assert_eq!(chunk.len(), 10);
        assert_eq!(chunk[0], 5);
        assert_eq!(chunk[8], 9);
        // Spanning both ranges is refused.
        assert!(store.read_chunk(4, 6).is_err());
    }
}
