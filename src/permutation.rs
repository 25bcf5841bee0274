//! Pseudo-random bijections on the block-id space.
//!
//! Scattering consecutive block ids across the distribution decorrelates
//! rank failures from data loss: a crashed rank then takes an arbitrary
//! sample of every application's id range with it instead of one contiguous
//! slab.
//!
//! [`FeistelPermutation`] is a balanced Feistel network over `[0, max]` with
//! a keyed 64-bit hash as the round function; values that fall outside the
//! domain after a pass are walked through the cipher again until they land
//! inside (cycle walking), which keeps the map a bijection of exactly
//! `[0, max]`. [`RangePermutation`] applies it at a coarser granularity:
//! only the high bits of an id are permuted, so groups of `range_size`
//! consecutive ids stay contiguous and memory locality survives.

use ahash::RandomState;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Number of Feistel rounds. Three already gives a pseudo-random permutation;
/// four is the customary margin.
pub const FEISTEL_ROUNDS: usize = 4;

/// A keyed bijection on `[0, max_value]`.
#[derive(Debug, Clone)]
pub struct FeistelPermutation {
    max_value: u64,
    bits_half: u32,
    right_mask: u64,
    rounds: Vec<RandomState>,
}

impl FeistelPermutation {
    /// Build a permutation of `[0, max_value]` with round keys derived
    /// deterministically from `seed`.
    pub fn new(max_value: u64, seed: u64) -> Self {
        Self::with_rounds(max_value, seed, FEISTEL_ROUNDS)
    }

    /// As [`FeistelPermutation::new`] with an explicit round count (>= 3).
    pub fn with_rounds(max_value: u64, seed: u64, num_rounds: usize) -> Self {
        debug_assert!(num_rounds >= 3);

        // An odd number of significant bits would need an unbalanced network;
        // round up to even and let cycle walking absorb the excess.
        let mut bits = 64 - max_value.leading_zeros();
        if bits == 0 {
            bits = 2;
        } else if bits % 2 == 1 {
            bits += 1;
        }
        let bits_half = bits / 2;

        let mut rng = StdRng::seed_from_u64(seed);
        let rounds = (0..num_rounds)
            .map(|_| {
                RandomState::with_seeds(
                    rng.next_u64(),
                    rng.next_u64(),
                    rng.next_u64(),
                    rng.next_u64(),
                )
            })
            .collect();

        Self {
            max_value,
            bits_half,
            right_mask: (1u64 << bits_half) - 1,
            rounds,
        }
    }

    pub fn max_value(&self) -> u64 {
        self.max_value
    }

    /// Forward permutation. `n` must be in `[0, max_value]`.
    pub fn permute(&self, n: u64) -> u64 {
        debug_assert!(n <= self.max_value);
        if self.max_value == 0 {
            return 0;
        }
        let mut n = n;
        loop {
            n = self.feistel(n, false);
            if n <= self.max_value {
                return n;
            }
        }
    }

    /// Inverse permutation. `n` must be in `[0, max_value]`.
    pub fn invert(&self, n: u64) -> u64 {
        debug_assert!(n <= self.max_value);
        if self.max_value == 0 {
            return 0;
        }
        let mut n = n;
        loop {
            n = self.feistel(n, true);
            if n <= self.max_value {
                return n;
            }
        }
    }

    fn feistel(&self, n: u64, reverse: bool) -> u64 {
        let mut left = n >> self.bits_half;
        let mut right = n & self.right_mask;

        if !reverse {
            for state in &self.rounds {
                let tmp = left ^ (state.hash_one(right) & self.right_mask);
                left = right;
                right = tmp;
            }
        } else {
            for state in self.rounds.iter().rev() {
                let tmp = right ^ (state.hash_one(left) & self.right_mask);
                right = left;
                left = tmp;
            }
        }

        (left << self.bits_half) | right
    }
}

/// Bijection on `[0, num_blocks)` that permutes ids at the granularity of
/// `range_size` consecutive ids.
///
/// The low `log2(range_size)` bits pass through unchanged; the remaining
/// high bits run through a [`FeistelPermutation`]. When the combined result
/// overflows `num_blocks` (the last, partial range), the whole id is walked
/// through the map again, so the result is a bijection of exactly
/// `[0, num_blocks)` for any `range_size`.
#[derive(Debug, Clone)]
pub enum RangePermutation {
    Feistel {
        inner: FeistelPermutation,
        shift: u32,
        low_mask: u64,
        max_id: u64,
    },
    /// Substituted when id randomization is disabled.
    Identity,
}

impl RangePermutation {
    /// Build a range-granular permutation of `[0, num_blocks)`.
    ///
    /// `range_size` is rounded up to the next power of two so that the
    /// untouched low bits are a clean mask.
    pub fn new(num_blocks: u64, range_size: u64, seed: u64) -> Self {
        debug_assert!(num_blocks > 0);
        debug_assert!(range_size > 0);

        let ceil_log2 = if range_size.is_power_of_two() {
            range_size.trailing_zeros()
        } else {
            64 - range_size.leading_zeros()
        };
        let shift = ceil_log2.min(63);
        let max_id = num_blocks - 1;

        RangePermutation::Feistel {
            inner: FeistelPermutation::new(max_id >> shift, seed),
            shift,
            low_mask: (1u64 << shift) - 1,
            max_id,
        }
    }

    pub fn identity() -> Self {
        RangePermutation::Identity
    }

    /// Forward permutation. `id` must be in `[0, num_blocks)`.
    pub fn permute(&self, id: u64) -> u64 {
        match self {
            RangePermutation::Identity => id,
            RangePermutation::Feistel {
                inner,
                shift,
                low_mask,
                max_id,
            } => {
                debug_assert!(id <= *max_id);
                let mut n = id;
                loop {
                    n = (inner.permute(n >> shift) << shift) | (n & low_mask);
                    if n <= *max_id {
                        return n;
                    }
                }
            }
        }
    }

    /// Inverse permutation. `id` must be in `[0, num_blocks)`.
    pub fn invert(&self, id: u64) -> u64 {
        match self {
            RangePermutation::Identity => id,
            RangePermutation::Feistel {
                inner,
                shift,
                low_mask,
                max_id,
            } => {
                debug_assert!(id <= *max_id);
                let mut n = id;
                loop {
                    n = (inner.invert(n >> shift) << shift) | (n & low_mask);
                    if n <= *max_id {
                        return n;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bijection(permute: impl Fn(u64) -> u64, invert: impl Fn(u64) -> u64, n: u64) {
        let mut hit = vec![false; n as usize];
        for id in 0..n {
            let p = permute(id);
            assert!(p < n, "id {} mapped out of range: {}", id, p);
            assert!(!hit[p as usize], "id {} collides at {}", id, p);
            hit[p as usize] = true;
            assert_eq!(invert(p), id);
        }
    }

    #[test]
    fn test_feistel_is_bijective() {
        for max in [0u64, 1, 5, 63, 64, 1000] {
            for seed in [0u64, 1, 42] {
                let perm = FeistelPermutation::new(max, seed);
                assert_bijection(|i| perm.permute(i), |i| perm.invert(i), max + 1);
            }
        }
    }

    #[test]
    fn test_range_permutation_with_partial_tail() {
        // 10_000 is not a multiple of 64, so the last range is partial and
        // the combined cycle walk has to kick in.
        let perm = RangePermutation::new(10_000, 64, 0x1234);
        assert_bijection(|i| perm.permute(i), |i| perm.invert(i), 10_000);
    }

    #[test]
    fn test_range_size_one_permutes_every_id() {
        let perm = RangePermutation::new(100, 1, 7);
        assert_bijection(|i| perm.permute(i), |i| perm.invert(i), 100);
    }

    #[test]
    fn test_range_locality() {
        // 1024 ids in 16 full ranges of 64: no cycle walking at the combined
        // level, so each range maps onto one contiguous range.
        let perm = RangePermutation::new(1024, 64, 3);
        for base in (0..1024u64).step_by(64) {
            let mapped_base = perm.permute(base);
            for off in 0..64 {
                assert_eq!(perm.permute(base + off), mapped_base + off);
            }
        }
    }

    #[test]
    fn test_identity_passthrough() {
        let perm = RangePermutation::identity();
        for id in 0..100 {
            assert_eq!(perm.permute(id), id);
            assert_eq!(perm.invert(id), id);
        }
    }

    #[test]
    fn test_same_seed_same_mapping() {
        let a = RangePermutation::new(5000, 32, 99);
        let b = RangePermutation::new(5000, 32, 99);
        for id in 0..5000 {
            assert_eq!(a.permute(id), b.permute(id));
        }
        // A 4-round network that fixes every one of 5000 points would not
        // deserve the name; at least one id must move.
        assert!((0..5000).any(|id| a.permute(id) != id));
    }

    #[test]
    fn test_non_power_of_two_range_size_rounds_up() {
        // range_size 48 behaves like 64.
        let a = RangePermutation::new(4096, 48, 5);
        let b = RangePermutation::new(4096, 64, 5);
        for id in 0..4096 {
            assert_eq!(a.permute(id), b.permute(id));
        }
    }
}
