//! Shard-placement hashing.
//!
//! Placement keys are SipHash-2-4 digests of `"<index>/<shard>"`; the
//! default [`JumpHasher`] maps a key onto one of `n` buckets with the
//! jump-consistent-hash construction, so growing the node set only moves
//! the minimal fraction of shards.

use std::hash::Hasher as _;

use siphasher::sip::SipHasher24;

/// Maps a placement key onto one of `n` buckets. Implementations must be
/// pure: the same `(key, n)` always yields the same bucket on every node.
pub trait Hasher: Send + Sync {
    fn hash(&self, key: u64, n: usize) -> usize;
}

/// Jump consistent hash (Lamping & Veach).
#[derive(Debug, Default, Clone, Copy)]
pub struct JumpHasher;

impl Hasher for JumpHasher {
    fn hash(&self, mut key: u64, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut b: i64 = -1;
        let mut j: i64 = 0;
        while j < n as i64 {
            b = j;
            key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64))
                as i64;
        }
        b as usize
    }
}

/// Placement key for `(index, shard)`.
pub fn shard_hash_key(index: &str, shard: u64) -> u64 {
    let mut h = SipHasher24::new();
    h.write(index.as_bytes());
    h.write(b"/");
    h.write_u64(shard);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let h = JumpHasher;
        for n in 1..10 {
            for key in [0u64, 1, 42, u64::MAX] {
                assert_eq!(h.hash(key, n), h.hash(key, n));
                assert!(h.hash(key, n) < n);
            }
        }
    }

    #[test]
    fn growing_the_bucket_count_only_moves_keys_forward() {
        // Jump hash invariant: when n grows to n+1, a key either stays put
        // or moves to the new bucket n.
        let h = JumpHasher;
        for key in 0..1000u64 {
            let key = shard_hash_key("i", key);
            for n in 1..8usize {
                let before = h.hash(key, n);
                let after = h.hash(key, n + 1);
                assert!(after == before || after == n, "key moved to an old bucket");
            }
        }
    }

    #[test]
    fn keys_spread_over_buckets() {
        let h = JumpHasher;
        let mut counts = [0usize; 4];
        for shard in 0..4000u64 {
            counts[h.hash(shard_hash_key("events", shard), 4)] += 1;
        }
        for &c in &counts {
            assert!(c > 600, "distribution too skewed: {counts:?}");
        }
    }

    #[test]
    fn shard_keys_differ_by_index_and_shard() {
        assert_ne!(shard_hash_key("a", 1), shard_hash_key("a", 2));
        assert_ne!(shard_hash_key("a", 1), shard_hash_key("b", 1));
        assert_eq!(shard_hash_key("a", 1), shard_hash_key("a", 1));
    }
}
