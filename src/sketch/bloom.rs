// dpau: Bloom filter over 64-bit key hashes
//
// Used to accelerate the "not in removed" check during erasure diffs. False
// positives over-delete (bounded by the configured rate); false negatives are
// impossible, so an erased key can never survive a diff.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected` insertions at the given false-positive
    /// rate. `expected` of zero is treated as one.
    pub fn with_fp_rate(expected: usize, fp_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let words = ((num_bits + 63) / 64) as usize;
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, h: u64) {
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h, i);
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    pub fn contains(&self, h: u64) -> bool {
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h, i);
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    // Double hashing; the inputs are already uniform 64-bit hashes.
    fn bit_index(&self, h: u64, i: u32) -> u64 {
        let h2 = h.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(31) | 1;
        h.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}
