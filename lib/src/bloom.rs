// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Fixed-size bloom filters.
//!
//! Used in two places with very different tunings: per-commit ancestor
//! filters (high false-positive rate, tiny) and per-query path sets (low
//! false-positive rate, grown on demand by the query engine). Hash indexes
//! come from double-hashing a keyed BLAKE2b digest, so membership answers
//! are identical across peers and processes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use blake2::Blake2b512;
use digest::Digest as _;

/// Default cap on the number of probe hashes.
pub const MAX_HASHES: u32 = 16;

/// A bloom filter over string keys. No deletion.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected` keys at the given false-positive
    /// rate: `m = -n·ln(fpr)/ln(2)²`, `k = ceil((m/n)·ln 2)` capped.
    pub fn new(expected: usize, fpr: f64) -> Self {
        Self::with_max_hashes(expected, fpr, MAX_HASHES)
    }

    pub fn with_max_hashes(expected: usize, fpr: f64, max_hashes: u32) -> Self {
        let n = expected.max(1) as f64;
        let fpr = fpr.clamp(1e-9, 0.999);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * fpr.ln() / (ln2 * ln2)).ceil().max(8.0);
        let k = ((m / n) * ln2).ceil().clamp(1.0, f64::from(max_hashes.max(1)));
        let num_bits = m as u32;
        Self {
            bits: vec![0; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes: k as u32,
        }
    }

    pub fn insert(&mut self, key: &str) {
        for index in self.indexes(key) {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    /// `false` is definitive; `true` is probabilistic.
    pub fn has(&self, key: &str) -> bool {
        self.indexes(key)
            .all(|index| self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0)
    }

    /// Fraction of bits set. The query engine grows its filter when this
    /// approaches saturation.
    pub fn fill_ratio(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        f64::from(set) / f64::from(self.num_bits)
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    fn indexes(&self, key: &str) -> impl Iterator<Item = u32> + use<> {
        // Double hashing over two 32-bit halves of a BLAKE2b digest.
        let digest = Blake2b512::digest(key.as_bytes());
        let h1 = u32::from_le_bytes(digest[0..4].try_into().unwrap());
        let h2 = u32::from_le_bytes(digest[4..8].try_into().unwrap()) | 1;
        let num_bits = self.num_bits;
        (0..self.num_hashes).map(move |i| {
            let mixed = u64::from(h1).wrapping_add(u64::from(i) * u64::from(h2));
            (mixed % u64::from(num_bits)) as u32
        })
    }

    /// Wire form: `[k][m: le u32][bit bytes...]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.bits.len());
        out.push(self.num_hashes as u8);
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&num_hashes, rest) = bytes.split_first()?;
        let (num_bits_bytes, bits) = rest.split_at_checked(4)?;
        let num_bits = u32::from_le_bytes(num_bits_bytes.try_into().unwrap());
        if num_bits == 0 || bits.len() != num_bits.div_ceil(8) as usize || num_hashes == 0 {
            return None;
        }
        Some(Self {
            bits: bits.to_vec(),
            num_bits,
            num_hashes: u32::from(num_hashes),
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("fill_ratio", &self.fill_ratio())
            .finish()
    }
}

impl serde::Serialize for BloomFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&BASE64.encode(self.to_bytes()), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for BloomFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded: String = serde::Deserialize::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(&encoded)
            .map_err(|_| serde::de::Error::custom("bad bloom filter base64"))?;
        Self::from_bytes(&bytes).ok_or_else(|| serde::de::Error::custom("bad bloom filter bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(100, 0.01);
        let keys: Vec<String> = (0..100).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            filter.insert(key);
        }
        for key in &keys {
            assert!(filter.has(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_reasonable() {
        let mut filter = BloomFilter::new(500, 0.01);
        for i in 0..500 {
            filter.insert(&format!("member-{i}"));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.has(&format!("absent-{i}")))
            .count();
        // Budget twice the configured rate to keep the test stable.
        assert!(false_positives < 200, "{false_positives} false positives");
    }

    #[test]
    fn test_wire_round_trip() {
        let mut filter = BloomFilter::new(32, 0.25);
        filter.insert("a");
        filter.insert("b");
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(restored, filter);
        assert!(restored.has("a"));
    }

    #[test]
    fn test_high_fpr_filters_are_small() {
        let filter = BloomFilter::new(64, 0.25);
        assert!(filter.to_bytes().len() < 32);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(BloomFilter::from_bytes(&[]).is_none());
        assert!(BloomFilter::from_bytes(&[3, 1, 0, 0]).is_none());
    }
}
