//! Bloom filter over partition keys, with the Filter component codec
//!
//! Present iff the configured false-positive probability is strictly less
//! than 1.0. The on-disk form is `hash_count:u32 ‖ bit_count:u64 ‖ bits as
//! a sized u64 array`.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::encoding::{read_array32_u64, read_u32, read_u64, write_array32_u64, write_u32, write_u64};
use crate::error::{Error, Result};
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// Bloom filter for partition-key membership checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    /// Size a filter for the expected number of keys and target false
    /// positive probability.
    pub fn with_fp_chance(expected_keys: u64, fp_chance: f64) -> Result<Self> {
        if fp_chance <= 0.0 || fp_chance >= 1.0 {
            return Err(Error::malformed(format!(
                "Bloom filter fp chance out of range: {fp_chance}"
            )));
        }
        let expected_keys = expected_keys.max(1);

        // m = -(n * ln(p)) / ln(2)^2, k = (m / n) * ln(2)
        let bit_count = (-(expected_keys as f64 * fp_chance.ln()) / (2.0_f64.ln().powi(2)))
            .ceil() as u64;
        let bit_count = bit_count.max(1);
        let hash_count =
            (((bit_count as f64 / expected_keys as f64) * 2.0_f64.ln()).ceil() as u32).max(1);

        let word_count = bit_count.div_ceil(64);
        Ok(Self {
            bits: vec![0u64; word_count as usize],
            hash_count,
            bit_count,
        })
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hashes(key);
        for i in 0..self.hash_count {
            let bit = (h1.wrapping_add(u64::from(i).wrapping_mul(h2))) % self.bit_count;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Whether the key might have been inserted.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hashes(key);
        for i in 0..self.hash_count {
            let bit = (h1.wrapping_add(u64::from(i).wrapping_mul(h2))) % self.bit_count;
            if self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    // Two independent hashes for double hashing, with distinct salts.
    fn hashes(key: &[u8]) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        h1.write(key);
        h1.write(&[0xAA]);

        let mut h2 = DefaultHasher::new();
        h2.write(key);
        h2.write(&[0x55]);

        (h1.finish(), h2.finish())
    }

    /// Number of hash functions.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of bits in the filter.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Parse a Filter component.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let hash_count = read_u32(src).await?;
        let bit_count = read_u64(src).await?;
        let bits = read_array32_u64(src).await?;
        if bit_count == 0 || (bits.len() as u64) < bit_count.div_ceil(64) {
            return Err(Error::malformed(format!(
                "Bloom filter holds {} words for {} bits",
                bits.len(),
                bit_count
            )));
        }
        Ok(Self {
            bits,
            hash_count,
            bit_count,
        })
    }

    /// Serialize a Filter component.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_u32(out, self.hash_count).await?;
        write_u64(out, self.bit_count).await?;
        write_array32_u64(out, &self.bits).await
    }
}
