use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, SyncResult};

/// Probabilistic membership filter sent by the remote authority alongside an
/// existence filter. A negative answer is definitive.
///
/// Each member is hashed with SHA-256; the first two little-endian 64-bit
/// words of the digest seed `hash_count` double-hashed bit positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> SyncResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid bloom filter hash count: {hash_count}")));
        }
        if bitmap.is_empty() {
            if padding != 0 {
                return Err(invalid_argument(
                    "Bloom filter with an empty bitmap must have zero padding",
                ));
            }
            if hash_count != 0 {
                return Err(invalid_argument(
                    "Bloom filter with an empty bitmap must have a zero hash count",
                ));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("Bloom filter hash count must be positive"));
        }

        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Builds a filter containing `members`. Used by tests and in-process authorities.
    pub fn with_members<'a, I>(members: I, bit_count: u64, hash_count: u32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let byte_len = bit_count.div_ceil(8) as usize;
        let mut filter = Self {
            bitmap: vec![0; byte_len],
            hash_count,
            bit_count,
        };
        for member in members {
            filter.insert(member);
        }
        filter
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> i32 {
        ((self.bitmap.len() as u64) * 8 - self.bit_count) as i32
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (first, second) = hash_halves(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(first, second, i)))
    }

    fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (first, second) = hash_halves(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(first, second, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, first: u64, second: u64, i: u32) -> u64 {
        first.wrapping_add(second.wrapping_mul(i as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}
