use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent with an existence filter.
///
/// Membership uses double hashing: the first 16 bytes of the SHA-256 digest of
/// the full resource name give two little-endian `u64` hashes `h1` and `h2`, and
/// probe `i` checks bit `(h1 + i * h2) mod bit_count` (wrapping arithmetic). Bits
/// are numbered from the least significant bit of each byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u8,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid bloom filter hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Bloom filter with bits must have a positive hash count"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Empty bloom filter must have zero padding, got {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            padding: padding as u8,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// An empty filter with room for `bit_count` bits.
    pub fn with_bit_count(bit_count: u64, hash_count: i32) -> FirestoreResult<Self> {
        let bytes = bit_count.div_ceil(8);
        let padding = (bytes * 8 - bit_count) as i32;
        Self::new(vec![0; bytes as usize], padding, hash_count)
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> i32 {
        i32::from(self.padding)
    }

    pub fn hash_count(&self) -> i32 {
        self.hash_count as i32
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(h1, h2, index)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(h1, h2, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, index: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(index))) % self.bit_count
    }

    fn is_bit_set(&self, bit: u64) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }
}

fn hash(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filters() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, -1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("projects/p/databases/d/documents/c/a"));
    }

    #[test]
    fn inserted_names_are_found() {
        let mut filter = BloomFilter::with_bit_count(1000, 7).unwrap();
        assert_eq!(filter.padding(), 0);
        let names: Vec<String> = (0..50)
            .map(|i| format!("projects/p/databases/(default)/documents/docs/{i}"))
            .collect();
        for name in &names {
            filter.insert(name);
        }
        assert!(names.iter().all(|name| filter.might_contain(name)));

        let false_positives = (50..1050)
            .filter(|i| filter.might_contain(&format!("projects/p/databases/(default)/documents/docs/{i}")))
            .count();
        assert!(false_positives < 50, "unexpected false positive rate: {false_positives}");
    }

    #[test]
    fn padding_limits_the_addressable_bits() {
        let filter = BloomFilter::with_bit_count(13, 3).unwrap();
        assert_eq!(filter.bitmap().len(), 2);
        assert_eq!(filter.padding(), 3);
        assert_eq!(filter.bit_count(), 13);
    }
}
