use sha2::{Digest, Sha256};

/// Backend assertion about how many documents currently match a target,
/// optionally carrying a bloom filter over the unchanged document names.
#[derive(Clone, Debug)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilter>,
}

impl ExistenceFilter {
    pub fn new(count: i32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }

    pub fn with_unchanged_names(mut self, filter: BloomFilter) -> Self {
        self.unchanged_names = Some(filter);
        self
    }
}

/// Bloom filter over fully qualified document names.
///
/// False positives make a deleted document look unchanged and are caught by
/// the count comparison; a membership miss is authoritative, the document is
/// definitely not in the target anymore.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: usize,
    hash_count: u32,
}

impl BloomFilter {
    /// `padding` is the number of unused bits at the end of the last byte.
    pub fn new(bits: Vec<u8>, padding: u32, hash_count: u32) -> Option<Self> {
        if padding >= 8 || (bits.is_empty() && padding != 0) {
            return None;
        }
        let bit_count = bits.len() * 8 - padding as usize;
        Some(Self {
            bits,
            bit_count,
            hash_count,
        })
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn might_contain(&self, name: &str) -> bool {
        if self.bit_count == 0 || self.hash_count == 0 {
            return false;
        }
        let (h1, h2) = Self::hash(name);
        for i in 0..self.hash_count as u64 {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            let bit = (combined % self.bit_count as u64) as usize;
            if !self.is_bit_set(bit) {
                return false;
            }
        }
        true
    }

    fn is_bit_set(&self, bit: usize) -> bool {
        let byte = self.bits[bit / 8];
        byte & (1 << (bit % 8)) != 0
    }

    fn hash(name: &str) -> (u64, u64) {
        let digest = Sha256::digest(name.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        (h1, h2)
    }

    /// Test helper mirroring the server-side insertion scheme.
    #[cfg(test)]
    pub fn insert(&mut self, name: &str) {
        if self.bit_count == 0 || self.hash_count == 0 {
            return;
        }
        let (h1, h2) = Self::hash(name);
        for i in 0..self.hash_count as u64 {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            let bit = (combined % self.bit_count as u64) as usize;
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }
}
