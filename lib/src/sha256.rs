use crate::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    // hash anything that is already laid out as bytes
    pub fn digest(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }
    /// The predecessor hash every chain starts from.
    pub fn genesis() -> Self {
        let mut seed = String::from("0b");
        seed.push_str(&"0".repeat(256));
        Self::digest(seed.as_bytes())
    }
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn leading_zero_bits(&self) -> u32 {
        U256::from_big_endian(&self.0).leading_zeros()
    }
    pub fn meets_difficulty(&self, bits: u32) -> bool {
        self.leading_zero_bits() >= bits
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_bits_counts_from_the_most_significant_byte() {
        let mut bytes = [0xffu8; 32];
        bytes[0] = 0;
        bytes[1] = 0b0001_0000;
        assert_eq!(Hash::from_bytes(bytes).leading_zero_bits(), 11);
        assert_eq!(Hash::from_bytes([0; 32]).leading_zero_bits(), 256);
        assert!(Hash::from_bytes(bytes).meets_difficulty(11));
        assert!(!Hash::from_bytes(bytes).meets_difficulty(12));
    }

    #[test]
    fn genesis_is_stable() {
        assert_eq!(Hash::genesis(), Hash::genesis());
        assert_ne!(Hash::genesis(), Hash::from_bytes([0; 32]));
        assert_eq!(Hash::genesis().to_string().len(), 64);
    }
}
