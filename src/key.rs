//! Fixed-width content keys.

use std::fmt;

/// A fixed 16-byte content digest identifying a cached object.
///
/// The key is manipulated as four little-endian 32-bit words so that a
/// directory slot can store and compare it word-by-word with atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Key size in bytes.
    pub const SIZE: usize = 16;

    /// Number of 32-bit words in a key.
    pub const WORDS: usize = 4;

    /// Create a key from raw digest bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Reassemble a key from its four little-endian words.
    pub fn from_words(words: [u32; Self::WORDS]) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The key as four little-endian 32-bit words.
    pub fn words(&self) -> [u32; Self::WORDS] {
        let mut words = [0u32; Self::WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(self.0[i * 4..i * 4 + 4].try_into().unwrap());
        }
        words
    }

    /// A single little-endian word of the key.
    ///
    /// Word 0 seeds the directory probe sequence.
    pub fn word(&self, index: usize) -> u32 {
        self.words()[index]
    }

    /// Whether every byte of the key is zero.
    ///
    /// The all-zero key marks an unoccupied directory slot and is not a
    /// valid content key.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl From<[u8; 16]> for CacheKey {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_roundtrip() {
        let key = CacheKey::new([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
            0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
        ]);
        let words = key.words();
        assert_eq!(words[0], 0x0403_0201);
        assert_eq!(words[3], 0x100F_0E0D);
        assert_eq!(CacheKey::from_words(words), key);
    }

    #[test]
    fn null_key() {
        assert!(CacheKey::default().is_null());
        assert!(!CacheKey::new([1; 16]).is_null());
    }

    #[test]
    fn display_is_hex() {
        let key = CacheKey::new([0xAB; 16]);
        assert_eq!(format!("{key}"), "AB".repeat(16));
    }
}
