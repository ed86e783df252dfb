#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest accepted filter: 2^30 bits.
pub const MAX_HASH_SIZE: u16 = 30;

/// Membership test over fixed-length sentinel values.
///
/// Implementations are immutable once published; an update swaps the whole
/// filter.
pub trait SentinelFilter: fmt::Debug + Send + Sync {
    fn contains(&self, value: &[u8]) -> bool;
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("hash size {0} exceeds {MAX_HASH_SIZE}")]
    HashSizeOutOfRange(u16),
    #[error("declared {declared} salts but payload carries {actual}")]
    SaltCountMismatch { declared: usize, actual: usize },
    #[error("filter needs {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Salted SHA-256 Bloom filter.
///
/// Each salt selects one bit: the first four bytes of
/// `SHA-256(salt_be || value)`, big-endian, masked to `hash_size` bits. Bit
/// `i` lives in byte `i / 8` under mask `1 << (i % 8)`.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    hash_size: u16,
    salts: Vec<u32>,
    bits: Vec<u8>,
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("hash_size", &self.hash_size)
            .field("salts", &self.salts.len())
            .field("bytes", &self.bits.len())
            .finish()
    }
}

impl BloomFilter {
    /// A filter that matches nothing.
    pub fn empty() -> Self {
        BloomFilter {
            hash_size: 0,
            salts: Vec::new(),
            bits: Vec::new(),
        }
    }

    /// All-zero filter of the given geometry.
    pub fn with_params(hash_size: u16, salts: Vec<u32>) -> Result<Self, FilterError> {
        let len = BloomFilter::required_len(hash_size)?;
        Ok(BloomFilter {
            hash_size,
            salts,
            bits: vec![0u8; len],
        })
    }

    pub fn from_bytes(hash_size: u16, salts: Vec<u32>, bits: Vec<u8>) -> Result<Self, FilterError> {
        let expected = BloomFilter::required_len(hash_size)?;
        if bits.len() != expected {
            return Err(FilterError::LengthMismatch {
                expected,
                actual: bits.len(),
            });
        }
        Ok(BloomFilter {
            hash_size,
            salts,
            bits,
        })
    }

    pub fn from_file(path: &Path, hash_size: u16, salts: Vec<u32>) -> Result<Self, FilterError> {
        let bits = std::fs::read(path).map_err(|source| FilterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        BloomFilter::from_bytes(hash_size, salts, bits)
    }

    /// Byte length of the bit vector for `hash_size`.
    pub fn required_len(hash_size: u16) -> Result<usize, FilterError> {
        if hash_size > MAX_HASH_SIZE {
            return Err(FilterError::HashSizeOutOfRange(hash_size));
        }
        let total_bits = 1usize << hash_size;
        Ok(if total_bits < 8 { 1 } else { total_bits / 8 })
    }

    pub fn hash_size(&self) -> u16 {
        self.hash_size
    }

    pub fn salts(&self) -> &[u32] {
        &self.salts
    }

    pub fn is_empty(&self) -> bool {
        self.salts.is_empty() || self.bits.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn insert(&mut self, value: &[u8]) {
        let indices: Vec<usize> = self.bit_indices(value).collect();
        for bit in indices {
            if let Some(byte) = self.bits.get_mut(bit / 8) {
                *byte |= 1 << (bit % 8);
            }
        }
    }

    fn bit_indices<'a>(&'a self, value: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let mask = if self.hash_size == 0 {
            0
        } else {
            u32::MAX >> (32 - self.hash_size as u32)
        };
        self.salts.iter().map(move |salt| {
            let mut hasher = Sha256::new();
            hasher.update(salt.to_be_bytes());
            hasher.update(value);
            let digest = hasher.finalize();
            let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
            (word & mask) as usize
        })
    }
}

impl SentinelFilter for BloomFilter {
    fn contains(&self, value: &[u8]) -> bool {
        if self.is_empty() {
            return false;
        }
        self.bit_indices(value).all(|bit| {
            self.bits
                .get(bit / 8)
                .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn required_length_follows_hash_size() {
        assert_eq!(BloomFilter::required_len(0).unwrap(), 1);
        assert_eq!(BloomFilter::required_len(2).unwrap(), 1);
        assert_eq!(BloomFilter::required_len(3).unwrap(), 1);
        assert_eq!(BloomFilter::required_len(4).unwrap(), 2);
        assert_eq!(BloomFilter::required_len(16).unwrap(), 8192);
        assert!(matches!(
            BloomFilter::required_len(31),
            Err(FilterError::HashSizeOutOfRange(31))
        ));
    }

    #[test]
    fn inserted_values_are_members() {
        let mut filter = BloomFilter::with_params(16, vec![1, 2, 3, 4]).unwrap();
        assert!(!filter.contains(b"sentinel"));
        filter.insert(b"sentinel");
        assert!(filter.contains(b"sentinel"));
        assert!(!filter.contains(b"sentinal"));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = BloomFilter::empty();
        assert!(filter.is_empty());
        assert!(!filter.contains(b""));
        assert!(!filter.contains(b"anything"));

        // No salts means no bit is tested; still fail closed.
        let no_salts = BloomFilter::from_bytes(3, Vec::new(), vec![0xff]).unwrap();
        assert!(!no_salts.contains(b"x"));
    }

    #[test]
    fn file_length_must_match_exactly() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 3]).unwrap();
        let err = BloomFilter::from_file(file.path(), 4, vec![7]).unwrap_err();
        assert!(matches!(
            err,
            FilterError::LengthMismatch {
                expected: 2,
                actual: 3
            }
        ));

        let mut source = BloomFilter::with_params(4, vec![7, 8]).unwrap();
        source.insert(b"abc");
        let mut good = tempfile::NamedTempFile::new().unwrap();
        good.write_all(source.as_bytes()).unwrap();
        let loaded = BloomFilter::from_file(good.path(), 4, vec![7, 8]).unwrap();
        assert!(loaded.contains(b"abc"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = BloomFilter::from_file(Path::new("/nonexistent/filter.bin"), 4, vec![1])
            .unwrap_err();
        assert!(matches!(err, FilterError::Io { .. }));
    }
}
