use crate::error::{LengthError, LengthErrorKind, LengthResult};

mod builder;

pub use crate::sha::builder::{Sha256HashBuilder, ShaHashBuilder};

/// Length of a SHA-1 hash.
pub const SHA_HASH_LEN: usize = 20;

/// Length of a SHA-256 hash.
pub const SHA256_HASH_LEN: usize = 32;

/// SHA-1 hash wrapper type for performing operations on the hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ShaHash {
    hash: [u8; SHA_HASH_LEN],
}

impl ShaHash {
    /// Create a ShaHash by hashing the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> ShaHash {
        ShaHashBuilder::new().add_bytes(bytes).build()
    }

    /// Create a ShaHash directly from the given hash.
    pub fn from_hash(hash: &[u8]) -> LengthResult<ShaHash> {
        if hash.len() != SHA_HASH_LEN {
            Err(LengthError::new(LengthErrorKind::LengthExpected, SHA_HASH_LEN))
        } else {
            let mut my_hash = [0u8; SHA_HASH_LEN];
            my_hash.copy_from_slice(hash);

            Ok(ShaHash { hash: my_hash })
        }
    }

    pub fn len() -> usize {
        SHA_HASH_LEN
    }
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl Into<[u8; SHA_HASH_LEN]> for ShaHash {
    fn into(self) -> [u8; SHA_HASH_LEN] {
        self.hash
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(sha_hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        ShaHash { hash: sha_hash }
    }
}

impl PartialEq<[u8]> for ShaHash {
    fn eq(&self, other: &[u8]) -> bool {
        other.len() == self.hash.len() && self.hash.iter().zip(other.iter()).all(|(h, o)| h == o)
    }
}

// ---------------------------------------------------------------------------//

/// SHA-256 hash wrapper type, the piece digest for v2 torrents.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Sha256Hash {
    hash: [u8; SHA256_HASH_LEN],
}

impl Sha256Hash {
    /// Create a Sha256Hash by hashing the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Sha256Hash {
        Sha256HashBuilder::new().add_bytes(bytes).build()
    }

    /// Create a Sha256Hash directly from the given hash.
    pub fn from_hash(hash: &[u8]) -> LengthResult<Sha256Hash> {
        if hash.len() != SHA256_HASH_LEN {
            Err(LengthError::new(LengthErrorKind::LengthExpected, SHA256_HASH_LEN))
        } else {
            let mut my_hash = [0u8; SHA256_HASH_LEN];
            my_hash.copy_from_slice(hash);

            Ok(Sha256Hash { hash: my_hash })
        }
    }

    /// Truncate the hash to SHA-1 length, the v2 compatibility form.
    pub fn truncate(&self) -> ShaHash {
        let mut truncated = [0u8; SHA_HASH_LEN];
        truncated.copy_from_slice(&self.hash[..SHA_HASH_LEN]);

        truncated.into()
    }

    pub fn len() -> usize {
        SHA256_HASH_LEN
    }
}

impl Default for Sha256Hash {
    fn default() -> Sha256Hash {
        Sha256Hash { hash: [0u8; SHA256_HASH_LEN] }
    }
}

impl AsRef<[u8]> for Sha256Hash {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl From<[u8; SHA256_HASH_LEN]> for Sha256Hash {
    fn from(hash: [u8; SHA256_HASH_LEN]) -> Sha256Hash {
        Sha256Hash { hash }
    }
}

impl PartialEq<[u8]> for Sha256Hash {
    fn eq(&self, other: &[u8]) -> bool {
        other.len() == self.hash.len() && self.hash.iter().zip(other.iter()).all(|(h, o)| h == o)
    }
}

// ---------------------------------------------------------------------------//
