use crypto::digest::Digest;
use crypto::sha1::Sha1;
use crypto::sha2::Sha256;

use crate::sha::{self, Sha256Hash, ShaHash};

/// Building `ShaHash` objects by adding byte slices to the hash.
#[derive(Clone)]
pub struct ShaHashBuilder {
    sha: Sha1,
}

impl ShaHashBuilder {
    /// Create a new `ShaHashBuilder`.
    pub fn new() -> ShaHashBuilder {
        ShaHashBuilder { sha: Sha1::new() }
    }

    /// Add bytes to the `ShaHashBuilder`.
    pub fn add_bytes(mut self, bytes: &[u8]) -> ShaHashBuilder {
        self.sha.input(bytes);

        self
    }

    /// Build the ShaHash from the `ShaHashBuilder`.
    pub fn build(&self) -> ShaHash {
        let mut buffer = [0u8; sha::SHA_HASH_LEN];

        self.sha.clone().result(&mut buffer);

        buffer.into()
    }
}

// ---------------------------------------------------------------------------//

/// Building `Sha256Hash` objects by adding byte slices to the hash.
#[derive(Clone)]
pub struct Sha256HashBuilder {
    sha: Sha256,
}

impl Sha256HashBuilder {
    /// Create a new `Sha256HashBuilder`.
    pub fn new() -> Sha256HashBuilder {
        Sha256HashBuilder { sha: Sha256::new() }
    }

    /// Add bytes to the `Sha256HashBuilder`.
    pub fn add_bytes(mut self, bytes: &[u8]) -> Sha256HashBuilder {
        self.sha.input(bytes);

        self
    }

    /// Build the Sha256Hash from the `Sha256HashBuilder`.
    pub fn build(&self) -> Sha256Hash {
        let mut buffer = [0u8; sha::SHA256_HASH_LEN];

        self.sha.clone().result(&mut buffer);

        buffer.into()
    }
}
