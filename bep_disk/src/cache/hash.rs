use bep_util::sha::{Sha256Hash, Sha256HashBuilder, ShaHash, ShaHashBuilder};

/// Digest algorithm used for piece hashing.
///
/// SHA-1 is the v1 protocol hash, v2 pieces use SHA-256.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DigestKind {
    Sha1,
    Sha256,
}

/// Finished digest of a piece.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PieceHash {
    Sha1(ShaHash),
    Sha256(Sha256Hash),
}

impl PieceHash {
    pub fn as_ref(&self) -> &[u8] {
        match self {
            PieceHash::Sha1(hash) => hash.as_ref(),
            PieceHash::Sha256(hash) => hash.as_ref(),
        }
    }
}

/// Incremental digest state over the bytes of a piece.
#[derive(Clone)]
pub enum PieceDigest {
    Sha1(ShaHashBuilder),
    Sha256(Sha256HashBuilder),
}

impl PieceDigest {
    pub fn new(kind: DigestKind) -> PieceDigest {
        match kind {
            DigestKind::Sha1 => PieceDigest::Sha1(ShaHashBuilder::new()),
            DigestKind::Sha256 => PieceDigest::Sha256(Sha256HashBuilder::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            PieceDigest::Sha1(builder) => *builder = builder.clone().add_bytes(bytes),
            PieceDigest::Sha256(builder) => *builder = builder.clone().add_bytes(bytes),
        }
    }

    pub fn finish(&self) -> PieceHash {
        match self {
            PieceDigest::Sha1(builder) => PieceHash::Sha1(builder.build()),
            PieceDigest::Sha256(builder) => PieceHash::Sha256(builder.build()),
        }
    }
}

/// Per piece incremental hash, advanced in whole block increments until the
/// final block which may be short.
#[derive(Clone)]
pub struct PartialHash {
    cursor: usize,
    digest: PieceDigest,
}

impl PartialHash {
    /// Create a new PartialHash at byte offset zero.
    pub fn new(kind: DigestKind) -> PartialHash {
        PartialHash { cursor: 0, digest: PieceDigest::new(kind) }
    }

    /// First byte of the piece that has not been hashed yet.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Feed the next bytes of the piece, advancing the cursor.
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.cursor += bytes.len();
    }

    /// Finish the digest without consuming the hash state.
    pub fn finish(&self) -> PieceHash {
        self.digest.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{DigestKind, PartialHash, PieceHash};

    use bep_util::sha::{Sha256Hash, ShaHash};

    #[test]
    fn positive_incremental_matches_one_shot() {
        let mut partial = PartialHash::new(DigestKind::Sha1);

        partial.update(&[1u8; 100]);
        partial.update(&[2u8; 50]);

        let mut all_bytes = vec![1u8; 100];
        all_bytes.extend_from_slice(&[2u8; 50]);

        assert_eq!(150, partial.cursor());
        assert_eq!(PieceHash::Sha1(ShaHash::from_bytes(&all_bytes)), partial.finish());
    }

    #[test]
    fn positive_sha256_kind_produces_sha256() {
        let mut partial = PartialHash::new(DigestKind::Sha256);

        partial.update(b"piece data");

        assert_eq!(PieceHash::Sha256(Sha256Hash::from_bytes(b"piece data")), partial.finish());
    }

    #[test]
    fn positive_finish_is_repeatable() {
        let mut partial = PartialHash::new(DigestKind::Sha1);
        partial.update(b"stable");

        assert_eq!(partial.finish(), partial.finish());
    }
}
