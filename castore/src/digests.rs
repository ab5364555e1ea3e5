use bytes::Bytes;
use data_encoding::{BASE64, HEXLOWER};
use thiserror::Error;

#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct B3Digest(Bytes);

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

pub const B3_LEN: usize = 32;

impl B3Digest {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex representation, used for on-disk paths.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(self.as_slice())
    }

    /// Hashes the given bytes.
    pub fn of(data: &[u8]) -> Self {
        blake3::hash(data).into()
    }
}

impl From<B3Digest> for bytes::Bytes {
    fn from(val: B3Digest) -> Self {
        val.0
    }
}

impl From<blake3::Hash> for B3Digest {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<Vec<u8>> for B3Digest {
    type Error = Error;

    // constructs a [B3Digest] from a [Vec<u8>].
    // Returns an error if the digest has the wrong length.
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != B3_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<bytes::Bytes> for B3Digest {
    type Error = Error;

    fn try_from(value: bytes::Bytes) -> Result<Self, Self::Error> {
        if value.len() != B3_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<&[u8; B3_LEN]> for B3Digest {
    fn from(value: &[u8; B3_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl Clone for B3Digest {
    fn clone(&self) -> Self {
        Self(self.0.to_owned())
    }
}

impl std::fmt::Display for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}

impl std::fmt::Debug for B3Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b3:{}", BASE64.encode(&self.0))
    }
}

/// A content digest: the blake3 hash of some bytes, plus their length.
/// Equal content always yields an equal [Digest].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub hash: B3Digest,
    pub size: u64,
}

impl Digest {
    pub fn new(hash: B3Digest, size: u64) -> Self {
        Self { hash, size }
    }

    /// Computes the digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            hash: B3Digest::of(data),
            size: data.len() as u64,
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// The digest of a canonically serialized [crate::Directory].
///
/// `size` is the recursive number of entries (see [crate::Directory::size]),
/// so a [DirectoryDigest] carries the same information as a directory [crate::Node].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryDigest(Digest);

impl DirectoryDigest {
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    pub fn hash(&self) -> &B3Digest {
        &self.0.hash
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn as_digest(&self) -> &Digest {
        &self.0
    }

    /// Constructs the digest a [crate::Node::Directory] points to.
    pub fn from_node(digest: B3Digest, size: u64) -> Self {
        Self(Digest::new(digest, size))
    }

    /// The digest of the directory without any entries.
    pub fn empty() -> Self {
        EMPTY_DIRECTORY_DIGEST.clone()
    }
}

lazy_static::lazy_static! {
    static ref EMPTY_DIRECTORY_DIGEST: DirectoryDigest =
        DirectoryDigest(Digest::of_bytes(&[]));
}

impl From<DirectoryDigest> for Digest {
    fn from(value: DirectoryDigest) -> Self {
        value.0
    }
}

impl std::fmt::Display for DirectoryDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::fmt::Debug for DirectoryDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dir:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Directory;
    use hex_literal::hex;

    #[test]
    fn digest_of_bytes() {
        let d = Digest::of_bytes(b"Hello World!");
        assert_eq!(12, d.size);
        assert_eq!(d.hash.as_slice(), blake3::hash(b"Hello World!").as_bytes());
        assert_eq!(d, Digest::of_bytes(b"Hello World!"));
        assert_ne!(d, Digest::of_bytes(b"Hello World?"));
    }

    #[test]
    fn digest_of_empty() {
        let d = Digest::of_bytes(b"");
        assert_eq!(0, d.size);
        assert_eq!(
            d.hash.as_slice(),
            hex!("af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262")
        );
    }

    #[test]
    fn invalid_len() {
        assert!(B3Digest::try_from(vec![0u8; 31]).is_err());
    }

    #[test]
    fn empty_directory_digest_matches_encoding() {
        assert_eq!(DirectoryDigest::empty(), Directory::new().digest());
        assert_eq!(0, DirectoryDigest::empty().size());
    }
}
