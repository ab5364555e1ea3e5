use thiserror::Error;
use tokio::task::JoinError;
use tonic::Status;

use crate::{B3Digest, Digest};

/// Errors related to communication with the store.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error("not found: {0}")]
    NotFound(Digest),
}

/// Errors that occur while constructing or validating a [crate::Directory].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DirectoryError {
    /// Multiple elements with the same name encountered
    #[error("{0:?} is a duplicate name")]
    DuplicateName(String),
    /// Invalid name encountered
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    /// Invalid symlink target
    #[error("Invalid symlink target: {0:?}")]
    InvalidSymlinkTarget(String),
    /// Elements are not in sorted order
    #[error("{0:?} is not sorted")]
    WrongSorting(String),
    /// Invalid digest length encountered
    #[error("invalid digest length {1} for {0:?}")]
    InvalidDigestLen(String, usize),
    /// Total size exceeds u64::MAX.
    #[error("Total size exceeds u64::MAX")]
    SizeOverflow,
    /// Returned directory did not match the requested digest.
    #[error("directory has digest {actual}, expected {expected}")]
    DigestMismatch {
        expected: B3Digest,
        actual: B3Digest,
    },
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<DirectoryError> for Error {
    fn from(value: DirectoryError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Status::invalid_argument(msg),
            Error::StorageError(msg) => Status::data_loss(format!("storage error: {}", msg)),
            Error::NotFound(digest) => Status::not_found(digest.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
            Error::NotFound(digest) => {
                Self::new(std::io::ErrorKind::NotFound, format!("not found: {}", digest))
            }
        }
    }
}
