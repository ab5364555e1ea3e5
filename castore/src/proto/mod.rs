//! Wire and on-disk representation of [crate::Directory].
//!
//! The digest of a directory is the blake3 hash of this message, serialized
//! in protobuf canonical form (fields in tag order, every list sorted by name).
use prost::Message;

use crate::{path::PathComponent, B3Digest, Digest, DirectoryError};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub directories: Vec<DirectoryNode>,
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileNode>,
    #[prost(message, repeated, tag = "3")]
    pub symlinks: Vec<SymlinkNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub digest: bytes::Bytes,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub digest: bytes::Bytes,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(bool, tag = "4")]
    pub executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SymlinkNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub target: String,
}

/// A digest as sent over the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireDigest {
    #[prost(bytes = "bytes", tag = "1")]
    pub hash: bytes::Bytes,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}

impl Directory {
    /// Calculates the digest of a Directory, which is the blake3 hash of a
    /// Directory protobuf message, serialized in protobuf canonical form.
    pub fn digest(&self) -> B3Digest {
        B3Digest::of(&self.encode_to_vec())
    }
}

/// Accepts a name, and a mutable reference to the previous name.
/// If the passed name is larger than the previous one, the reference is updated.
/// If it's not, an error is returned.
fn update_if_lt_prev<'n>(prev_name: &mut &'n str, name: &'n str) -> Result<(), DirectoryError> {
    if name < *prev_name {
        return Err(DirectoryError::WrongSorting(name.to_owned()));
    }
    *prev_name = name;
    Ok(())
}

fn parse_digest(name: &PathComponent, digest: &bytes::Bytes) -> Result<B3Digest, DirectoryError> {
    B3Digest::try_from(digest.clone())
        .map_err(|_| DirectoryError::InvalidDigestLen(name.to_string(), digest.len()))
}

impl TryFrom<Directory> for crate::Directory {
    type Error = DirectoryError;

    fn try_from(value: Directory) -> Result<Self, Self::Error> {
        (&value).try_into()
    }
}

impl TryFrom<&Directory> for crate::Directory {
    type Error = DirectoryError;

    fn try_from(directory: &Directory) -> Result<crate::Directory, DirectoryError> {
        let mut dir = crate::Directory::new();

        let mut last_name: &str = "";
        for file in directory.files.iter() {
            update_if_lt_prev(&mut last_name, &file.name)?;
            let name = PathComponent::try_from(file.name.as_str())?;
            let digest = parse_digest(&name, &file.digest)?;
            dir.add(
                name,
                crate::Node::File {
                    digest,
                    size: file.size,
                    executable: file.executable,
                },
            )?;
        }

        let mut last_name: &str = "";
        for directory in directory.directories.iter() {
            update_if_lt_prev(&mut last_name, &directory.name)?;
            let name = PathComponent::try_from(directory.name.as_str())?;
            let digest = parse_digest(&name, &directory.digest)?;
            dir.add(
                name,
                crate::Node::Directory {
                    digest,
                    size: directory.size,
                },
            )?;
        }

        let mut last_name: &str = "";
        for symlink in directory.symlinks.iter() {
            update_if_lt_prev(&mut last_name, &symlink.name)?;
            let name = PathComponent::try_from(symlink.name.as_str())?;
            dir.add(
                name,
                crate::Node::Symlink {
                    target: symlink.target.as_str().try_into()?,
                },
            )?;
        }

        Ok(dir)
    }
}

impl From<crate::Directory> for Directory {
    fn from(value: crate::Directory) -> Self {
        (&value).into()
    }
}

impl From<&crate::Directory> for Directory {
    fn from(directory: &crate::Directory) -> Directory {
        let mut directories = vec![];
        let mut files = vec![];
        let mut symlinks = vec![];

        // nodes() is ordered by name, so each of the lists ends up sorted.
        for (name, node) in directory.nodes() {
            match node {
                crate::Node::File {
                    digest,
                    size,
                    executable,
                } => files.push(FileNode {
                    name: name.to_string(),
                    digest: digest.to_owned().into(),
                    size: *size,
                    executable: *executable,
                }),
                crate::Node::Directory { digest, size } => directories.push(DirectoryNode {
                    name: name.to_string(),
                    digest: digest.to_owned().into(),
                    size: *size,
                }),
                crate::Node::Symlink { target } => symlinks.push(SymlinkNode {
                    name: name.to_string(),
                    target: target.to_string(),
                }),
            }
        }
        Directory {
            directories,
            files,
            symlinks,
        }
    }
}

impl From<&Digest> for WireDigest {
    fn from(value: &Digest) -> Self {
        WireDigest {
            hash: value.hash.clone().into(),
            size: value.size,
        }
    }
}

impl TryFrom<WireDigest> for Digest {
    type Error = crate::digests::Error;

    fn try_from(value: WireDigest) -> Result<Self, Self::Error> {
        Ok(Digest::new(B3Digest::try_from(value.hash)?, value.size))
    }
}
