//! This holds types describing nodes in the kiln-castore model.
mod directory;
mod symlink_target;

use crate::B3Digest;
pub use directory::Directory;
pub use symlink_target::SymlinkTarget;

/// A Node is either a directory, a file or a symlink.
/// Nodes themselves don't have names, what gives them names is them
/// being inside a [Directory].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    /// A pointer to a [Directory], by its [Directory::digest].
    Directory {
        /// The blake3 hash of a Directory message, serialized in protobuf canonical form.
        digest: B3Digest,
        /// Number of child elements in the Directory referred to by `digest`,
        /// counted recursively.
        size: u64,
    },
    /// A regular or executable file.
    File {
        /// The blake3 digest of the file contents
        digest: B3Digest,

        /// The file content size
        size: u64,

        /// Whether the file is executable
        executable: bool,
    },
    /// A symbolic link.
    Symlink {
        /// The target of the symlink.
        target: SymlinkTarget,
    },
}

impl Node {
    /// Short, human-readable name of the node type, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Directory { .. } => "directory",
            Node::File { .. } => "file",
            Node::Symlink { .. } => "symlink",
        }
    }
}
