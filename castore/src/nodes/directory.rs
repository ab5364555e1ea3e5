use std::collections::btree_map::{self, BTreeMap};

use crate::{path::PathComponent, proto, DirectoryDigest, DirectoryError, Node};

/// A Directory contains nodes, which can be Directory, File or Symlink nodes.
/// It attaches names to these nodes, which is the basename in that directory.
/// These names:
///  - MUST not contain slashes or null bytes
///  - MUST not be '.' or '..'
///  - MUST be unique across all three lists
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    nodes: BTreeMap<PathComponent, Node>,
}

impl Directory {
    /// Constructs a new, empty Directory.
    pub fn new() -> Self {
        Directory {
            nodes: BTreeMap::new(),
        }
    }

    /// Construct a [Directory] from tuples of name and [Node].
    ///
    /// Inserting multiple elements with the same name will yield an error.
    pub fn try_from_iter<T: IntoIterator<Item = (PathComponent, Node)>>(
        iter: T,
    ) -> Result<Directory, DirectoryError> {
        let mut nodes = BTreeMap::new();

        iter.into_iter().try_fold(0u64, |size, (name, node)| {
            check_insert_node(size, &mut nodes, name, node)
        })?;

        Ok(Self { nodes })
    }

    /// The size of a directory is the number of all regular and symlink elements,
    /// the number of directory elements, and their size fields.
    pub fn size(&self) -> u64 {
        // It's impossible to create a Directory where the size overflows, because we
        // check before every add() that the size won't overflow.
        (self.nodes.len() as u64)
            + self
                .nodes()
                .map(|(_name, n)| match n {
                    Node::Directory { size, .. } => *size,
                    Node::File { .. } | Node::Symlink { .. } => 0,
                })
                .sum::<u64>()
    }

    /// Calculates the digest of a Directory, which is the blake3 hash of a
    /// Directory protobuf message, serialized in protobuf canonical form.
    pub fn digest(&self) -> DirectoryDigest {
        DirectoryDigest::from_node(proto::Directory::from(self).digest(), self.size())
    }

    /// Returns the [Node] pointing to this directory.
    pub fn as_node(&self) -> Node {
        Node::Directory {
            digest: proto::Directory::from(self).digest(),
            size: self.size(),
        }
    }

    /// Allows iterating over all nodes (directories, files and symlinks)
    /// with their names, ordered by name.
    pub fn nodes(&self) -> impl Iterator<Item = (&PathComponent, &Node)> + Send + Sync + '_ {
        self.nodes.iter()
    }

    /// Dissolves a Directory into its individual names and nodes.
    pub fn into_nodes(self) -> impl Iterator<Item = (PathComponent, Node)> + Send + Sync {
        self.nodes.into_iter()
    }

    /// Looks up a single entry by name.
    pub fn get(&self, name: &PathComponent) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds the specified [Node] to the [Directory] with a given name.
    ///
    /// Inserting a node that already exists with the same name in the directory
    /// will yield an error.
    pub fn add(&mut self, name: PathComponent, node: Node) -> Result<(), DirectoryError> {
        check_insert_node(self.size(), &mut self.nodes, name, node)?;
        Ok(())
    }
}

fn checked_sum(iter: impl IntoIterator<Item = u64>) -> Option<u64> {
    iter.into_iter().try_fold(0u64, |acc, i| acc.checked_add(i))
}

/// Helper function dealing with inserting nodes into the nodes [BTreeMap],
/// after ensuring the new size doesn't overlow and the key doesn't exist already.
///
/// Returns the new total size, or an error.
fn check_insert_node(
    current_size: u64,
    nodes: &mut BTreeMap<PathComponent, Node>,
    name: PathComponent,
    node: Node,
) -> Result<u64, DirectoryError> {
    // Check that even after adding this new directory entry, the size calculation will not
    // overflow
    let new_size = checked_sum([
        current_size,
        1,
        match node {
            Node::Directory { size, .. } => size,
            _ => 0,
        },
    ])
    .ok_or(DirectoryError::SizeOverflow)?;

    match nodes.entry(name) {
        btree_map::Entry::Vacant(e) => {
            e.insert(node);
        }
        btree_map::Entry::Occupied(occupied) => {
            return Err(DirectoryError::DuplicateName(occupied.key().to_string()))
        }
    }

    Ok(new_size)
}
