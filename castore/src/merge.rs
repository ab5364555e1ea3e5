//! Union of several directory trees.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, instrument};

use crate::directoryservice::DirectoryService;
use crate::{B3Digest, Directory, DirectoryDigest, Error, Node, PathComponent};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MergeError {
    /// Two inputs disagree about the entry at `path`.
    #[error("conflicting entries at {path:?}: {first} vs {second}")]
    Conflict {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("directory {0} not found")]
    NotFound(B3Digest),

    #[error("storage error: {0}")]
    Store(#[from] Error),
}

fn describe(node: &Node) -> String {
    match node {
        Node::Directory { digest, .. } => format!("directory {}", digest),
        Node::File {
            digest,
            size,
            executable,
        } => format!(
            "{} {} ({} bytes)",
            if *executable { "executable" } else { "file" },
            digest,
            size
        ),
        Node::Symlink { target } => format!("symlink to {:?}", target.as_str()),
    }
}

/// Merges the given trees into one, uploading any new directories to the
/// [DirectoryService], and returns the digest of the result.
///
/// Entries present in only one input are carried over. Identical entries
/// collapse into one. Directories at the same path are merged recursively.
/// Anything else at the same path (two different files, a file and a
/// symlink, a file and a directory) is a [MergeError::Conflict].
#[instrument(skip(directory_service), err)]
pub async fn merge<DS>(
    directory_service: &DS,
    roots: &[DirectoryDigest],
) -> Result<DirectoryDigest, MergeError>
where
    DS: DirectoryService + ?Sized,
{
    let empty = DirectoryDigest::empty();
    let mut digests: Vec<B3Digest> = roots
        .iter()
        .filter(|d| **d != empty)
        .map(|d| d.hash().clone())
        .collect();
    digests.sort();
    digests.dedup();

    match digests.len() {
        0 => Ok(empty),
        1 => Ok(roots
            .iter()
            .find(|d| *d.hash() == digests[0])
            .cloned()
            .unwrap_or(empty)),
        _ => {
            let directory = merge_directories(directory_service, digests, PathBuf::new()).await?;
            Ok(directory_service.put(directory).await?)
        }
    }
}

async fn load<DS>(directory_service: &DS, digest: &B3Digest) -> Result<Directory, MergeError>
where
    DS: DirectoryService + ?Sized,
{
    if digest == DirectoryDigest::empty().hash() {
        return Ok(Directory::new());
    }
    directory_service
        .get(digest)
        .await?
        .ok_or_else(|| MergeError::NotFound(digest.clone()))
}

/// Merges a set of distinct directories, uploading merged children on the way.
/// The returned root itself is not uploaded.
fn merge_directories<'a, DS>(
    directory_service: &'a DS,
    digests: Vec<B3Digest>,
    path: PathBuf,
) -> BoxFuture<'a, Result<Directory, MergeError>>
where
    DS: DirectoryService + ?Sized,
{
    async move {
        let mut entries: BTreeMap<PathComponent, Vec<Node>> = BTreeMap::new();
        for digest in &digests {
            for (name, node) in load(directory_service, digest).await?.into_nodes() {
                let nodes = entries.entry(name).or_default();
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }

        let mut merged = Directory::new();
        for (name, nodes) in entries {
            let node = merge_entry(directory_service, &path.join(name.as_str()), nodes).await?;
            merged
                .add(name, node)
                .map_err(|e| MergeError::Store(e.into()))?;
        }

        debug!(path=?path, inputs=digests.len(), "merged directories");
        Ok(merged)
    }
    .boxed()
}

async fn merge_entry<DS>(
    directory_service: &DS,
    path: &Path,
    mut nodes: Vec<Node>,
) -> Result<Node, MergeError>
where
    DS: DirectoryService + ?Sized,
{
    if nodes.len() == 1 {
        return Ok(nodes.remove(0));
    }

    let mut child_digests = Vec::with_capacity(nodes.len());
    for node in &nodes {
        match node {
            Node::Directory { digest, .. } => child_digests.push(digest.clone()),
            other => {
                // report against whichever other entry differs.
                let first = nodes
                    .iter()
                    .find(|n| *n != other)
                    .unwrap_or(other);
                return Err(MergeError::Conflict {
                    path: path.to_path_buf(),
                    first: describe(first),
                    second: describe(other),
                });
            }
        }
    }

    let merged = merge_directories(directory_service, child_digests, path.to_path_buf()).await?;
    let node = merged.as_node();
    directory_service.put(merged).await?;
    Ok(node)
}
