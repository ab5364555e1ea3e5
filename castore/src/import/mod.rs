//! The main library function here is [ingest_entries], receiving a stream of
//! [IngestionEntry].
//!
//! Specific implementations, such as ingesting from the filesystem, live in
//! child modules.

use crate::directoryservice::DirectoryService;
use crate::{B3Digest, Directory, Node, PathComponent};
use futures::{Stream, StreamExt};

use tracing::Level;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::instrument;

mod error;
pub use error::IngestionError;

pub mod fs;

/// Ingests [IngestionEntry] from the given stream into a the passed [DirectoryService].
/// On success, returns the root [Node].
///
/// The stream must have the following invariants:
/// - All children entries must come before their parents.
/// - The last entry must be the root node, which has the empty path.
/// - Every entry should have a unique path, and only consist of normal components.
///   This means, no absolute paths, `.` or `..`.
/// - All referenced directories must have an associated directory entry in the stream.
///   This means if there is a file entry for `foo/bar`, there must also be a `foo` directory
///   entry.
///
/// Internally we maintain a [HashMap] of [PathBuf] to partially populated [Directory] at that
/// path. Once we receive an [IngestionEntry] for the directory itself, we remove it from the
/// map and upload it to the [DirectoryService].
#[instrument(skip_all, ret(level = Level::TRACE), err)]
pub async fn ingest_entries<DS, S, E>(
    directory_service: DS,
    mut entries: S,
) -> Result<Node, IngestionError<E>>
where
    DS: DirectoryService,
    S: Stream<Item = Result<IngestionEntry, E>> + Send + std::marker::Unpin,
    E: std::error::Error,
{
    // For a given path, this holds the [Directory] structs as they are populated.
    let mut directories: HashMap<PathBuf, Directory> = HashMap::default();

    let root_node = loop {
        let entry = entries
            .next()
            .await
            .ok_or(IngestionError::UnexpectedEndOfStream)??;

        let node = match &entry {
            IngestionEntry::Dir { path } => {
                // If the entry is a directory, we traversed all its children (and
                // populated it in `directories`).
                // If we don't have it in there, it's an empty directory.
                let directory = directories.remove(path).unwrap_or_default();
                let node = directory.as_node();

                directory_service
                    .put(directory)
                    .await
                    .map_err(|e| IngestionError::UploadDirectoryError(path.to_owned(), e))?;

                node
            }
            IngestionEntry::Symlink { path, target } => Node::Symlink {
                target: target
                    .as_str()
                    .try_into()
                    .map_err(|e| IngestionError::InvalidEntry(path.to_owned(), e))?,
            },
            IngestionEntry::Regular {
                size,
                executable,
                digest,
                ..
            } => Node::File {
                digest: digest.to_owned(),
                size: *size,
                executable: *executable,
            },
        };

        let path = entry.path();
        let parent = match path.parent() {
            // The root has the empty path, which has no parent.
            None => break node,
            Some(parent) => parent,
        };

        let name = path
            .file_name()
            .ok_or_else(|| {
                IngestionError::InvalidEntry(
                    path.to_owned(),
                    crate::DirectoryError::InvalidName(path.display().to_string()),
                )
            })
            .and_then(|name| {
                PathComponent::try_from(name)
                    .map_err(|e| IngestionError::InvalidEntry(path.to_owned(), e))
            })?;

        // record node in parent directory, creating a new [Directory] if not there yet.
        directories
            .entry(parent.to_owned())
            .or_default()
            .add(name, node)
            .map_err(|e| IngestionError::InvalidEntry(path.to_owned(), e))?;
    };

    if !directories.is_empty() {
        return Err(IngestionError::Unconnected(
            directories.into_keys().collect(),
        ));
    }

    Ok(root_node)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IngestionEntry {
    Regular {
        path: PathBuf,
        size: u64,
        executable: bool,
        digest: B3Digest,
    },
    Symlink {
        path: PathBuf,
        target: String,
    },
    Dir {
        path: PathBuf,
    },
}

impl IngestionEntry {
    pub fn path(&self) -> &Path {
        match self {
            IngestionEntry::Regular { path, .. } => path,
            IngestionEntry::Symlink { path, .. } => path,
            IngestionEntry::Dir { path } => path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, IngestionEntry::Dir { .. })
    }
}

#[cfg(test)]
mod test {
    use std::convert::Infallible;

    use rstest::rstest;

    use crate::directoryservice::{DirectoryService, MemoryDirectoryService};
    use crate::fixtures::{
        DIRECTORY_COMPLICATED, DIRECTORY_WITH_KEEP, DUMMY_DIGEST, EMPTY_BLOB_DIGEST,
    };
    use crate::{Directory, Node};

    use super::{ingest_entries, IngestionEntry, IngestionError};

    #[rstest]
    #[case::single_file(vec![IngestionEntry::Regular {
        path: "".into(),
        size: 42,
        executable: true,
        digest: DUMMY_DIGEST.clone(),
    }],
        Node::File{digest: DUMMY_DIGEST.clone(), size: 42, executable: true}
    )]
    #[case::single_symlink(vec![IngestionEntry::Symlink {
        path: "".into(),
        target: "blub".into(),
    }],
        Node::Symlink{target: "blub".try_into().unwrap()}
    )]
    #[case::single_dir(vec![IngestionEntry::Dir {
        path: "".into(),
    }],
        Directory::new().as_node()
    )]
    #[case::dir_with_keep(vec![
        IngestionEntry::Regular {
            path: ".keep".into(),
            size: 0,
            executable: false,
            digest: EMPTY_BLOB_DIGEST.hash.clone(),
        },
        IngestionEntry::Dir {
            path: "".into(),
        },
    ],
        DIRECTORY_WITH_KEEP.as_node()
    )]
    /// This is intentionally a bit unsorted, though it still satisfies all
    /// requirements we have on the order of elements in the stream.
    #[case::directory_complicated(vec![
        IngestionEntry::Regular {
            path: "keep/.keep".into(),
            size: 0,
            executable: false,
            digest: EMPTY_BLOB_DIGEST.hash.clone(),
        },
        IngestionEntry::Regular {
            path: ".keep".into(),
            size: 0,
            executable: false,
            digest: EMPTY_BLOB_DIGEST.hash.clone(),
        },
        IngestionEntry::Dir {
            path: "keep".into(),
        },
        IngestionEntry::Symlink {
            path: "aa".into(),
            target: "/somewhere/else".into(),
        },
        IngestionEntry::Dir {
            path: "".into(),
        },
    ],
        DIRECTORY_COMPLICATED.as_node()
    )]
    #[tokio::test]
    async fn test_ingestion(#[case] entries: Vec<IngestionEntry>, #[case] exp_root_node: Node) {
        let directory_service = MemoryDirectoryService::default();

        let root_node = ingest_entries(
            directory_service.clone(),
            futures::stream::iter(entries.into_iter().map(Ok::<_, Infallible>)),
        )
        .await
        .expect("must succeed");

        assert_eq!(exp_root_node, root_node, "root node should match");

        if let Node::Directory { digest, .. } = root_node {
            assert!(
                directory_service.get(&digest).await.unwrap().is_some(),
                "root directory must be uploaded"
            );
        }
    }

    #[tokio::test]
    async fn test_end_of_stream() {
        let entries = vec![IngestionEntry::Dir {
            path: "blub".into(),
        }];

        let result = ingest_entries(
            MemoryDirectoryService::default(),
            futures::stream::iter(entries.into_iter().map(Ok::<_, Infallible>)),
        )
        .await;

        assert!(matches!(result, Err(IngestionError::UnexpectedEndOfStream)));
    }

    #[tokio::test]
    async fn test_unconnected() {
        // foo/bar never gets a "foo" directory entry.
        let entries = vec![
            IngestionEntry::Symlink {
                path: "foo/bar".into(),
                target: "x".into(),
            },
            IngestionEntry::Dir { path: "".into() },
        ];

        let result = ingest_entries(
            MemoryDirectoryService::default(),
            futures::stream::iter(entries.into_iter().map(Ok::<_, Infallible>)),
        )
        .await;

        assert!(matches!(result, Err(IngestionError::Unconnected(_))));
    }
}
