//! Imports that deal with a real filesystem.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::instrument;
use walkdir::DirEntry;
use walkdir::WalkDir;

use crate::blobservice::BlobService;
use crate::directoryservice::DirectoryService;
use crate::{Digest, Node};

use super::ingest_entries;
use super::IngestionEntry;
use super::IngestionError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to stat {0}: {1}")]
    UnableToStat(PathBuf, std::io::Error),

    #[error("unable to open {0}: {1}")]
    UnableToOpen(PathBuf, std::io::Error),

    #[error("unable to read {0}: {1}")]
    UnableToRead(PathBuf, std::io::Error),

    #[error("invalid encoding encountered for entry {0:?}")]
    InvalidEncoding(PathBuf),

    #[error("unsupported file {0} type: {1:?}")]
    FileType(PathBuf, std::fs::FileType),
}

/// Ingests the contents at a given path into the castore, interacting with a [BlobService] and
/// [DirectoryService]. It returns the root node or an error.
///
/// The root node describes `path` itself: for a directory, its children end up
/// directly inside the returned directory node.
/// It does not follow symlinks at the root, they will be ingested as actual symlinks.
///
/// This function will walk the filesystem using `walkdir` and will consume
/// `O(#number of entries)` space.
#[instrument(skip(blob_service, directory_service), fields(path), err)]
pub async fn ingest_path<BS, DS, P>(
    blob_service: BS,
    directory_service: DS,
    path: P,
) -> Result<Node, IngestionError<Error>>
where
    P: AsRef<Path> + std::fmt::Debug,
    BS: BlobService + Clone,
    DS: DirectoryService,
{
    let iter = WalkDir::new(path.as_ref())
        .follow_links(false)
        .follow_root_links(false)
        .contents_first(true)
        .into_iter();

    let entries = dir_entries_to_ingestion_stream(blob_service, iter, path.as_ref());
    ingest_entries(directory_service, entries).await
}

/// Converts an iterator of [walkdir::DirEntry]s into a stream of ingestion entries.
/// This can then be fed into [ingest_entries] to ingest all the entries into the castore.
///
/// The produced stream is buffered, so uploads can happen concurrently.
///
/// The root is the [Path] in the filesystem that is being ingested into the castore.
pub fn dir_entries_to_ingestion_stream<'a, BS, I>(
    blob_service: BS,
    iter: I,
    root: &'a Path,
) -> BoxStream<'a, Result<IngestionEntry, Error>>
where
    BS: BlobService + Clone + 'a,
    I: Iterator<Item = Result<DirEntry, walkdir::Error>> + Send + 'a,
{
    Box::pin(
        futures::stream::iter(iter)
            .map(move |x| {
                let blob_service = blob_service.clone();
                async move {
                    match x {
                        Ok(dir_entry) => {
                            dir_entry_to_ingestion_entry(blob_service, &dir_entry, root).await
                        }
                        Err(e) => {
                            let path = e.path().unwrap_or(root).to_path_buf();
                            Err(Error::UnableToStat(path, e.into()))
                        }
                    }
                }
            })
            .buffered(50),
    )
}

/// Converts a [walkdir::DirEntry] into an [IngestionEntry], uploading blobs to the
/// provided [BlobService].
///
/// The root path is stripped from the path of each entry, so the root itself
/// ends up with the empty path.
pub async fn dir_entry_to_ingestion_entry<BS>(
    blob_service: BS,
    entry: &DirEntry,
    root: &Path,
) -> Result<IngestionEntry, Error>
where
    BS: BlobService,
{
    let file_type = entry.file_type();

    let path = entry
        .path()
        .strip_prefix(root)
        .map_err(|_| Error::InvalidEncoding(entry.path().to_path_buf()))?
        .to_path_buf();

    if file_type.is_dir() {
        Ok(IngestionEntry::Dir { path })
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(entry.path())
            .map_err(|e| Error::UnableToStat(entry.path().to_path_buf(), e))?
            .into_os_string()
            .into_string()
            .map_err(|_| Error::InvalidEncoding(entry.path().to_path_buf()))?;

        Ok(IngestionEntry::Symlink { path, target })
    } else if file_type.is_file() {
        let metadata = entry
            .metadata()
            .map_err(|e| Error::UnableToStat(entry.path().to_path_buf(), e.into()))?;

        let digest = upload_blob_at_path(blob_service, entry.path()).await?;

        Ok(IngestionEntry::Regular {
            path,
            size: metadata.size(),
            // If it's executable by the user, it'll become executable.
            executable: metadata.permissions().mode() & 64 != 0,
            digest: digest.hash,
        })
    } else {
        Err(Error::FileType(entry.path().to_path_buf(), file_type))
    }
}

/// Uploads the file at the provided [Path] the the [BlobService].
#[instrument(skip(blob_service), fields(path), err)]
pub async fn upload_blob_at_path<BS>(blob_service: BS, path: &Path) -> Result<Digest, Error>
where
    BS: BlobService,
{
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => return Err(Error::UnableToOpen(path.to_path_buf(), e)),
    };

    let mut writer = blob_service.open_write().await;

    if let Err(e) = tokio::io::copy(&mut file, &mut writer).await {
        return Err(Error::UnableToRead(path.to_path_buf(), e));
    };

    writer
        .close()
        .await
        .map_err(|e| Error::UnableToRead(path.to_path_buf(), e))
}
