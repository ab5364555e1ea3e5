//! Writes a directory tree from the castore onto a real filesystem.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::blobservice::BlobService;
use crate::directoryservice::DirectoryService;
use crate::{B3Digest, DirectoryDigest, Error, Node};

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("directory {0} not found")]
    DirectoryNotFound(B3Digest),

    #[error("blob {0} for {1} not found")]
    BlobNotFound(B3Digest, PathBuf),

    #[error("blob for {0} has wrong size: expected {1}, got {2}")]
    SizeMismatch(PathBuf, u64, u64),

    #[error("storage error: {0}")]
    Storage(#[from] Error),

    #[error("i/o error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MaterializeError + '_ {
    move |e| MaterializeError::Io(path.to_path_buf(), e)
}

/// Materializes the tree identified by `root` below `dest`.
///
/// `dest` is created if missing. Existing entries with colliding names are
/// not removed, so callers usually pass a fresh directory.
/// Files are streamed from the [BlobService], executable files get mode
/// `0o755`, others `0o644`, symlinks are created verbatim.
#[instrument(skip(blob_service, directory_service), fields(directory.digest=%root), err)]
pub async fn materialize<BS, DS>(
    blob_service: &BS,
    directory_service: &DS,
    root: &DirectoryDigest,
    dest: &Path,
) -> Result<(), MaterializeError>
where
    BS: BlobService + ?Sized,
    DS: DirectoryService + ?Sized,
{
    let mut worklist: Vec<(B3Digest, PathBuf)> = vec![(root.hash().clone(), dest.to_path_buf())];

    while let Some((digest, path)) = worklist.pop() {
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(io_err(&path))?;

        // the empty directory is implicitly present in every store.
        if &digest == DirectoryDigest::empty().hash() {
            continue;
        }

        let directory = directory_service
            .get(&digest)
            .await?
            .ok_or_else(|| MaterializeError::DirectoryNotFound(digest.clone()))?;

        for (name, node) in directory.into_nodes() {
            let entry_path = path.join(name.as_str());
            match node {
                Node::Directory { digest, .. } => worklist.push((digest, entry_path)),
                Node::File {
                    digest,
                    size,
                    executable,
                } => {
                    write_file(blob_service, &digest, size, executable, &entry_path).await?;
                }
                Node::Symlink { target } => {
                    tokio::fs::symlink(target.as_str(), &entry_path)
                        .await
                        .map_err(io_err(&entry_path))?;
                }
            }
        }
    }

    Ok(())
}

async fn write_file<BS>(
    blob_service: &BS,
    digest: &B3Digest,
    size: u64,
    executable: bool,
    path: &Path,
) -> Result<(), MaterializeError>
where
    BS: BlobService + ?Sized,
{
    let mut reader = blob_service
        .open_read(digest)
        .await
        .map_err(|e| MaterializeError::Storage(e.into()))?
        .ok_or_else(|| MaterializeError::BlobNotFound(digest.clone(), path.to_path_buf()))?;

    let mut file = tokio::fs::File::create(path).await.map_err(io_err(path))?;
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(io_err(path))?;
    if written != size {
        return Err(MaterializeError::SizeMismatch(
            path.to_path_buf(),
            size,
            written,
        ));
    }

    let mode = if executable { 0o755 } else { 0o644 };
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await
        .map_err(io_err(path))?;

    debug!(path=?path, blob.digest=%digest, "materialized file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::materialize;
    use crate::blobservice::MemoryBlobService;
    use crate::directoryservice::MemoryDirectoryService;
    use crate::import::fs::ingest_path;
    use crate::{DirectoryDigest, Node};

    #[tokio::test]
    async fn ingest_then_materialize() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub").join("data"), b"hello").unwrap();
        std::fs::write(src.path().join("run.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            src.path().join("run.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("sub/data", src.path().join("link")).unwrap();

        let blob_service = MemoryBlobService::default();
        let directory_service = MemoryDirectoryService::default();

        let root = match ingest_path(blob_service.clone(), directory_service.clone(), src.path())
            .await
            .expect("must ingest")
        {
            Node::Directory { digest, size } => DirectoryDigest::from_node(digest, size),
            other => panic!("unexpected root {:?}", other),
        };

        let dest = TempDir::new().unwrap();
        let out = dest.path().join("out");
        materialize(&blob_service, &directory_service, &root, &out)
            .await
            .expect("must materialize");

        assert_eq!(
            b"hello".to_vec(),
            std::fs::read(out.join("sub").join("data")).unwrap()
        );
        assert_eq!(
            std::path::PathBuf::from("sub/data"),
            std::fs::read_link(out.join("link")).unwrap()
        );
        let mode = std::fs::metadata(out.join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(0, mode & 0o100, "must be executable");
        let mode = std::fs::metadata(out.join("sub").join("data"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(0, mode & 0o100, "must not be executable");
    }

    #[tokio::test]
    async fn missing_directory() {
        let dest = TempDir::new().unwrap();
        let result = materialize(
            &MemoryBlobService::default(),
            &MemoryDirectoryService::default(),
            &crate::fixtures::DIRECTORY_B.digest(),
            dest.path(),
        )
        .await;
        assert!(result.is_err());
    }
}
