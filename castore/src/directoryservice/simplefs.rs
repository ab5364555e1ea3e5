use std::path::PathBuf;

use futures::stream::BoxStream;
use prost::Message;
use tokio::io::AsyncWriteExt;
use tonic::async_trait;
use tracing::{instrument, warn};

use super::utils::traverse_directory;
use super::DirectoryService;
use crate::blobservice::simplefs::derive_path;
use crate::{proto, B3Digest, Directory, DirectoryDigest, DirectoryError, Error};

/// Stores directories on a POSIX-compliant filesystem, using the same layout
/// as [crate::blobservice::SimpleFilesystemBlobService]:
/// `directories/HEX[:2]/HEX` holds the canonical protobuf encoding, staged
/// through `tmp/` and moved into place atomically.
#[derive(Clone)]
pub struct SimpleFilesystemDirectoryService {
    path: PathBuf,
}

impl SimpleFilesystemDirectoryService {
    pub async fn new(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("directories")).await?;

        Ok(Self { path })
    }
}

#[async_trait]
impl DirectoryService for SimpleFilesystemDirectoryService {
    #[instrument(skip(self, digest), err, fields(directory.digest = %digest))]
    async fn get(&self, digest: &B3Digest) -> Result<Option<Directory>, Error> {
        let data = match tokio::fs::read(derive_path(&self.path, "directories", digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Validate the retrieved Directory indeed has the
        // digest we expect it to have, to detect corruptions.
        let actual_digest = B3Digest::of(&data);
        if actual_digest != *digest {
            return Err(Error::StorageError(
                DirectoryError::DigestMismatch {
                    expected: digest.clone(),
                    actual: actual_digest,
                }
                .to_string(),
            ));
        }

        let directory = proto::Directory::decode(data.as_slice()).map_err(|e| {
            Error::StorageError(format!("unable to parse directory {}: {}", digest, e))
        })?;

        match Directory::try_from(directory) {
            Ok(directory) => Ok(Some(directory)),
            Err(e) => {
                warn!(err=%e, "directory failed validation");
                Err(Error::StorageError(format!(
                    "directory {} failed validation: {}",
                    digest, e,
                )))
            }
        }
    }

    #[instrument(skip(self, directory), err)]
    async fn put(&self, directory: Directory) -> Result<DirectoryDigest, Error> {
        let data = proto::Directory::from(&directory).encode_to_vec();
        let digest = DirectoryDigest::from_node(B3Digest::of(&data), directory.size());

        let dst_path = derive_path(&self.path, "directories", digest.hash());
        if tokio::fs::try_exists(&dst_path).await? {
            return Ok(digest);
        }

        let mut file = async_tempfile::TempFile::new_in(self.path.join("tmp"))
            .await
            .map_err(|e| Error::StorageError(e.to_string()))?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;

        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(file.file_path(), &dst_path).await?;

        Ok(digest)
    }

    #[instrument(skip_all, fields(directory.digest = %root_directory_digest))]
    fn get_recursive(
        &self,
        root_directory_digest: &B3Digest,
    ) -> BoxStream<'static, Result<Directory, Error>> {
        traverse_directory(self.clone(), root_directory_digest)
    }

    #[instrument(skip(self, digest), ret, err, fields(directory.digest = %digest))]
    async fn delete(&self, digest: &B3Digest) -> Result<bool, Error> {
        match tokio::fs::remove_file(derive_path(&self.path, "directories", digest)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
