use crate::{B3Digest, Directory, DirectoryDigest, Error};
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::async_trait;
use tracing::instrument;

use super::utils::traverse_directory;
use super::DirectoryService;

/// Keeps validated [Directory] structs in a [HashMap].
/// As they're already parsed, no revalidation happens on read.
#[derive(Clone, Default)]
pub struct MemoryDirectoryService {
    db: Arc<RwLock<HashMap<B3Digest, Directory>>>,
}

#[async_trait]
impl DirectoryService for MemoryDirectoryService {
    #[instrument(skip(self, digest), fields(directory.digest = %digest))]
    async fn get(&self, digest: &B3Digest) -> Result<Option<Directory>, Error> {
        Ok(self.db.read().get(digest).cloned())
    }

    #[instrument(skip(self, directory), err)]
    async fn put(&self, directory: Directory) -> Result<DirectoryDigest, Error> {
        let digest = directory.digest();

        self.db.write().insert(digest.hash().clone(), directory);

        Ok(digest)
    }

    #[instrument(skip_all, fields(directory.digest = %root_directory_digest))]
    fn get_recursive(
        &self,
        root_directory_digest: &B3Digest,
    ) -> BoxStream<'static, Result<Directory, Error>> {
        traverse_directory(self.clone(), root_directory_digest)
    }

    #[instrument(skip(self, digest), ret, fields(directory.digest = %digest))]
    async fn delete(&self, digest: &B3Digest) -> Result<bool, Error> {
        Ok(self.db.write().remove(digest).is_some())
    }
}
