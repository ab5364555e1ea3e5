use crate::{B3Digest, Directory, DirectoryDigest, Error};

use futures::stream::BoxStream;
use tonic::async_trait;

mod from_addr;
mod memory;
mod simplefs;
#[cfg(test)]
pub mod tests;
mod utils;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryDirectoryService;
pub use self::simplefs::SimpleFilesystemDirectoryService;
pub use self::utils::traverse_directory;

/// The base trait all Directory services need to implement.
/// This is a simple get and put of [Directory], returning their
/// digest.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Looks up a single Directory message by its digest.
    /// The returned Directory message *must* be valid.
    /// In case the directory is not found, Ok(None) is returned.
    async fn get(&self, digest: &B3Digest) -> Result<Option<Directory>, Error>;

    /// Uploads a single Directory message, and returns the calculated
    /// digest, or an error. An error *must* also be returned if the message is
    /// not valid.
    async fn put(&self, directory: Directory) -> Result<DirectoryDigest, Error>;

    /// Looks up a closure of [Directory].
    ///
    /// This returns a pinned, boxed stream. The pinning allows for it to be polled easily,
    /// and the box allows different underlying stream implementations to be returned since
    /// Rust doesn't support this as a generic in traits yet. This is the same thing that
    /// [async_trait] generates, but for streams instead of futures.
    ///
    /// The individually returned Directory messages *must* be valid.
    /// Directories are sent in an order from the root to the leaves, so that
    /// the receiving side can validate each message to be a connected to the root
    /// that has initially been requested.
    ///
    /// In case the directory can not be found, this should return an empty stream.
    fn get_recursive(
        &self,
        root_directory_digest: &B3Digest,
    ) -> BoxStream<'static, Result<Directory, Error>>;

    /// Removes a single Directory message. Children are left untouched.
    /// Returns whether the directory was present.
    async fn delete(&self, digest: &B3Digest) -> Result<bool, Error>;
}

#[async_trait]
impl<A> DirectoryService for A
where
    A: AsRef<dyn DirectoryService> + Send + Sync,
{
    async fn get(&self, digest: &B3Digest) -> Result<Option<Directory>, Error> {
        self.as_ref().get(digest).await
    }

    async fn put(&self, directory: Directory) -> Result<DirectoryDigest, Error> {
        self.as_ref().put(directory).await
    }

    fn get_recursive(
        &self,
        root_directory_digest: &B3Digest,
    ) -> BoxStream<'static, Result<Directory, Error>> {
        self.as_ref().get_recursive(root_directory_digest)
    }

    async fn delete(&self, digest: &B3Digest) -> Result<bool, Error> {
        self.as_ref().delete(digest).await
    }
}
