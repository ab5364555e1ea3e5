use std::io;

use tonic::async_trait;
use tracing::{instrument, warn};

use crate::B3Digest;

use super::{BlobReader, BlobService, BlobWriter};

/// Combinator for a BlobService, using a "local" and "remote" blobservice.
/// Requests are tried in (and returned from) the local store first, only if
/// things are not present there, the remote BlobService is queried.
/// Blobs fetched from the remote are copied into the local store before
/// being handed out, so a second read is served locally.
/// The remote BlobService is never written to.
pub struct CombinedBlobService<BL, BR> {
    local: BL,
    remote: BR,
}

impl<BL, BR> CombinedBlobService<BL, BR> {
    pub fn new(local: BL, remote: BR) -> Self {
        Self { local, remote }
    }
}

impl<BL, BR> Clone for CombinedBlobService<BL, BR>
where
    BL: Clone,
    BR: Clone,
{
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
        }
    }
}

#[async_trait]
impl<BL, BR> BlobService for CombinedBlobService<BL, BR>
where
    BL: BlobService + 'static,
    BR: BlobService + 'static,
{
    #[instrument(skip(self, digest), fields(blob.digest=%digest))]
    async fn has(&self, digest: &B3Digest) -> io::Result<bool> {
        Ok(self.local.has(digest).await? || self.remote.has(digest).await?)
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest), err)]
    async fn open_read(&self, digest: &B3Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        if let Some(reader) = self.local.open_read(digest).await? {
            return Ok(Some(reader));
        }

        let mut remote_reader = match self.remote.open_read(digest).await? {
            // blob doesn't exist on the remote side either, nothing we can do.
            None => return Ok(None),
            Some(r) => r,
        };

        // populate the local store, and verify what we received.
        let mut local_writer = self.local.open_write().await;
        tokio::io::copy(&mut remote_reader, &mut local_writer).await?;
        let written = local_writer.close().await?;

        if &written.hash != digest {
            warn!(blob.received=%written.hash, "remote returned wrong blob contents");
            self.local.delete(&written.hash).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("remote returned {} for {}", written.hash, digest),
            ));
        }

        self.local.open_read(digest).await
    }

    #[instrument(skip_all)]
    async fn open_write(&self) -> Box<dyn BlobWriter> {
        // direct writes to the local one.
        self.local.open_write().await
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest))]
    async fn delete(&self, digest: &B3Digest) -> io::Result<bool> {
        // only the local copy is ours to drop.
        self.local.delete(digest).await
    }
}
