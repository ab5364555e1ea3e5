//! A [ContentStore] combines a [BlobService] and a [DirectoryService] into the
//! single store the engine works against, and tracks what it holds so
//! unreferenced content can be garbage collected.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tonic::async_trait;
use tracing::{debug, info, instrument};

use crate::blobservice::{BlobReader, BlobService, BlobWriter};
use crate::directoryservice::DirectoryService;
use crate::import::{fs, ingest_entries, IngestionEntry, IngestionError};
use crate::materialize::MaterializeError;
use crate::merge::MergeError;
use crate::{proto, B3Digest, Digest, Directory, DirectoryDigest, DirectoryError, Error, Node};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Kind {
    Blob,
    Directory,
}

#[derive(Clone, Debug)]
struct Tracked {
    bytes: u64,
    last_access: u64,
}

/// Outcome of a [ContentStore::gc] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub evicted: u64,
    pub freed_bytes: u64,
}

struct Inner {
    blob_service: Arc<dyn BlobService>,
    directory_service: Arc<dyn DirectoryService>,

    /// Everything written or read through this store, with its size and the
    /// logical time of the last access.
    tracked: DashMap<(Kind, B3Digest), Tracked>,
    /// Retained roots and their reference counts.
    roots: DashMap<B3Digest, u64>,
    clock: AtomicU64,
    capacity_bytes: u64,
}

impl Inner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records an access. Zero-sized content frees nothing, so it's not tracked.
    fn touch(&self, kind: Kind, digest: &B3Digest, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let now = self.tick();
        self.tracked
            .entry((kind, digest.clone()))
            .and_modify(|t| t.last_access = now)
            .or_insert(Tracked {
                bytes,
                last_access: now,
            });
    }

    /// Bumps the access stamp of an already tracked entry.
    fn refresh(&self, kind: Kind, digest: &B3Digest) {
        if let Some(mut tracked) = self.tracked.get_mut(&(kind, digest.clone())) {
            tracked.last_access = self.tick();
        }
    }

    fn touch_directory(&self, directory: &Directory) {
        let encoded = proto::Directory::from(directory);
        self.touch(
            Kind::Directory,
            &encoded.digest(),
            encoded.encoded_len() as u64,
        );
    }
}

/// The content store.
///
/// Cloning is cheap, all clones share the same backing services and
/// bookkeeping. It implements [BlobService] and [DirectoryService] itself,
/// so it can be handed to anything generic over those.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<Inner>,
}

impl ContentStore {
    /// Creates a store whose [ContentStore::gc] evicts all unreferenced content.
    pub fn new<BS, DS>(blob_service: BS, directory_service: DS) -> Self
    where
        BS: BlobService + 'static,
        DS: DirectoryService + 'static,
    {
        Self::with_capacity(blob_service, directory_service, 0)
    }

    /// Creates a store whose [ContentStore::gc] only evicts unreferenced
    /// content while more than `capacity_bytes` are tracked.
    pub fn with_capacity<BS, DS>(blob_service: BS, directory_service: DS, capacity_bytes: u64) -> Self
    where
        BS: BlobService + 'static,
        DS: DirectoryService + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                blob_service: Arc::new(blob_service),
                directory_service: Arc::new(directory_service),
                tracked: DashMap::new(),
                roots: DashMap::new(),
                clock: AtomicU64::new(0),
                capacity_bytes,
            }),
        }
    }

    /// Constructs both backing services from their URLs, see
    /// [crate::blobservice::from_addr] and [crate::directoryservice::from_addr].
    pub async fn from_addrs(
        blob_service_addr: &str,
        directory_service_addr: &str,
        capacity_bytes: u64,
    ) -> Result<Self, Error> {
        let blob_service = crate::blobservice::from_addr(blob_service_addr).await?;
        let directory_service = crate::directoryservice::from_addr(directory_service_addr).await?;
        Ok(Self::with_capacity(
            blob_service,
            directory_service,
            capacity_bytes,
        ))
    }

    /// Stores a blob held in memory.
    pub async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        self.put_reader(io::Cursor::new(data)).await
    }

    /// Stores a blob streamed from `reader`.
    #[instrument(skip_all, err)]
    pub async fn put_reader<R>(&self, mut reader: R) -> Result<Digest, Error>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut writer = self.inner.blob_service.open_write().await;
        tokio::io::copy(&mut reader, &mut writer).await?;
        let digest = writer.close().await?;
        self.inner.touch(Kind::Blob, &digest.hash, digest.size);
        debug!(blob.digest=%digest, "stored blob");
        Ok(digest)
    }

    /// Opens a blob for streaming reads, or returns [Error::NotFound].
    pub async fn open_read(&self, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        let reader = self
            .inner
            .blob_service
            .open_read(&digest.hash)
            .await?
            .ok_or_else(|| Error::NotFound(digest.clone()))?;
        self.inner.touch(Kind::Blob, &digest.hash, digest.size);
        Ok(reader)
    }

    /// Reads a whole blob into memory.
    #[instrument(skip(self), fields(blob.digest=%digest), err)]
    pub async fn get(&self, digest: &Digest) -> Result<Bytes, Error> {
        let mut reader = self.open_read(digest).await?;
        let mut buf = Vec::with_capacity(digest.size as usize);
        reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != digest.size {
            return Err(Error::StorageError(format!(
                "blob {} has {} bytes, expected {}",
                digest.hash,
                buf.len(),
                digest.size
            )));
        }
        Ok(buf.into())
    }

    /// Looks up a single directory.
    pub async fn get_directory(&self, digest: &DirectoryDigest) -> Result<Directory, Error> {
        if *digest == DirectoryDigest::empty() {
            return Ok(Directory::new());
        }
        DirectoryService::get(self, digest.hash())
            .await?
            .ok_or_else(|| Error::NotFound(digest.as_digest().clone()))
    }

    /// Stores a directory whose children are already present.
    /// A missing child yields [Error::NotFound] naming that child.
    #[instrument(skip_all, err)]
    pub async fn put_directory(&self, directory: Directory) -> Result<DirectoryDigest, Error> {
        for (_, node) in directory.nodes() {
            match node {
                Node::Directory { digest, size } => {
                    if digest != DirectoryDigest::empty().hash()
                        && self.inner.directory_service.get(digest).await?.is_none()
                    {
                        return Err(Error::NotFound(Digest::new(digest.clone(), *size)));
                    }
                }
                Node::File { digest, size, .. } => {
                    if !self.inner.blob_service.has(digest).await? {
                        return Err(Error::NotFound(Digest::new(digest.clone(), *size)));
                    }
                }
                Node::Symlink { .. } => {}
            }
        }
        DirectoryService::put(self, directory).await
    }

    /// Builds and stores a tree from a flat list of entries, in any order.
    ///
    /// Missing intermediate directories, including the root (the empty
    /// path), are created. Referenced blobs must already be present.
    #[instrument(skip_all, err)]
    pub async fn put_tree<I>(&self, entries: I) -> Result<DirectoryDigest, IngestionError<Error>>
    where
        I: IntoIterator<Item = IngestionEntry>,
    {
        let mut by_path: BTreeMap<PathBuf, IngestionEntry> = BTreeMap::new();
        by_path.insert(PathBuf::new(), IngestionEntry::Dir { path: PathBuf::new() });

        for entry in entries {
            let path = entry.path().to_path_buf();
            if path.as_os_str().is_empty() && !entry.is_dir() {
                return Err(IngestionError::InvalidEntry(
                    path,
                    DirectoryError::InvalidName(String::new()),
                ));
            }

            if let IngestionEntry::Regular { digest, size, .. } = &entry {
                if !self.inner.blob_service.has(digest).await.map_err(Error::from)? {
                    return Err(Error::NotFound(Digest::new(digest.clone(), *size)).into());
                }
            }

            let mut parent = path.parent();
            while let Some(p) = parent {
                by_path
                    .entry(p.to_path_buf())
                    .or_insert_with(|| IngestionEntry::Dir {
                        path: p.to_path_buf(),
                    });
                parent = p.parent();
            }

            match by_path.get(&path) {
                Some(existing) if !(existing.is_dir() && entry.is_dir()) => {
                    return Err(IngestionError::InvalidEntry(
                        path.clone(),
                        DirectoryError::DuplicateName(path.display().to_string()),
                    ));
                }
                _ => {
                    by_path.insert(path, entry);
                }
            }
        }

        // children before their parents, the root last.
        let mut ordered: Vec<IngestionEntry> = by_path.into_values().collect();
        ordered.sort_by_key(|e| Reverse(e.path().components().count()));

        let root = ingest_entries(
            self.clone(),
            futures::stream::iter(ordered.into_iter().map(Ok::<_, Error>)),
        )
        .await?;

        match root {
            Node::Directory { digest, size } => Ok(DirectoryDigest::from_node(digest, size)),
            _ => Err(IngestionError::InvalidEntry(
                PathBuf::new(),
                DirectoryError::InvalidName(String::new()),
            )),
        }
    }

    /// Imports a path from the host filesystem.
    pub async fn ingest_path<P>(&self, path: P) -> Result<Node, IngestionError<fs::Error>>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        fs::ingest_path(self.clone(), self.clone(), path).await
    }

    /// Writes the tree at `root` below `dest`.
    pub async fn materialize(&self, root: &DirectoryDigest, dest: &Path) -> Result<(), MaterializeError> {
        crate::materialize::materialize(self, self, root, dest).await
    }

    /// Merges several trees into one.
    pub async fn merge(&self, roots: &[DirectoryDigest]) -> Result<DirectoryDigest, MergeError> {
        crate::merge::merge(self, roots).await
    }

    /// Marks `digest` (a blob, or a directory and everything below it) as
    /// live. Retains are counted.
    pub fn retain(&self, digest: &B3Digest) {
        *self.inner.roots.entry(digest.clone()).or_insert(0) += 1;
    }

    /// Drops one retain of `digest`. Returns false if it wasn't retained.
    pub fn release(&self, digest: &B3Digest) -> bool {
        let released = match self.inner.roots.get_mut(digest) {
            Some(mut count) => {
                *count -= 1;
                true
            }
            None => false,
        };
        self.inner.roots.remove_if(digest, |_, count| *count == 0);
        released
    }

    /// Total size of all tracked content.
    pub fn tracked_bytes(&self) -> u64 {
        self.inner.tracked.iter().map(|e| e.bytes).sum()
    }

    async fn live_set(&self) -> Result<HashSet<B3Digest>, Error> {
        let roots: Vec<B3Digest> = self.inner.roots.iter().map(|e| e.key().clone()).collect();

        let mut live = HashSet::new();
        for root in roots {
            live.insert(root.clone());
            let mut closure = self.inner.directory_service.get_recursive(&root);
            while let Some(directory) = closure.try_next().await? {
                live.insert(directory.digest().hash().clone());
                for (_, node) in directory.nodes() {
                    if let Node::File { digest, .. } = node {
                        live.insert(digest.clone());
                    }
                }
            }
        }
        Ok(live)
    }

    /// Evicts content not reachable from a retained root, least recently
    /// used first, until the tracked size drops to the configured capacity.
    /// Content accessed while the collection runs is left alone.
    #[instrument(skip(self), err)]
    pub async fn gc(&self) -> Result<GcStats, Error> {
        let start = self.inner.tick();
        let live = self.live_set().await?;

        let mut total = self.tracked_bytes();
        let mut candidates: Vec<((Kind, B3Digest), Tracked)> = self
            .inner
            .tracked
            .iter()
            .filter(|e| !live.contains(&e.key().1) && e.last_access < start)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        candidates.sort_by_key(|(_, t)| t.last_access);

        let mut stats = GcStats::default();
        for ((kind, digest), tracked) in candidates {
            if total <= self.inner.capacity_bytes {
                break;
            }
            if self.inner.roots.contains_key(&digest) {
                continue;
            }
            let removed = self
                .inner
                .tracked
                .remove_if(&(kind, digest.clone()), |_, t| t.last_access < start);
            if removed.is_none() {
                continue;
            }

            match kind {
                Kind::Blob => self.inner.blob_service.delete(&digest).await?,
                Kind::Directory => self.inner.directory_service.delete(&digest).await?,
            };
            debug!(digest=%digest, kind=?kind, bytes=tracked.bytes, "evicted");

            total -= tracked.bytes;
            stats.evicted += 1;
            stats.freed_bytes += tracked.bytes;
        }

        info!(evicted = stats.evicted, freed_bytes = stats.freed_bytes, "gc finished");
        Ok(stats)
    }
}

/// Wraps the backing writer so closing it records the new blob.
struct TrackingWriter {
    writer: Box<dyn BlobWriter>,
    inner: Arc<Inner>,
}

impl AsyncWrite for TrackingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[async_trait]
impl BlobWriter for TrackingWriter {
    async fn close(&mut self) -> io::Result<Digest> {
        let digest = self.writer.close().await?;
        self.inner.touch(Kind::Blob, &digest.hash, digest.size);
        Ok(digest)
    }
}

#[async_trait]
impl BlobService for ContentStore {
    #[instrument(skip_all, ret, err, fields(blob.digest=%digest))]
    async fn has(&self, digest: &B3Digest) -> io::Result<bool> {
        self.inner.blob_service.has(digest).await
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn open_read(&self, digest: &B3Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        let reader = self.inner.blob_service.open_read(digest).await?;
        if reader.is_some() {
            self.inner.refresh(Kind::Blob, digest);
        }
        Ok(reader)
    }

    async fn open_write(&self) -> Box<dyn BlobWriter> {
        Box::new(TrackingWriter {
            writer: self.inner.blob_service.open_write().await,
            inner: self.inner.clone(),
        })
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn delete(&self, digest: &B3Digest) -> io::Result<bool> {
        self.inner.tracked.remove(&(Kind::Blob, digest.clone()));
        self.inner.blob_service.delete(digest).await
    }
}

#[async_trait]
impl DirectoryService for ContentStore {
    #[instrument(skip_all, err, fields(directory.digest=%digest))]
    async fn get(&self, digest: &B3Digest) -> Result<Option<Directory>, Error> {
        let directory = self.inner.directory_service.get(digest).await?;
        if let Some(directory) = &directory {
            self.inner.touch_directory(directory);
        }
        Ok(directory)
    }

    #[instrument(skip_all, err, fields(directory.digest))]
    async fn put(&self, directory: Directory) -> Result<DirectoryDigest, Error> {
        self.inner.touch_directory(&directory);
        let digest = self.inner.directory_service.put(directory).await?;
        tracing::Span::current().record("directory.digest", digest.to_string());
        Ok(digest)
    }

    fn get_recursive(
        &self,
        root_directory_digest: &B3Digest,
    ) -> BoxStream<'static, Result<Directory, Error>> {
        let inner = self.inner.clone();
        self.inner
            .directory_service
            .get_recursive(root_directory_digest)
            .inspect_ok(move |directory| inner.touch_directory(directory))
            .boxed()
    }

    #[instrument(skip_all, err, fields(directory.digest=%digest))]
    async fn delete(&self, digest: &B3Digest) -> Result<bool, Error> {
        self.inner.tracked.remove(&(Kind::Directory, digest.clone()));
        self.inner.directory_service.delete(digest).await
    }
}
