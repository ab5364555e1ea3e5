use std::{
    io,
    path::{Path, PathBuf},
    pin::pin,
    task::Poll,
};

use pin_project_lite::pin_project;
use tokio::io::AsyncWriteExt;
use tonic::async_trait;
use tracing::{debug, instrument};

use crate::{B3Digest, Digest};

use super::{BlobReader, BlobService, BlobWriter};

/// Stores blobs on an existing path backed by a POSIX-compliant filesystem.
///
/// It takes an existing path, builds a `tmp` directory and a `blobs` directory inside of it. All
/// blobs received are staged in that `tmp` directory, then they are moved **atomically** into
/// `blobs/HEX[:2]/HEX` in a sharding style, e.g. `abcdef…` gets turned into `ab/abcdef…`.
/// A crash mid-write therefore never leaves a partial blob under `blobs/`.
#[derive(Clone)]
pub struct SimpleFilesystemBlobService {
    /// Where the blobs are located on a filesystem already mounted.
    path: PathBuf,
}

impl SimpleFilesystemBlobService {
    pub async fn new(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("blobs")).await?;

        Ok(Self { path })
    }
}

pub(crate) fn derive_path(root: &Path, kind: &str, digest: &B3Digest) -> PathBuf {
    let pathname = digest.to_hex();

    root.join(kind).join(&pathname[..2]).join(pathname)
}

#[async_trait]
impl BlobService for SimpleFilesystemBlobService {
    #[instrument(skip_all, ret, err, fields(blob.digest=%digest))]
    async fn has(&self, digest: &B3Digest) -> io::Result<bool> {
        tokio::fs::try_exists(derive_path(&self.path, "blobs", digest)).await
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn open_read(&self, digest: &B3Digest) -> io::Result<Option<Box<dyn BlobReader>>> {
        let dst_path = derive_path(&self.path, "blobs", digest);
        match tokio::fs::File::open(dst_path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all)]
    async fn open_write(&self) -> Box<dyn BlobWriter> {
        let file = match async_tempfile::TempFile::new_in(self.path.join("tmp")).await {
            Ok(file) => Ok(file),
            Err(e) => match e {
                async_tempfile::Error::Io(io_error) => Err(io_error),
                async_tempfile::Error::InvalidFile => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "invalid or missing file specified",
                )),
                async_tempfile::Error::InvalidDirectory => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "invalid or missing directory specified",
                )),
            },
        };

        Box::new(SimpleFilesystemBlobWriter {
            root: self.path.clone(),
            file,
            digester: blake3::Hasher::new(),
            written: 0,
            digest: None,
        })
    }

    #[instrument(skip_all, ret, err, fields(blob.digest=%digest))]
    async fn delete(&self, digest: &B3Digest) -> io::Result<bool> {
        match tokio::fs::remove_file(derive_path(&self.path, "blobs", digest)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pin_project! {
    struct SimpleFilesystemBlobWriter {
        root: PathBuf,
        file: std::io::Result<async_tempfile::TempFile>,
        digester: blake3::Hasher,
        written: u64,
        digest: Option<Digest>,
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "this file is already closed",
    )
}

impl tokio::io::AsyncWrite for SimpleFilesystemBlobWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        let this = self.project();
        let writer = match this.file.as_mut() {
            Ok(writer) => writer,
            Err(e) => return Poll::Ready(Err(std::mem::replace(e, closed_error()))),
        };

        match pin!(writer).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.digester.update(&buf[..n]);
                *this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project().file.as_mut() {
            Ok(writer) => pin!(writer).poll_flush(cx),
            Err(e) => Poll::Ready(Err(std::mem::replace(e, closed_error()))),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project().file.as_mut() {
            Ok(writer) => pin!(writer).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(std::mem::replace(e, closed_error()))),
        }
    }
}

#[async_trait]
impl BlobWriter for SimpleFilesystemBlobWriter {
    async fn close(&mut self) -> io::Result<Digest> {
        if let Some(digest) = &self.digest {
            return Ok(digest.clone());
        }

        let writer = match self.file.as_mut() {
            Ok(writer) => writer,
            Err(e) => return Err(std::mem::replace(e, closed_error())),
        };
        writer.flush().await?;
        writer.sync_all().await?;

        let digest = Digest::new(self.digester.finalize().into(), self.written);
        let dst_path = derive_path(&self.root, "blobs", &digest.hash);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(writer.file_path(), &dst_path).await?;
        debug!(blob.digest=%digest.hash, path=?dst_path, "persisted blob");

        self.digest = Some(digest.clone());
        Ok(digest)
    }
}
