//! This contains test scenarios that a given [BlobService] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all services we want to test
//! against, and then apply this template to all test functions.

use rstest::*;
use rstest_reuse::{self, *};
use std::io;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;

use super::BlobService;
use crate::blobservice;
use crate::fixtures::BLOB_A;
use crate::fixtures::BLOB_A_DIGEST;
use crate::fixtures::BLOB_B;
use crate::fixtures::BLOB_B_DIGEST;

/// Creates a [blobservice::SimpleFilesystemBlobService] in a fresh temporary directory.
/// The directory is left behind once the test finishes.
async fn make_simplefs_blob_service() -> Box<dyn BlobService> {
    let path = tempfile::TempDir::new()
        .expect("must create tempdir")
        .into_path();
    Box::new(
        blobservice::SimpleFilesystemBlobService::new(path)
            .await
            .expect("must succeed"),
    )
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(blobservice::from_addr("memory://").await.unwrap())]
#[case::simplefs(make_simplefs_blob_service().await)]
pub fn blob_services(#[case] blob_service: impl BlobService) {}

/// Using [BlobService::has] on a non-existing blob should return false.
#[apply(blob_services)]
#[tokio::test]
async fn has_nonexistent_false(blob_service: impl BlobService) {
    assert!(!blob_service
        .has(&BLOB_A_DIGEST.hash)
        .await
        .expect("must not fail"));
}

/// Trying to read a non-existing blob should return a None instead of a reader.
#[apply(blob_services)]
#[tokio::test]
async fn not_found_read(blob_service: impl BlobService) {
    assert!(blob_service
        .open_read(&BLOB_A_DIGEST.hash)
        .await
        .expect("must not fail")
        .is_none())
}

/// Put a blob in the store, check has, get it back.
#[apply(blob_services)]
#[tokio::test]
async fn put_has_get(blob_service: impl BlobService) {
    for (blob_contents, blob_digest) in &[
        (&*BLOB_A, BLOB_A_DIGEST.clone()),
        (&*BLOB_B, BLOB_B_DIGEST.clone()),
    ] {
        let mut w = blob_service.open_write().await;

        let l = tokio::io::copy(&mut io::Cursor::new(blob_contents), &mut w)
            .await
            .expect("copy must succeed");
        assert_eq!(
            blob_contents.len(),
            l as usize,
            "written bytes must match blob length"
        );

        let digest = w.close().await.expect("close must succeed");

        assert_eq!(*blob_digest, digest, "returned digest must be correct");

        // closing again returns the same digest.
        assert_eq!(
            digest,
            w.close().await.expect("second close must succeed")
        );

        assert!(
            blob_service
                .has(&blob_digest.hash)
                .await
                .expect("must not fail"),
            "blob service should now have the blob"
        );

        let r = blob_service
            .open_read(&blob_digest.hash)
            .await
            .expect("open_read must succeed")
            .expect("must be some");

        let mut buf: Vec<u8> = Vec::new();
        let mut pinned_reader = std::pin::pin!(r);
        let l = tokio::io::copy(&mut pinned_reader, &mut buf)
            .await
            .expect("copy must succeed");

        assert_eq!(
            blob_contents.len(),
            l as usize,
            "read bytes must match blob length"
        );

        assert_eq!(&blob_contents[..], &buf, "read blob contents must match");
    }
}

/// Writing the same contents twice is idempotent.
#[apply(blob_services)]
#[tokio::test]
async fn put_twice(blob_service: impl BlobService) {
    for _ in 0..2 {
        let mut w = blob_service.open_write().await;
        tokio::io::copy(&mut io::Cursor::new(&BLOB_A.to_vec()), &mut w)
            .await
            .expect("copy must succeed");
        assert_eq!(*BLOB_A_DIGEST, w.close().await.expect("must succeed"));
    }
    assert!(blob_service.has(&BLOB_A_DIGEST.hash).await.unwrap());
}

/// Put a blob in the store, delete it, it's gone.
#[apply(blob_services)]
#[tokio::test]
async fn put_delete(blob_service: impl BlobService) {
    let mut w = blob_service.open_write().await;
    tokio::io::copy(&mut io::Cursor::new(&BLOB_A.to_vec()), &mut w)
        .await
        .expect("copy must succeed");
    w.close().await.expect("close must succeed");

    assert!(blob_service
        .delete(&BLOB_A_DIGEST.hash)
        .await
        .expect("must succeed"));
    assert!(!blob_service.has(&BLOB_A_DIGEST.hash).await.unwrap());

    // a second delete reports absence.
    assert!(!blob_service
        .delete(&BLOB_A_DIGEST.hash)
        .await
        .expect("must succeed"));
}

/// Put a blob in the store, and seek inside it a bit.
#[apply(blob_services)]
#[tokio::test]
async fn put_seek(blob_service: impl BlobService) {
    let mut w = blob_service.open_write().await;

    tokio::io::copy(&mut io::Cursor::new(&BLOB_B.to_vec()), &mut w)
        .await
        .expect("copy must succeed");
    w.close().await.expect("close must succeed");

    // open a blob for reading
    let mut r = blob_service
        .open_read(&BLOB_B_DIGEST.hash)
        .await
        .expect("open_read must succeed")
        .expect("must be some");

    let mut pos: u64 = 0;

    // read the first 10 bytes, they must match the data in the fixture.
    {
        let mut buf = [0; 10];
        r.read_exact(&mut buf).await.expect("must succeed");

        assert_eq!(
            &BLOB_B[pos as usize..pos as usize + buf.len()],
            buf,
            "expected first 10 bytes to match"
        );

        pos += buf.len() as u64;
    }

    // seek by 12345 bytes, using SeekFrom::Current.
    let p = r
        .seek(io::SeekFrom::Current(12345))
        .await
        .expect("must not fail");
    pos += 12345;
    assert_eq!(pos, p);

    {
        let mut buf = [0; 10];
        r.read_exact(&mut buf).await.expect("must succeed");

        assert_eq!(
            &BLOB_B[pos as usize..pos as usize + buf.len()],
            buf,
            "expected data to match"
        );
    }

    // seeking to the end is okay, but it returns no more data.
    let p = r
        .seek(io::SeekFrom::Start(BLOB_B.len() as u64))
        .await
        .expect("must not fail");
    assert_eq!(BLOB_B.len() as u64, p);

    let mut buf: Vec<u8> = Vec::new();
    r.read_to_end(&mut buf).await.expect("must not fail");
    assert!(buf.is_empty(), "expected no more data to be read");
}
