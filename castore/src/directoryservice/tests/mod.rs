//! This contains test scenarios that a given [DirectoryService] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all services we want to test
//! against, and then apply this template to all test functions.

use futures::StreamExt;
use rstest::*;
use rstest_reuse::{self, *};

use super::DirectoryService;
use crate::directoryservice;
use crate::fixtures::{DIRECTORY_A, DIRECTORY_B, DIRECTORY_C, DIRECTORY_COMPLICATED, DIRECTORY_WITH_KEEP};
use crate::Directory;

async fn make_simplefs_directory_service() -> Box<dyn DirectoryService> {
    let path = tempfile::TempDir::new()
        .expect("must create tempdir")
        .into_path();
    Box::new(
        directoryservice::SimpleFilesystemDirectoryService::new(path)
            .await
            .expect("must succeed"),
    )
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(directoryservice::from_addr("memory://").await.unwrap())]
#[case::simplefs(make_simplefs_directory_service().await)]
pub fn directory_services(#[case] directory_service: impl DirectoryService) {}

/// Ensures asking for a directory that doesn't exist returns a Ok(None), and a get_recursive
/// returns an empty stream.
#[apply(directory_services)]
#[tokio::test]
async fn test_non_exist(directory_service: impl DirectoryService) {
    // single get
    assert_eq!(
        Ok(None),
        directory_service.get(DIRECTORY_A.digest().hash()).await
    );

    // recursive get
    assert_eq!(
        Vec::<Result<Directory, crate::Error>>::new(),
        directory_service
            .get_recursive(DIRECTORY_A.digest().hash())
            .collect::<Vec<Result<Directory, crate::Error>>>()
            .await
    );
}

/// Putting a single directory into the store, and then getting it out both via
/// `.get[_recursive]` should work.
#[apply(directory_services)]
#[tokio::test]
async fn put_get(directory_service: impl DirectoryService) {
    // Insert a Directory.
    let digest = directory_service.put(DIRECTORY_A.clone()).await.unwrap();
    assert_eq!(DIRECTORY_A.digest(), digest, "returned digest must match");

    // single get
    assert_eq!(
        Some(DIRECTORY_A.clone()),
        directory_service
            .get(DIRECTORY_A.digest().hash())
            .await
            .unwrap()
    );

    // recursive get
    assert_eq!(
        vec![Ok(DIRECTORY_A.clone())],
        directory_service
            .get_recursive(DIRECTORY_A.digest().hash())
            .collect::<Vec<_>>()
            .await
    );
}

/// Putting a closure leaves-first should allow getting it back out root-first,
/// with duplicate children only sent once.
#[apply(directory_services)]
#[tokio::test]
async fn put_get_closure_dedup(directory_service: impl DirectoryService) {
    directory_service.put(DIRECTORY_A.clone()).await.unwrap();
    directory_service.put(DIRECTORY_A.clone()).await.unwrap();
    let root_digest = directory_service.put(DIRECTORY_C.clone()).await.unwrap();
    assert_eq!(DIRECTORY_C.digest(), root_digest, "root digest should match");

    // DIRECTORY_C refers to DIRECTORY_A twice, which must only be returned once.
    assert_eq!(
        vec![Ok(DIRECTORY_C.clone()), Ok(DIRECTORY_A.clone())],
        directory_service
            .get_recursive(DIRECTORY_C.digest().hash())
            .collect::<Vec<_>>()
            .await
    )
}

#[apply(directory_services)]
#[tokio::test]
async fn put_get_complicated(directory_service: impl DirectoryService) {
    directory_service
        .put(DIRECTORY_WITH_KEEP.clone())
        .await
        .unwrap();
    directory_service
        .put(DIRECTORY_COMPLICATED.clone())
        .await
        .unwrap();

    assert_eq!(
        vec![
            Ok(DIRECTORY_COMPLICATED.clone()),
            Ok(DIRECTORY_WITH_KEEP.clone())
        ],
        directory_service
            .get_recursive(DIRECTORY_COMPLICATED.digest().hash())
            .collect::<Vec<_>>()
            .await
    )
}

/// A closure with a missing child must produce an error once it reaches it.
#[apply(directory_services)]
#[tokio::test]
async fn get_recursive_dangling(directory_service: impl DirectoryService) {
    // DIRECTORY_B refers to DIRECTORY_A, which is never uploaded.
    directory_service.put(DIRECTORY_B.clone()).await.unwrap();

    let results = directory_service
        .get_recursive(DIRECTORY_B.digest().hash())
        .collect::<Vec<_>>()
        .await;

    assert_eq!(2, results.len());
    assert_eq!(Ok(DIRECTORY_B.clone()), results[0]);
    assert!(results[1].is_err(), "missing child must be an error");
}

#[apply(directory_services)]
#[tokio::test]
async fn put_delete(directory_service: impl DirectoryService) {
    directory_service.put(DIRECTORY_A.clone()).await.unwrap();

    assert!(directory_service
        .delete(DIRECTORY_A.digest().hash())
        .await
        .unwrap());
    assert_eq!(
        Ok(None),
        directory_service.get(DIRECTORY_A.digest().hash()).await
    );
    assert!(!directory_service
        .delete(DIRECTORY_A.digest().hash())
        .await
        .unwrap());
}
