use std::path::{Path, PathBuf};

use kiln_castore::B3Digest;
use prost::Message;
use tonic::async_trait;
use tracing::instrument;

use super::ActionCache;
use crate::executionservice::{ExecutionError, ProcessResult};
use crate::proto::ExecuteResponse;

/// Stores process results next to the blobs and directories of a
/// simplefs store: `actions/HEX[:2]/HEX` holds the protobuf encoded
/// [ExecuteResponse], staged through `tmp/` and renamed into place.
#[derive(Clone)]
pub struct SimpleFilesystemActionCache {
    path: PathBuf,
}

impl SimpleFilesystemActionCache {
    pub async fn new(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("actions")).await?;

        Ok(Self { path })
    }

    fn entry_path(&self, key: &B3Digest) -> PathBuf {
        shard(&self.path, key)
    }
}

fn shard(root: &Path, key: &B3Digest) -> PathBuf {
    let name = key.to_hex();
    root.join("actions").join(&name[..2]).join(name)
}

#[async_trait]
impl ActionCache for SimpleFilesystemActionCache {
    #[instrument(skip_all, err, fields(action.key = %key))]
    async fn get(&self, key: &B3Digest) -> Result<Option<ProcessResult>, ExecutionError> {
        let data = match tokio::fs::read(self.entry_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let response = ExecuteResponse::decode(data.as_slice()).map_err(|e| {
            ExecutionError::Capture(format!("unable to parse cached result {}: {}", key, e))
        })?;
        Ok(Some(response.try_into()?))
    }

    #[instrument(skip_all, err, fields(action.key = %key))]
    async fn put(&self, key: &B3Digest, result: &ProcessResult) -> Result<(), ExecutionError> {
        let data = ExecuteResponse::from(result.clone()).encode_to_vec();

        let tmp_path = self.path.join("tmp").join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&tmp_path, &data).await?;

        let dst_path = self.entry_path(key);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &dst_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kiln_castore::fixtures::{BLOB_A_DIGEST, DIRECTORY_WITH_KEEP};
    use kiln_castore::{B3Digest, Digest};
    use tempfile::TempDir;

    use super::SimpleFilesystemActionCache;
    use crate::actioncache::ActionCache;
    use crate::executionservice::ProcessResult;

    #[tokio::test]
    async fn entries_survive_reopening() {
        let tmpdir = TempDir::new().unwrap();
        let key = B3Digest::of(b"some process");
        let result = ProcessResult {
            exit_code: 0,
            stdout: BLOB_A_DIGEST.clone(),
            stderr: Digest::of_bytes(b""),
            output_root: DIRECTORY_WITH_KEEP.digest(),
        };

        let cache = SimpleFilesystemActionCache::new(tmpdir.path().to_owned())
            .await
            .unwrap();
        assert_eq!(None, cache.get(&key).await.unwrap());
        cache.put(&key, &result).await.unwrap();

        let reopened = SimpleFilesystemActionCache::new(tmpdir.path().to_owned())
            .await
            .unwrap();
        assert_eq!(Some(result), reopened.get(&key).await.unwrap());

        let hex = key.to_hex();
        assert!(tmpdir
            .path()
            .join("actions")
            .join(&hex[..2])
            .join(&hex)
            .is_file());
        assert_eq!(
            0,
            std::fs::read_dir(tmpdir.path().join("tmp")).unwrap().count(),
            "staging files must be moved away"
        );
    }

    #[tokio::test]
    async fn corrupt_entries_are_errors() {
        let tmpdir = TempDir::new().unwrap();
        let key = B3Digest::of(b"some process");
        let cache = SimpleFilesystemActionCache::new(tmpdir.path().to_owned())
            .await
            .unwrap();

        let path = cache.entry_path(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\xff\xff\xff").unwrap();

        assert!(cache.get(&key).await.is_err());
    }
}
