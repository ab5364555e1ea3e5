use futures::TryStreamExt;
use kiln_castore::blobservice::BlobService;
use kiln_castore::directoryservice::DirectoryService;
use kiln_castore::fingerprint::Fingerprint;
use kiln_castore::{Digest, DirectoryDigest, Node};
use tonic::async_trait;
use tracing::{debug, instrument, warn, Span};

use super::{ExecutionError, ExecutionService, ProcessDescriptor, ProcessResult};
use crate::actioncache::ActionCache;

/// Serves processes from an [ActionCache] if they ran before, and records
/// successful runs of the inner [ExecutionService].
///
/// A cached result is only served while stdout, stderr and the whole
/// output tree are still present in the store. Otherwise the process runs
/// again and the entry is overwritten.
pub struct CachedExecutionService<ES, AC, BS, DS> {
    inner: ES,
    cache: AC,
    blob_service: BS,
    directory_service: DS,
}

impl<ES, AC, BS, DS> CachedExecutionService<ES, AC, BS, DS> {
    pub fn new(inner: ES, cache: AC, blob_service: BS, directory_service: DS) -> Self {
        Self {
            inner,
            cache,
            blob_service,
            directory_service,
        }
    }
}

impl<ES, AC, BS, DS> CachedExecutionService<ES, AC, BS, DS>
where
    BS: BlobService,
    DS: DirectoryService,
{
    async fn has_blob(&self, digest: &Digest) -> Result<bool, ExecutionError> {
        Ok(digest.size == 0 || self.blob_service.has(&digest.hash).await?)
    }

    async fn has_tree(&self, root: &DirectoryDigest) -> Result<bool, ExecutionError> {
        if *root == DirectoryDigest::empty() {
            return Ok(true);
        }
        let missing = |e: kiln_castore::Error| ExecutionError::Materialization(e.to_string());
        if self.directory_service.get(root.hash()).await.map_err(missing)?.is_none() {
            return Ok(false);
        }

        let mut directories = self.directory_service.get_recursive(root.hash());
        loop {
            let directory = match directories.try_next().await {
                Ok(Some(directory)) => directory,
                Ok(None) => return Ok(true),
                // a child directory is gone.
                Err(_) => return Ok(false),
            };
            for (_, node) in directory.nodes() {
                if let Node::File { digest, size, .. } = node {
                    if *size > 0 && !self.blob_service.has(digest).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Whether everything `result` refers to can still be read.
    async fn is_complete(&self, result: &ProcessResult) -> Result<bool, ExecutionError> {
        Ok(self.has_blob(&result.stdout).await?
            && self.has_blob(&result.stderr).await?
            && self.has_tree(&result.output_root).await?)
    }
}

#[async_trait]
impl<ES, AC, BS, DS> ExecutionService for CachedExecutionService<ES, AC, BS, DS>
where
    ES: ExecutionService,
    AC: ActionCache,
    BS: BlobService,
    DS: DirectoryService,
{
    #[instrument(skip_all, err, fields(process.description = %descriptor.description, action.key, action.cached))]
    async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, ExecutionError> {
        let key = descriptor.fingerprint();
        let span = Span::current();
        span.record("action.key", key.to_string());

        match self.cache.get(&key).await {
            Ok(Some(result)) if self.is_complete(&result).await? => {
                span.record("action.cached", true);
                return Ok(result);
            }
            Ok(Some(_)) => debug!("cached result refers to evicted content"),
            Ok(None) => {}
            Err(e) => warn!(err = %e, "action cache lookup failed"),
        }
        span.record("action.cached", false);

        let result = self.inner.execute(descriptor).await?;
        if result.success() {
            if let Err(e) = self.cache.put(&key, &result).await {
                warn!(err = %e, "unable to record process result");
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use kiln_castore::blobservice::{BlobService, MemoryBlobService};
    use kiln_castore::directoryservice::MemoryDirectoryService;
    use kiln_castore::fingerprint::Fingerprint;
    use kiln_castore::import::IngestionEntry;
    use kiln_castore::{ContentStore, DirectoryDigest};
    use tempfile::TempDir;
    use tonic::async_trait;

    use super::CachedExecutionService;
    use crate::actioncache::{ActionCache, MemoryActionCache, SimpleFilesystemActionCache};
    use crate::executionservice::{
        ExecutionError, ExecutionService, LocalExecutionService, ProcessDescriptor, ProcessResult,
    };

    /// Counts the runs reaching the wrapped service.
    struct Counting<ES> {
        inner: ES,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl<ES: ExecutionService> ExecutionService for Counting<ES> {
        async fn execute(
            &self,
            descriptor: ProcessDescriptor,
        ) -> Result<ProcessResult, ExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(descriptor).await
        }
    }

    fn memory_store() -> ContentStore {
        ContentStore::new(
            MemoryBlobService::default(),
            MemoryDirectoryService::default(),
        )
    }

    fn gen_service<AC: ActionCache>(
        sandbox_root: &TempDir,
        store: &ContentStore,
        cache: AC,
    ) -> (impl ExecutionService, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let local =
            LocalExecutionService::new(sandbox_root.path().to_owned(), store.clone(), store.clone());
        let service = CachedExecutionService::new(
            Counting {
                inner: local,
                runs: runs.clone(),
            },
            cache,
            store.clone(),
            store.clone(),
        );
        (service, runs)
    }

    fn writes_output(script: &str) -> ProcessDescriptor {
        ProcessDescriptor::new(["/bin/sh", "-c", script], DirectoryDigest::empty()).output("out")
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let sandboxes = TempDir::new().unwrap();
        let store = memory_store();
        let cache = MemoryActionCache::default();
        let (service, runs) = gen_service(&sandboxes, &store, cache.clone());

        let descriptor = writes_output("echo built; echo data > out");
        let first = service.execute(descriptor.clone()).await.unwrap();
        let second = service.execute(descriptor.clone()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(1, runs.load(Ordering::SeqCst));
        assert_eq!(
            Some(first),
            cache.get(&descriptor.fingerprint()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let sandboxes = TempDir::new().unwrap();
        let store = memory_store();
        let cache = MemoryActionCache::default();
        let (service, runs) = gen_service(&sandboxes, &store, cache.clone());

        let descriptor = writes_output("echo data > out; exit 3");
        assert_eq!(3, service.execute(descriptor.clone()).await.unwrap().exit_code);
        assert_eq!(3, service.execute(descriptor.clone()).await.unwrap().exit_code);

        assert_eq!(2, runs.load(Ordering::SeqCst));
        assert_eq!(None, cache.get(&descriptor.fingerprint()).await.unwrap());
    }

    #[tokio::test]
    async fn evicted_outputs_rerun() {
        let sandboxes = TempDir::new().unwrap();
        let store = memory_store();
        let cache = MemoryActionCache::default();
        let (service, runs) = gen_service(&sandboxes, &store, cache.clone());

        let descriptor = writes_output("echo data > out");
        let result = service.execute(descriptor.clone()).await.unwrap();

        // drop the file inside the output tree, keeping the tree itself.
        let out = kiln_castore::Digest::of_bytes(b"data\n");
        assert!(BlobService::delete(&store, &out.hash).await.unwrap());

        let again = service.execute(descriptor).await.unwrap();
        assert_eq!(result, again);
        assert_eq!(2, runs.load(Ordering::SeqCst));
        assert!(store.has(&out.hash).await.unwrap());
    }

    #[tokio::test]
    async fn cache_is_shared_through_the_filesystem() {
        let sandboxes = TempDir::new().unwrap();
        let actions = TempDir::new().unwrap();
        let store = memory_store();

        let input = store.put("input".into()).await.unwrap();
        let input_root = store
            .put_tree(vec![IngestionEntry::Regular {
                path: "in".into(),
                size: input.size,
                executable: false,
                digest: input.hash.clone(),
            }])
            .await
            .unwrap();
        let descriptor = ProcessDescriptor::new(["/bin/sh", "-c", "cat in > out"], input_root)
            .env("PATH", "/bin:/usr/bin")
            .output("out");

        let (first, first_runs) = gen_service(
            &sandboxes,
            &store,
            SimpleFilesystemActionCache::new(actions.path().to_owned())
                .await
                .unwrap(),
        );
        first.execute(descriptor.clone()).await.unwrap();

        let (second, second_runs) = gen_service(
            &sandboxes,
            &store,
            SimpleFilesystemActionCache::new(actions.path().to_owned())
                .await
                .unwrap(),
        );
        second.execute(descriptor).await.unwrap();

        assert_eq!(1, first_runs.load(Ordering::SeqCst));
        assert_eq!(0, second_runs.load(Ordering::SeqCst));
    }
}
