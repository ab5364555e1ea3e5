use std::sync::Arc;
use std::time::Duration;

use kiln_build::actioncache::{self, ActionCache, CombinedActionCache};
use kiln_build::executionservice::{self, CachedExecutionService, ExecutionError, ExecutionService};
use kiln_castore::ContentStore;
use serde::Deserialize;
use tracing::info;

use crate::invalidation::{InvalidationWatcher, PollingWatcher};
use crate::rule_graph::RuleGraph;
use crate::scheduler::Scheduler;

/// Engine settings, usually deserialized from the embedding tool's config
/// file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Size of the worker pool, defaults to the number of cores.
    pub worker_threads: Option<usize>,

    /// See [kiln_castore::blobservice::from_addr].
    pub blob_service_addr: String,
    /// See [kiln_castore::directoryservice::from_addr].
    pub directory_service_addr: String,
    /// See [kiln_build::executionservice::from_addr].
    pub execution_service_addr: String,
    /// Where process results are remembered across runs, see
    /// [kiln_build::actioncache::from_addr]. Without one, every process
    /// runs at least once per scheduler.
    pub action_cache_addr: Option<String>,
    /// A cache shared with other hosts, consulted on local misses.
    /// Ignored without `action_cache_addr`.
    pub remote_action_cache_addr: Option<String>,

    /// Unreferenced content is only collected while the store tracks more
    /// than this.
    pub gc_capacity_bytes: u64,
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            blob_service_addr: "memory://".to_string(),
            directory_service_addr: "memory://".to_string(),
            execution_service_addr: "local://".to_string(),
            action_cache_addr: None,
            remote_action_cache_addr: None,
            gc_capacity_bytes: 0,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("unable to set up store: {0}")]
    Store(#[from] kiln_castore::Error),

    #[error("unable to set up execution service: {0}")]
    Execution(#[from] ExecutionError),

    #[error("worker_threads must be at least 1")]
    NoWorkerThreads,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Starts a worker pool and constructs the services, returning a
    /// scheduler owning all of them. Must not be called from within an
    /// async context.
    pub fn build(&self, graph: RuleGraph) -> Result<Scheduler, ConfigError> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("kiln-worker");
        match self.worker_threads {
            Some(0) => return Err(ConfigError::NoWorkerThreads),
            Some(worker_threads) => {
                builder.worker_threads(worker_threads);
            }
            None => {}
        }
        let runtime = builder.build()?;

        let (store, execution_service) = runtime.block_on(async {
            let store = ContentStore::from_addrs(
                &self.blob_service_addr,
                &self.directory_service_addr,
                self.gc_capacity_bytes,
            )
            .await?;
            let execution_service =
                executionservice::from_addr(&self.execution_service_addr, store.clone(), store.clone())
                    .await?;
            let execution_service: Arc<dyn ExecutionService> = match self.action_cache().await? {
                Some(cache) => Arc::new(CachedExecutionService::new(
                    execution_service,
                    cache,
                    store.clone(),
                    store.clone(),
                )),
                None => Arc::from(execution_service),
            };
            Ok::<_, ConfigError>((store, execution_service))
        })?;

        info!(
            blob_service_addr = %self.blob_service_addr,
            directory_service_addr = %self.directory_service_addr,
            execution_service_addr = %self.execution_service_addr,
            action_cache_addr = ?self.action_cache_addr,
            "engine configured"
        );

        Ok(Scheduler::with_runtime(graph, store, execution_service, runtime))
    }

    async fn action_cache(&self) -> Result<Option<Box<dyn ActionCache>>, ExecutionError> {
        let Some(addr) = &self.action_cache_addr else {
            return Ok(None);
        };
        let local = actioncache::from_addr(addr).await?;
        let cache: Box<dyn ActionCache> = match &self.remote_action_cache_addr {
            Some(remote) => Box::new(CombinedActionCache::new(
                local,
                actioncache::from_addr(remote).await?,
            )),
            None => local,
        };
        Ok(Some(cache))
    }

    /// Starts polling the scheduler's watched roots at the configured interval.
    pub fn spawn_polling_watcher(&self, scheduler: &Scheduler) -> std::io::Result<InvalidationWatcher> {
        let watcher = PollingWatcher::new(scheduler.clone(), self.poll_interval());
        scheduler.handle().block_on(watcher.spawn())
    }
}
