//! Remote executor for kiln engines.
//!
//! Runs the processes it receives against a content store it shares with
//! its clients, optionally remembering results in an action cache so other
//! engines pointed at the same store skip work already done.
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use kiln_build::actioncache;
use kiln_build::executionservice::{self, CachedExecutionService, ExecutionService};
use kiln_build::proto::{execution_service_server::ExecutionServiceServer, GRPCExecutionServiceWrapper};
use kiln_castore::ContentStore;
use tokio_listener::{Listener, ListenerAddress, SystemOptions, UserOptions};
use tonic::transport::Server;
use tracing::{info, Level};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Serves `kiln.build.v1.ExecutionService` over gRPC.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Log level, overridden by `RUST_LOG` when set.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// TCP address or unix socket path (`/run/kiln/build.sock`) to listen on.
    #[arg(long, short = 'l', env = "KILN_BUILD_LISTEN", default_value = "[::]:8000")]
    listen: String,

    #[command(flatten)]
    store: StoreOptions,

    /// Where processes run, see [executionservice::from_addr].
    #[arg(long, env = "KILN_EXECUTOR", default_value = "local://")]
    executor: String,

    /// Remembers results of successful processes, see [actioncache::from_addr].
    #[arg(long, env = "KILN_ACTION_CACHE")]
    action_cache: Option<String>,
}

/// The content store shared with clients. Only digests travel over the wire.
#[derive(Args)]
struct StoreOptions {
    #[arg(long, env = "KILN_BLOBS", default_value = "simplefs:///var/lib/kiln/store")]
    blobs: String,

    #[arg(long, env = "KILN_DIRECTORIES", default_value = "simplefs:///var/lib/kiln/store")]
    directories: String,
}

impl StoreOptions {
    async fn open(&self) -> anyhow::Result<ContentStore> {
        // the executor never collects garbage, clients do.
        ContentStore::from_addrs(&self.blobs, &self.directories, u64::MAX)
            .await
            .context("opening content store")
    }
}

async fn executor(options: &Options, store: ContentStore) -> anyhow::Result<Arc<dyn ExecutionService>> {
    let local = executionservice::from_addr(&options.executor, store.clone(), store.clone())
        .await
        .with_context(|| format!("setting up executor {}", options.executor))?;

    let Some(addr) = &options.action_cache else {
        return Ok(Arc::from(local));
    };
    let cache = actioncache::from_addr(addr)
        .await
        .with_context(|| format!("opening action cache {addr}"))?;
    Ok(Arc::new(CachedExecutionService::new(local, cache, store.clone(), store)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    let _ = kiln_tracing::TracingBuilder::default()
        .level(options.log_level)
        .build()?;

    let store = options.store.open().await?;
    let executor = executor(&options, store).await?;

    let address: ListenerAddress = options
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", options.listen))?;
    let listener = Listener::bind(&address, &SystemOptions::default(), &UserOptions::default())
        .await
        .with_context(|| format!("binding {address}"))?;

    info!(
        listen = %address,
        executor = %options.executor,
        action_cache = ?options.action_cache,
        "serving executions"
    );

    Server::builder()
        .add_service(ExecutionServiceServer::new(GRPCExecutionServiceWrapper::new(
            executor,
        )))
        .serve_with_incoming(listener)
        .await?;

    Ok(())
}
