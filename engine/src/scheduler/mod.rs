//! The execution side of the engine: a memo table of [NodeKey]s, each
//! computed at most once, shared by everyone requesting it, and removed
//! again when the files it was derived from change.
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use kiln_build::executionservice::ExecutionService;
use kiln_castore::{ContentStore, Directory, DirectoryDigest, GcStats, Node, PathComponent};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, instrument, trace, Instrument};

use crate::error::{Failure, FailureKind, RequestError};
use crate::rule_graph::{GraphNodeKind, NodeId, RuleGraph};
use crate::types::{Params, TypeKey, Value};

mod context;
mod entry;
mod waits;


pub use context::RuleContext;
pub use entry::NodeKey;

use entry::{Entry, Join};
use waits::WaitGraph;

/// Outcome of [Scheduler::invalidate_paths].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationResult {
    /// Number of memoized entries removed.
    pub cleared: usize,
    /// The generation after the invalidation.
    pub generation: u64,
}

/// The chain of nodes a request was made through, innermost first.
pub(crate) struct Chain {
    key: NodeKey,
    parent: Option<Arc<Chain>>,
}

impl Chain {
    fn contains(&self, key: &NodeKey) -> bool {
        let mut link = Some(self);
        while let Some(chain) = link {
            if &chain.key == key {
                return true;
            }
            link = chain.parent.as_deref();
        }
        false
    }
}

pub(crate) struct Inner {
    graph: Arc<RuleGraph>,
    store: ContentStore,
    execution_service: Arc<dyn ExecutionService>,

    entries: DashMap<NodeKey, Arc<Entry>>,
    waits: WaitGraph,
    /// Paths read by intrinsics, ordered so everything below a path is a
    /// contiguous range.
    paths: RwLock<BTreeSet<PathBuf>>,
    watch_roots: RwLock<Vec<PathBuf>>,

    generation: AtomicU64,
    next_run: AtomicU64,

    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs requests against a compiled [RuleGraph].
///
/// Cloning is cheap, clones share the memo table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler spawning its work on `handle`.
    pub fn new(
        graph: RuleGraph,
        store: ContentStore,
        execution_service: Arc<dyn ExecutionService>,
        handle: Handle,
    ) -> Self {
        Self::build(graph, store, execution_service, handle, None)
    }

    /// Creates a scheduler owning `runtime`, which is shut down once the
    /// last clone is dropped.
    pub fn with_runtime(
        graph: RuleGraph,
        store: ContentStore,
        execution_service: Arc<dyn ExecutionService>,
        runtime: Runtime,
    ) -> Self {
        let handle = runtime.handle().clone();
        Self::build(graph, store, execution_service, handle, Some(runtime))
    }

    fn build(
        graph: RuleGraph,
        store: ContentStore,
        execution_service: Arc<dyn ExecutionService>,
        handle: Handle,
        runtime: Option<Runtime>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Arc::new(graph),
                store,
                execution_service,
                entries: DashMap::new(),
                waits: WaitGraph::default(),
                paths: RwLock::new(BTreeSet::new()),
                watch_roots: RwLock::new(vec![]),
                generation: AtomicU64::new(0),
                next_run: AtomicU64::new(0),
                handle,
                runtime: Mutex::new(runtime),
            }),
        }
    }

    pub fn graph(&self) -> &RuleGraph {
        &self.inner.graph
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Bumped by every invalidation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Number of entries in the memo table.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Computes a `product` for `params`, which must match a compiled query.
    #[instrument(skip_all, fields(product=%product), err)]
    pub async fn request_value(&self, product: TypeKey, params: Params) -> Result<Value, RequestError> {
        let node = self
            .inner
            .graph
            .query(product, &params.type_keys())
            .ok_or_else(|| RequestError::NoSuchQuery {
                product: product.to_string(),
                params: params
                    .type_keys()
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        Ok(self.inner.request_node(node, &params, None).await?)
    }

    /// Removes every entry derived from the given paths, and everything
    /// depending on those, transitively.
    ///
    /// A path matches entries reading the path itself, anything below it,
    /// or any of its ancestors.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub fn invalidate_paths(&self, paths: &[PathBuf]) -> InvalidationResult {
        let mut matched: BTreeSet<PathBuf> = BTreeSet::new();
        {
            let index = self.inner.paths.read();
            for changed in paths {
                let changed = normalize(changed);
                matched.extend(
                    index
                        .range(changed.clone()..)
                        .take_while(|p| p.starts_with(&changed))
                        .cloned(),
                );
                matched.extend(
                    changed
                        .ancestors()
                        .skip(1)
                        .filter(|a| index.contains(*a))
                        .map(Path::to_path_buf),
                );
            }
        }

        let mut worklist: Vec<NodeKey> = vec![];
        {
            let mut index = self.inner.paths.write();
            for path in matched {
                index.remove(&path);
                worklist.push(NodeKey::DigestFile(path.clone()));
                worklist.push(NodeKey::Snapshot(path));
            }
        }

        let mut seen: HashSet<NodeKey> = HashSet::new();
        let mut cleared = 0;
        while let Some(key) = worklist.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some((_, entry)) = self.inner.entries.remove(&key) {
                trace!(key=?key, "invalidated");
                cleared += 1;
                worklist.extend(entry.invalidate(&self.inner.store));
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(cleared, generation, "invalidated paths");

        InvalidationResult {
            cleared,
            generation,
        }
    }

    /// Adds roots whose changes should be acted on by watchers.
    pub fn watch<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut roots = self.inner.watch_roots.write();
        for path in paths {
            let path = normalize(path.as_ref());
            if !roots.contains(&path) {
                roots.push(path);
            }
        }
    }

    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.inner.watch_roots.read().clone()
    }

    /// Whether a change at `path` concerns a watched root, by being in it or
    /// by containing it.
    pub fn is_watched(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.inner
            .watch_roots
            .read()
            .iter()
            .any(|root| path.starts_with(root) || root.starts_with(&path))
    }

    /// Collects store content that no memoized entry refers to anymore.
    pub async fn gc(&self) -> Result<GcStats, kiln_castore::Error> {
        self.inner.store.gc().await
    }
}

/// Makes `path` absolute without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl Inner {
    /// Requests the value of graph node `node`, with the subset of `params`
    /// it uses.
    pub(crate) async fn request_node(
        self: &Arc<Self>,
        node: NodeId,
        params: &Params,
        chain: Option<&Arc<Chain>>,
    ) -> Result<Value, Failure> {
        let graph_node = self.graph.node(node);
        match graph_node.kind() {
            GraphNodeKind::Param(type_key) => params.get(type_key).cloned().ok_or_else(|| {
                Failure::new(FailureKind::NotFound(format!("param {}", type_key)))
            }),
            GraphNodeKind::Rule(rule) => {
                let key = NodeKey::Task {
                    rule,
                    params: params.restrict(graph_node.used_params()),
                };
                self.join(key, Some(node), chain).await
            }
        }
    }

    /// Requests an intrinsic, see [NodeKey].
    pub(crate) async fn request(
        self: &Arc<Self>,
        key: NodeKey,
        chain: Option<&Arc<Chain>>,
    ) -> Result<Value, Failure> {
        self.join(key, None, chain).await
    }

    /// Requests `key`, joining an existing run if there is one. A new run of
    /// a task executes graph node `node`. `chain` is the requesting node,
    /// recorded as a dependent.
    async fn join(
        self: &Arc<Self>,
        key: NodeKey,
        node: Option<NodeId>,
        chain: Option<&Arc<Chain>>,
    ) -> Result<Value, Failure> {
        if let Some(chain) = chain {
            if chain.contains(&key) {
                return Err(Failure::new(FailureKind::Cycle(self.describe(&key))));
            }
        }

        loop {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Entry::new(key.clone())))
                .clone();

            if let Some(chain) = chain {
                entry.add_dependent(chain.key.clone());
            }
            // registered before checking, so a concurrent invalidation
            // either sees the edge or we see the flag.
            if entry.is_invalidated() {
                self.entries.remove_if(&key, |_, e| Arc::ptr_eq(e, &entry));
                continue;
            }

            let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
            let join =
                entry.join_or_start(run_id, || self.start(entry.clone(), run_id, node, chain));

            let run = match join {
                Join::Ready(result) => return result,
                Join::Wait(run) => run,
            };
            let Some(chain) = chain else {
                return run.await;
            };

            // the run may have been started by another request, and be
            // waiting on us already.
            let _waiting = self
                .waits
                .wait(&chain.key, &key)
                .ok_or_else(|| Failure::new(FailureKind::Cycle(self.describe(&key))))?;
            return run.await;
        }
    }

    /// Spawns a run of `entry`. The returned future owns the run, dropping
    /// it cancels the run.
    fn start(
        self: &Arc<Self>,
        entry: Arc<Entry>,
        run_id: u64,
        node: Option<NodeId>,
        parent: Option<&Arc<Chain>>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        let inner = self.clone();
        let chain = Arc::new(Chain {
            key: entry.key().clone(),
            parent: parent.cloned(),
        });
        let span = tracing::debug_span!("run", node = %self.describe(entry.key()));

        let run = async move {
            let result = inner.run(node, chain).await;
            entry.complete(run_id, &result, &inner.store);
            result
        }
        .instrument(span);

        let (remote, handle) = run.remote_handle();
        self.handle.spawn(remote);
        handle.boxed()
    }

    async fn run(self: &Arc<Self>, node: Option<NodeId>, chain: Arc<Chain>) -> Result<Value, Failure> {
        let key = chain.key.clone();
        let result = match (&key, node) {
            (NodeKey::Task { params, .. }, Some(node)) => self.run_task(node, params, &chain).await,
            (NodeKey::Task { .. }, None) => Err(Failure::new(FailureKind::TypeMismatch(
                "task requested without a graph node".to_string(),
            ))),
            (NodeKey::DigestFile(path), _) => {
                self.index_path(path);
                self.digest_file(path).await
            }
            (NodeKey::Snapshot(path), _) => {
                self.index_path(path);
                self.snapshot(path).await
            }
            (NodeKey::Process(descriptor), _) => self
                .execution_service
                .execute(descriptor.as_ref().clone())
                .await
                .map(Value::new)
                .map_err(Failure::from),
        };
        result.map_err(|failure| failure.with_frame(self.describe(&key)))
    }

    async fn run_task(
        self: &Arc<Self>,
        node: NodeId,
        params: &Params,
        chain: &Arc<Chain>,
    ) -> Result<Value, Failure> {
        let graph_node = self.graph.node(node);
        let rule = self.graph.rule(node).ok_or_else(|| {
            Failure::new(FailureKind::TypeMismatch(format!("{:?} is not a rule", node)))
        })?;

        let inputs = futures::future::join_all(
            graph_node
                .inputs()
                .iter()
                .map(|input| self.request_node(*input, params, Some(chain))),
        )
        .await
        // the first failure in declaration order wins.
        .into_iter()
        .collect::<Result<Vec<Value>, Failure>>()?;

        let ctx = RuleContext::new(self.clone(), node, params.clone(), chain.clone());
        let output = rule.body().run(ctx, inputs).await?;

        if output.type_key() != rule.output() {
            return Err(Failure::new(FailureKind::TypeMismatch(format!(
                "rule {} returned a {}, declared {}",
                rule.name(),
                output.type_key(),
                rule.output()
            ))));
        }
        Ok(output)
    }

    fn index_path(&self, path: &Path) {
        self.paths.write().insert(path.to_path_buf());
    }

    async fn digest_file(&self, path: &Path) -> Result<Value, Failure> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Failure::new(FailureKind::Io(format!(
                "{} is not a regular file",
                path.display()
            ))));
        }
        let file = tokio::fs::File::open(path).await?;
        let digest = self.store.put_reader(file).await?;
        Ok(Value::new(digest))
    }

    /// Ingests `path` into the store. A file or symlink becomes a
    /// directory containing just that entry.
    async fn snapshot(&self, path: &Path) -> Result<Value, Failure> {
        let node = self
            .store
            .ingest_path(path)
            .await
            .map_err(|e| Failure::new(FailureKind::Io(e.to_string())))?;

        let digest = match node {
            Node::Directory { digest, size } => DirectoryDigest::from_node(digest, size),
            node => {
                let name = path
                    .file_name()
                    .ok_or_else(|| {
                        Failure::new(FailureKind::Io(format!("{} has no name", path.display())))
                    })
                    .and_then(|name| {
                        PathComponent::try_from(name)
                            .map_err(|e| Failure::new(FailureKind::Io(e.to_string())))
                    })?;
                let mut directory = Directory::new();
                directory
                    .add(name, node)
                    .map_err(|e| Failure::new(FailureKind::Io(e.to_string())))?;
                self.store.put_directory(directory).await?
            }
        };
        Ok(Value::new(digest))
    }

    fn describe(&self, key: &NodeKey) -> String {
        match key {
            NodeKey::Task { rule, params } => self.graph.describe_rule(*rule, params),
            key => format!("{:?}", key),
        }
    }

    pub(crate) fn graph(&self) -> &RuleGraph {
        &self.graph
    }

    pub(crate) fn store(&self) -> &ContentStore {
        &self.store
    }
}
