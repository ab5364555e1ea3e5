use std::path::Path;
use std::sync::Arc;

use kiln_build::executionservice::{ProcessDescriptor, ProcessResult};
use kiln_castore::{ContentStore, Digest, DirectoryDigest};

use super::{normalize, Chain, Inner, NodeKey};
use crate::error::{Failure, FailureKind};
use crate::rule_graph::NodeId;
use crate::rules::Get;
use crate::types::{Params, RuleValue, TypeKey, Value};

/// What a running rule body can do besides looking at its inputs.
///
/// Everything requested through the context is memoized, and recorded as a
/// dependency of the running rule, except for [RuleContext::merge].
#[derive(Clone)]
pub struct RuleContext {
    inner: Arc<Inner>,
    node: NodeId,
    params: Params,
    chain: Arc<Chain>,
}

impl RuleContext {
    pub(super) fn new(inner: Arc<Inner>, node: NodeId, params: Params, chain: Arc<Chain>) -> Self {
        Self {
            inner,
            node,
            params,
            chain,
        }
    }

    /// The parameters this rule runs with.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Requests a `Product` computed with `provided` added to the current
    /// parameters. The rule must have declared this with [crate::Rule::get].
    pub async fn get<Product, Provided>(&self, provided: Provided) -> Result<Product, Failure>
    where
        Product: Clone + 'static,
        Provided: RuleValue,
    {
        let get = Get {
            product: TypeKey::of::<Product>(),
            provided: TypeKey::of::<Provided>(),
        };
        let node = self.inner.graph().node(self.node).get(&get).ok_or_else(|| {
            Failure::new(FailureKind::TypeMismatch(format!(
                "{} was not declared by {}",
                get,
                self.inner.graph().describe(self.node, &self.params)
            )))
        })?;

        let params = self.params.with(Value::new(provided));
        self.inner
            .request_node(node, &params, Some(&self.chain))
            .await?
            .get::<Product>()
    }

    /// Stores the contents of the file at `path`.
    pub async fn digest_file(&self, path: impl AsRef<Path>) -> Result<Digest, Failure> {
        let key = NodeKey::DigestFile(normalize(path.as_ref()));
        self.inner.request(key, Some(&self.chain)).await?.get()
    }

    /// Stores the file or directory at `path` as a tree. A file ends up as
    /// the single entry of the returned directory.
    pub async fn snapshot(&self, path: impl AsRef<Path>) -> Result<DirectoryDigest, Failure> {
        let key = NodeKey::Snapshot(normalize(path.as_ref()));
        self.inner.request(key, Some(&self.chain)).await?.get()
    }

    /// Runs a process. Identical descriptors share one run.
    pub async fn execute(&self, descriptor: ProcessDescriptor) -> Result<ProcessResult, Failure> {
        let key = NodeKey::Process(Arc::new(descriptor));
        self.inner.request(key, Some(&self.chain)).await?.get()
    }

    /// Merges trees. Cheap and deterministic, so this isn't memoized.
    pub async fn merge(&self, roots: &[DirectoryDigest]) -> Result<DirectoryDigest, Failure> {
        Ok(self.inner.store().merge(roots).await?)
    }

    pub fn store(&self) -> &ContentStore {
        self.inner.store()
    }
}
