use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{Failure, FailureKind, RequestError};
use crate::scheduler::Scheduler;
use crate::types::{Params, TypeKey};

/// A client of a [Scheduler], like a single build invocation.
///
/// Sessions share all memoized work. Dropping a session cancels its
/// in-flight requests, runs nobody else waits for are then cancelled too.
pub struct Session {
    scheduler: Scheduler,
    generation: u64,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            generation: scheduler.generation(),
            cancel: CancellationToken::new(),
        }
    }

    /// Computes a `T` from `params`.
    pub async fn request<T: Clone + 'static>(&self, params: Params) -> Result<T, RequestError> {
        let product = TypeKey::of::<T>();
        let span = info_span!("request", product = %product, params = %params);
        span.pb_start();
        span.pb_set_style(&kiln_tracing::PB_SPINNER_STYLE);
        span.pb_set_message(&format!("Computing {}…", product));

        let request = async move {
            let value = self.scheduler.request_value(product, params).await?;
            Ok::<T, RequestError>(value.get::<T>()?)
        }
        .instrument(span);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(RequestError::Failed(Failure::new(FailureKind::Cancelled)))
            }
            result = request => result,
        }
    }

    /// Blocking version of [Session::request], for synchronous callers.
    /// Must not be called from within the scheduler's runtime.
    pub fn run<T: Clone + 'static>(&self, params: Params) -> Result<T, RequestError> {
        self.scheduler.handle().block_on(self.request(params))
    }

    /// Cancels all current and future requests of this session.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The scheduler generation when this session was created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether files were invalidated since the session was created.
    pub fn is_stale(&self) -> bool {
        self.scheduler.generation() != self.generation
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use kiln_build::executionservice::LocalExecutionService;
    use kiln_castore::blobservice::MemoryBlobService;
    use kiln_castore::directoryservice::MemoryDirectoryService;
    use kiln_castore::fingerprint::{Fingerprint, FingerprintHasher};
    use kiln_castore::ContentStore;

    use super::Session;
    use crate::error::{Failure, FailureKind, RequestError};
    use crate::rule_graph::{RuleGraph, RuleGraphBuilder};
    use crate::rules::Rule;
    use crate::scheduler::{RuleContext, Scheduler};
    use crate::types::{Params, TypeKey, Value};

    #[derive(Debug, Clone, PartialEq)]
    struct Count(u64);

    impl Fingerprint for Count {
        fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
            hasher.field(&self.0);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Doubled(u64);

    impl Fingerprint for Doubled {
        fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
            hasher.field(&self.0);
        }
    }

    fn graph(delay: Duration, calls: Arc<AtomicUsize>) -> RuleGraph {
        RuleGraphBuilder::new()
            .register(
                Rule::new::<Doubled>("double", move |_: RuleContext, inputs: Vec<Value>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        let count: Count = inputs[0].get()?;
                        Ok::<_, Failure>(Value::new(Doubled(count.0 * 2)))
                    }
                })
                .input::<Count>(),
            )
            .query::<Doubled>([TypeKey::of::<Count>()])
            .compile()
            .expect("must compile")
    }

    fn scheduler(graph: RuleGraph, handle: tokio::runtime::Handle) -> Scheduler {
        let store = ContentStore::new(
            MemoryBlobService::default(),
            MemoryDirectoryService::default(),
        );
        let tmpdir = std::env::temp_dir().join("kiln-session-tests");
        Scheduler::new(
            graph,
            store.clone(),
            Arc::new(LocalExecutionService::new(tmpdir, store.clone(), store)),
            handle,
        )
    }

    #[tokio::test]
    async fn sessions_share_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(
            graph(Duration::ZERO, calls.clone()),
            tokio::runtime::Handle::current(),
        );

        for _ in 0..3 {
            let session = Session::new(&scheduler);
            assert_eq!(
                Doubled(4),
                session
                    .request::<Doubled>(Params::new([Value::new(Count(2))]))
                    .await
                    .unwrap()
            );
        }
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_session() {
        let scheduler = scheduler(
            graph(Duration::from_secs(60), Arc::new(AtomicUsize::new(0))),
            tokio::runtime::Handle::current(),
        );
        let session = Arc::new(Session::new(&scheduler));

        let request = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .request::<Doubled>(Params::new([Value::new(Count(1))]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.cancel();

        match request.await.unwrap() {
            Err(RequestError::Failed(Failure {
                kind: FailureKind::Cancelled,
                ..
            })) => {}
            r => panic!("unexpected result: {r:?}"),
        }
        assert!(session.is_cancelled());
    }

    #[test]
    fn blocking_run() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let scheduler = scheduler(
            graph(Duration::ZERO, Arc::new(AtomicUsize::new(0))),
            runtime.handle().clone(),
        );

        let session = Session::new(&scheduler);
        assert_eq!(0, session.generation());
        assert_eq!(
            Doubled(6),
            session
                .run::<Doubled>(Params::new([Value::new(Count(3))]))
                .unwrap()
        );

        scheduler.invalidate_paths(&["/nonexistent".into()]);
        assert!(session.is_stale());
        assert!(!Session::new(&scheduler).is_stale());
    }
}
