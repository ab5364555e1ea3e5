use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared, WeakShared};
use kiln_build::executionservice::ProcessDescriptor;
use kiln_castore::{B3Digest, ContentStore};
use parking_lot::Mutex;

use crate::error::Failure;
use crate::types::{Params, Value};

/// Identifies an execution node in the memo table.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// A rule applied to the parameters it actually uses. The call site in
    /// the rule graph isn't part of the key, so queries with different
    /// extra parameters share the work.
    Task { rule: usize, params: Params },
    DigestFile(PathBuf),
    Snapshot(PathBuf),
    Process(Arc<ProcessDescriptor>),
}

impl NodeKey {
    /// The filesystem path an intrinsic reads, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            NodeKey::DigestFile(path) | NodeKey::Snapshot(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Task { rule, params } => write!(f, "Task(#{}, {})", rule, params),
            NodeKey::DigestFile(path) => write!(f, "digest_file({})", path.display()),
            NodeKey::Snapshot(path) => write!(f, "snapshot({})", path.display()),
            NodeKey::Process(descriptor) => write!(f, "process({:?})", descriptor.description),
        }
    }
}

pub(crate) type RunFuture = Shared<BoxFuture<'static, Result<Value, Failure>>>;
type WeakRun = WeakShared<BoxFuture<'static, Result<Value, Failure>>>;

enum EntryState {
    NotStarted,
    /// Only a weak handle is kept, the requesters own the run.
    Running {
        run_id: u64,
        run: WeakRun,
    },
    Completed {
        value: Value,
        /// Store roots held on behalf of the value.
        retained: Vec<B3Digest>,
    },
    Failed(Failure),
}

pub(crate) enum Join {
    Ready(Result<Value, Failure>),
    Wait(RunFuture),
}

pub(crate) struct Entry {
    key: NodeKey,
    state: Mutex<EntryState>,
    invalidated: AtomicBool,
    dependents: Mutex<HashSet<NodeKey>>,
}

impl Entry {
    pub(crate) fn new(key: NodeKey) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::NotStarted),
            invalidated: AtomicBool::new(false),
            dependents: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn key(&self) -> &NodeKey {
        &self.key
    }

    pub(crate) fn add_dependent(&self, dependent: NodeKey) {
        self.dependents.lock().insert(dependent);
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Serves the memoized result, joins a live run, or starts a new one
    /// with `start`.
    pub(crate) fn join_or_start<F>(&self, run_id: u64, start: F) -> Join
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value, Failure>>,
    {
        use futures::FutureExt;

        let mut state = self.state.lock();
        match &*state {
            EntryState::Completed { value, .. } => return Join::Ready(Ok(value.clone())),
            EntryState::Failed(failure) => return Join::Ready(Err(failure.clone())),
            EntryState::Running { run, .. } => {
                if let Some(run) = run.upgrade() {
                    return Join::Wait(run);
                }
                // all requesters of the previous run went away.
            }
            EntryState::NotStarted => {}
        }

        let run = start().shared();
        *state = match run.downgrade() {
            Some(weak) => EntryState::Running { run_id, run: weak },
            None => EntryState::NotStarted,
        };
        Join::Wait(run)
    }

    /// Records the outcome of run `run_id`, retaining any store content the
    /// value refers to unless the entry was invalidated in the meantime.
    pub(crate) fn complete(&self, run_id: u64, result: &Result<Value, Failure>, store: &ContentStore) {
        let mut state = self.state.lock();
        if !matches!(&*state, EntryState::Running { run_id: current, .. } if *current == run_id) {
            return;
        }

        *state = match result {
            Ok(value) => {
                let retained = if self.is_invalidated() {
                    vec![]
                } else {
                    value.references().to_vec()
                };
                for digest in &retained {
                    store.retain(digest);
                }
                EntryState::Completed {
                    value: value.clone(),
                    retained,
                }
            }
            Err(failure) => EntryState::Failed(failure.clone()),
        };
    }

    /// Marks the entry as invalidated, releases its store roots and returns
    /// the dependents to invalidate next.
    pub(crate) fn invalidate(&self, store: &ContentStore) -> HashSet<NodeKey> {
        {
            let mut state = self.state.lock();
            self.invalidated.store(true, Ordering::SeqCst);
            if let EntryState::Completed { retained, .. } = &mut *state {
                for digest in retained.drain(..) {
                    store.release(&digest);
                }
            }
        }
        std::mem::take(&mut *self.dependents.lock())
    }
}
