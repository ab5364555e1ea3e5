//! Persistent memoization of process results, keyed by the fingerprint of
//! the [crate::executionservice::ProcessDescriptor] that produced them.
//!
//! An entry only records digests. Whether the content behind them is still
//! in the store is checked by [crate::executionservice::CachedExecutionService]
//! before a hit is served.
use kiln_castore::B3Digest;
use tonic::async_trait;

use crate::executionservice::{ExecutionError, ProcessResult};

mod combinator;
mod from_addr;
mod memory;
mod simplefs;

pub use self::combinator::CombinedActionCache;
pub use self::from_addr::from_addr;
pub use self::memory::MemoryActionCache;
pub use self::simplefs::SimpleFilesystemActionCache;

/// Maps process fingerprints to the results of running them.
#[async_trait]
pub trait ActionCache: Send + Sync {
    async fn get(&self, key: &B3Digest) -> Result<Option<ProcessResult>, ExecutionError>;

    async fn put(&self, key: &B3Digest, result: &ProcessResult) -> Result<(), ExecutionError>;
}

#[async_trait]
impl<A> ActionCache for A
where
    A: AsRef<dyn ActionCache> + Send + Sync,
{
    async fn get(&self, key: &B3Digest) -> Result<Option<ProcessResult>, ExecutionError> {
        self.as_ref().get(key).await
    }

    async fn put(&self, key: &B3Digest, result: &ProcessResult) -> Result<(), ExecutionError> {
        self.as_ref().put(key, result).await
    }
}
