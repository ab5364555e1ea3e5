use std::collections::HashMap;
use std::sync::Arc;

use kiln_castore::B3Digest;
use parking_lot::RwLock;
use tonic::async_trait;
use tracing::instrument;

use super::ActionCache;
use crate::executionservice::{ExecutionError, ProcessResult};

#[derive(Clone, Default)]
pub struct MemoryActionCache {
    db: Arc<RwLock<HashMap<B3Digest, ProcessResult>>>,
}

#[async_trait]
impl ActionCache for MemoryActionCache {
    #[instrument(skip_all, fields(action.key = %key))]
    async fn get(&self, key: &B3Digest) -> Result<Option<ProcessResult>, ExecutionError> {
        Ok(self.db.read().get(key).cloned())
    }

    #[instrument(skip_all, fields(action.key = %key))]
    async fn put(&self, key: &B3Digest, result: &ProcessResult) -> Result<(), ExecutionError> {
        self.db.write().insert(key.clone(), result.clone());
        Ok(())
    }
}
