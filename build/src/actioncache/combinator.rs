use kiln_castore::B3Digest;
use tonic::async_trait;
use tracing::{instrument, warn};

use super::ActionCache;
use crate::executionservice::{ExecutionError, ProcessResult};

/// Combinator for an ActionCache, using a "local" and a "remote" cache.
/// Lookups try the local cache first and only ask the remote one on a
/// miss. Remote hits are copied into the local cache.
/// Writes go to both; failing to write to the remote is only logged.
#[derive(Clone)]
pub struct CombinedActionCache<L, R> {
    local: L,
    remote: R,
}

impl<L, R> CombinedActionCache<L, R> {
    pub fn new(local: L, remote: R) -> Self {
        Self { local, remote }
    }
}

#[async_trait]
impl<L, R> ActionCache for CombinedActionCache<L, R>
where
    L: ActionCache,
    R: ActionCache,
{
    #[instrument(skip_all, fields(action.key = %key))]
    async fn get(&self, key: &B3Digest) -> Result<Option<ProcessResult>, ExecutionError> {
        if let Some(result) = self.local.get(key).await? {
            return Ok(Some(result));
        }

        let result = match self.remote.get(key).await {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(err = %e, "remote action cache lookup failed");
                return Ok(None);
            }
        };
        self.local.put(key, &result).await?;
        Ok(Some(result))
    }

    #[instrument(skip_all, fields(action.key = %key))]
    async fn put(&self, key: &B3Digest, result: &ProcessResult) -> Result<(), ExecutionError> {
        self.local.put(key, result).await?;
        if let Err(e) = self.remote.put(key, result).await {
            warn!(err = %e, "unable to write to remote action cache");
        }
        Ok(())
    }
}
