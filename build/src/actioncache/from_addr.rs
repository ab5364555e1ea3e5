use url::Url;

use super::{ActionCache, MemoryActionCache, SimpleFilesystemActionCache};
use crate::executionservice::ExecutionError;

/// Constructs a new instance of an [ActionCache] from an URI.
///
/// The following URIs are supported:
/// - `memory://` ([MemoryActionCache])
/// - `simplefs:///absolute/path` ([SimpleFilesystemActionCache]), usually
///   the same path as the simplefs blob and directory services.
pub async fn from_addr(uri: &str) -> Result<Box<dyn ActionCache>, ExecutionError> {
    let url = Url::parse(uri)
        .map_err(|e| ExecutionError::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let action_cache: Box<dyn ActionCache> = match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                Err(ExecutionError::InvalidRequest("invalid url".into()))?
            }
            Box::<MemoryActionCache>::default()
        }
        "simplefs" => {
            if url.has_host() {
                Err(ExecutionError::InvalidRequest("no host allowed".into()))?
            }
            if url.path().is_empty() || url.path() == "/" {
                Err(ExecutionError::InvalidRequest(
                    "cowardly refusing to use / as action cache root".into(),
                ))?
            }
            Box::new(SimpleFilesystemActionCache::new(url.path().into()).await?)
        }
        scheme => Err(ExecutionError::InvalidRequest(format!(
            "unknown scheme: {}",
            scheme
        )))?,
    };

    Ok(action_cache)
}
