use std::path::PathBuf;

use kiln_castore::{blobservice::BlobService, directoryservice::DirectoryService};
use url::Url;

use super::{ExecutionError, ExecutionService, GRPCExecutionService, LocalExecutionService};
use crate::proto::execution_service_client::ExecutionServiceClient;

/// Constructs a new instance of an [ExecutionService] from an URI.
///
/// The following URIs are supported:
/// - `local://`
///   Runs processes on this host, with sandboxes below the system temp dir.
/// - `local:///absolute/path`
///   Same, with sandboxes below the given path.
///   `max_concurrent=N` and `keep_sandboxes=1` can be passed as query.
/// - `grpc+unix:///path/to/socket`, `grpc+http://host:port`, `grpc+https://host:port`
///   Forwards to a remote executor sharing the same stores ([GRPCExecutionService]).
///
/// The local executor reads inputs from and writes outputs to the passed
/// [BlobService] and [DirectoryService].
pub async fn from_addr<BS, DS>(
    uri: &str,
    blob_service: BS,
    directory_service: DS,
) -> Result<Box<dyn ExecutionService>, ExecutionError>
where
    BS: BlobService + Clone + 'static,
    DS: DirectoryService + Clone + 'static,
{
    let url = Url::parse(uri)
        .map_err(|e| ExecutionError::InvalidRequest(format!("unable to parse url: {}", e)))?;

    Ok(match url.scheme() {
        "local" => {
            if url.has_host() {
                Err(ExecutionError::InvalidRequest(
                    "local:// doesn't take a host".into(),
                ))?
            }

            let sandbox_root = match url.path() {
                "" | "/" => std::env::temp_dir().join("kiln-sandboxes"),
                path => PathBuf::from(path),
            };

            let mut service =
                LocalExecutionService::new(sandbox_root, blob_service, directory_service);
            for (k, v) in url.query_pairs() {
                match k.as_ref() {
                    "max_concurrent" => {
                        let n = v.parse().map_err(|_| {
                            ExecutionError::InvalidRequest(format!("invalid max_concurrent: {v}"))
                        })?;
                        service = service.with_max_concurrent(n);
                    }
                    "keep_sandboxes" => service = service.keep_sandboxes(v == "1"),
                    _ => Err(ExecutionError::InvalidRequest(format!(
                        "unknown parameter: {k}"
                    )))?,
                }
            }
            Box::new(service)
        }
        scheme if scheme.starts_with("grpc+") => {
            let channel = crate::channel::channel_from_url(&url)
                .await
                .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?;
            Box::new(GRPCExecutionService::from_client(
                ExecutionServiceClient::new(channel),
            ))
        }
        scheme => Err(ExecutionError::InvalidRequest(format!(
            "unknown scheme: {}",
            scheme
        )))?,
    })
}
