use url::Url;

use super::{DirectoryService, MemoryDirectoryService, SimpleFilesystemDirectoryService};
use crate::Error;

/// Constructs a new instance of a [DirectoryService] from an URI.
///
/// The following URIs are supported:
/// - `memory:`
///   Uses a in-memory implementation.
/// - `simplefs:///absolute/path/to/somewhere`
///   Uses a [SimpleFilesystemDirectoryService] rooted at that path.
pub async fn from_addr(uri: &str) -> Result<Box<dyn DirectoryService>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| crate::Error::StorageError(format!("unable to parse url: {}", e)))?;

    let directory_service: Box<dyn DirectoryService> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::StorageError("invalid url".to_string()));
            }
            Box::<MemoryDirectoryService>::default()
        }
        "simplefs" => {
            if url.has_host() {
                return Err(Error::StorageError("no host allowed".to_string()));
            }

            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::StorageError(
                    "cowardly refusing to use / as directory root".to_string(),
                ));
            }

            Box::new(SimpleFilesystemDirectoryService::new(url.path().into()).await?)
        }
        _ => {
            return Err(crate::Error::StorageError(format!(
                "unknown scheme: {}",
                url.scheme()
            )))
        }
    };
    Ok(directory_service)
}

#[cfg(test)]
mod tests {
    use super::from_addr;
    use rstest::rstest;

    #[rstest]
    /// This uses an unsupported scheme.
    #[case::unsupported_scheme("http://foo.example/test", false)]
    /// This correctly sets the scheme, and doesn't set a path.
    #[case::memory_valid("memory://", true)]
    /// This sets a memory url host to `foo`
    #[case::memory_invalid_host("memory://foo", false)]
    /// This sets a memory url path to "/foo", which is invalid.
    #[case::memory_invalid_path("memory:///foo", false)]
    /// simplefs refuses the filesystem root.
    #[case::simplefs_invalid_root("simplefs:///", false)]
    /// simplefs doesn't take a host.
    #[case::simplefs_invalid_host("simplefs://foo.example/bar", false)]
    #[tokio::test]
    async fn test_from_addr_tokio(#[case] uri_str: &str, #[case] exp_succeed: bool) {
        if exp_succeed {
            from_addr(uri_str).await.expect("should succeed");
        } else {
            assert!(from_addr(uri_str).await.is_err(), "should fail");
        }
    }

    #[tokio::test]
    async fn simplefs_valid_path() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        from_addr(&format!("simplefs://{}", tmpdir.path().to_str().unwrap()))
            .await
            .expect("should succeed");
    }
}
