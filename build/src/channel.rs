use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint};

/// Errors occuring when turning an address into a [Channel].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address must start with grpc+")]
    MissingGRPCPrefix,

    #[error("unix socket addresses may not have a host")]
    HostSetForUnixSocket,

    #[error("grpc+http(s) addresses may not have a path")]
    PathMayNotBeSet,

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Whether the address asks to connect eagerly, with `?wait-connect=1`.
fn wants_eager_connect(url: &url::Url) -> bool {
    url.query_pairs()
        .any(|(k, v)| k == "wait-connect" && v == "1")
}

/// Opens a [Channel] to a remote executor.
///
/// Supported addresses:
///  - `grpc+unix:///path/to/socket`, a unix domain socket
///  - `grpc+http://host:port`, unencrypted HTTP/2
///  - `grpc+https://host:port`, HTTP/2 over TLS
///
/// Channels connect lazily on first use unless `wait-connect=1` is passed.
pub async fn channel_from_url(url: &url::Url) -> Result<Channel, Error> {
    let eager = wants_eager_connect(url);

    if url.scheme() == "grpc+unix" {
        if url.host_str().is_some() {
            return Err(Error::HostSetForUnixSocket);
        }

        let socket_path = url.path().to_owned();
        let connector = tower::service_fn(move |_: tonic::transport::Uri| {
            let socket_path = socket_path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket_path).await?)) }
        });

        // tonic wants some URI, it's never dialed.
        let endpoint = Endpoint::from_static("http://[::]:50051");
        return Ok(if eager {
            endpoint.connect_with_connector(connector).await?
        } else {
            endpoint.connect_with_connector_lazy(connector)
        });
    }

    let Some(unprefixed) = url.as_str().strip_prefix("grpc+") else {
        return Err(Error::MissingGRPCPrefix);
    };
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(Error::PathMayNotBeSet);
    }

    // drop the query, it only carries our own options.
    let unprefixed = unprefixed
        .split_once('?')
        .map(|(base, _)| base)
        .unwrap_or(unprefixed);

    let endpoint = Endpoint::try_from(unprefixed.to_owned())?;
    Ok(if eager {
        endpoint.connect().await?
    } else {
        endpoint.connect_lazy()
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::channel_from_url;

    #[rstest]
    #[case::unix("grpc+unix:///run/kiln/executor.sock", true)]
    #[case::unix_with_host("grpc+unix://host.example/run/kiln.sock", false)]
    #[case::http("grpc+http://[::1]:8000", true)]
    #[case::https_no_port("grpc+https://executor.example", true)]
    #[case::http_with_path("grpc+http://[::1]:8000/some-path", false)]
    #[case::no_prefix("http://[::1]:8000", false)]
    #[tokio::test]
    async fn test_channel_from_url(#[case] addr: &str, #[case] exp_succeed: bool) {
        let url = url::Url::parse(addr).expect("must parse");
        let resp = channel_from_url(&url).await;
        if exp_succeed {
            resp.expect("should succeed");
        } else {
            assert!(resp.is_err(), "should fail");
        }
    }
}
