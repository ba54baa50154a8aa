//! Opening the byte stream under a connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{Address, ConnectionConfig};
use crate::error::{MuxredisError, Result};

/// Any duplex byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Open the transport described by `config`, honouring its connect timeout.
/// A timeout of zero waits indefinitely.
pub async fn open(config: &ConnectionConfig) -> Result<BoxTransport> {
    if config.connect_timeout_ms == 0 {
        return open_inner(config).await;
    }
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    match tokio::time::timeout(timeout, open_inner(config)).await {
        Ok(result) => result,
        Err(_) => Err(MuxredisError::Timeout(format!(
            "connection to {} timed out after {timeout:?}",
            config.address
        ))),
    }
}

async fn open_inner(config: &ConnectionConfig) -> Result<BoxTransport> {
    match &config.address {
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true).ok(); // Disable Nagle for low latency
            debug!(address = %config.address, tls = config.tls, "tcp connected");
            if config.tls {
                return open_tls(stream, host).await;
            }
            Ok(Box::new(stream))
        }
        Address::Unix(path) => {
            if config.tls {
                return Err(MuxredisError::Config(
                    "TLS is not supported over unix sockets".into(),
                ));
            }
            open_unix(path).await
        }
    }
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<BoxTransport> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    debug!(path = %path.display(), "unix socket connected");
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn open_unix(_path: &std::path::Path) -> Result<BoxTransport> {
    Err(MuxredisError::Config(
        "unix sockets are not available on this platform".into(),
    ))
}

#[cfg(feature = "tls")]
async fn open_tls(stream: TcpStream, host: &str) -> Result<BoxTransport> {
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| MuxredisError::Config(format!("invalid TLS server name {host:?}: {e}")))?;
    let stream = TlsConnector::from(Arc::new(tls_config))
        .connect(server_name, stream)
        .await?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn open_tls(_stream: TcpStream, _host: &str) -> Result<BoxTransport> {
    Err(MuxredisError::Config(
        "TLS requested but muxredis was built without the `tls` feature".into(),
    ))
}
