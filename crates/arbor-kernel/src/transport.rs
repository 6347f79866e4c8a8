//! Stream transports: TCP and Unix domain sockets behind one endpoint type.
//!
//! Endpoints are written `host:port` for TCP and `unix:/path` for a local
//! socket. Everything above this module sees a boxed byte stream ([`Conn`])
//! and never cares which family it came from.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use arbor_types::Family;

/// Any ordered, bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A connected stream, family erased.
pub type Conn = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// Where to connect or listen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse endpoint text. Anything without the `unix:` prefix is TCP.
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix(Family::UNIX_PREFIX) {
            Some(path) => Endpoint::Unix(PathBuf::from(path)),
            None => Endpoint::Tcp(text.to_string()),
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Endpoint::Tcp(_) => Family::Tcp,
            Endpoint::Unix(_) => Family::Unix,
        }
    }

    /// Open a stream to this endpoint.
    pub async fn connect(&self) -> Result<Conn, TransportError> {
        let err = |source| TransportError::Connect {
            addr: self.to_string(),
            source,
        };
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await.map_err(err)?;
                // Small control messages must not wait on Nagle.
                stream.set_nodelay(true).map_err(err)?;
                Ok(Box::new(stream))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(err)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Start listening on this endpoint.
    ///
    /// A stale socket file left behind by a previous run is removed first.
    pub async fn bind(&self) -> Result<Listener, TransportError> {
        let err = |source| TransportError::Bind {
            addr: self.to_string(),
            source,
        };
        match self {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(err)?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(err)?;
                }
                if path.exists() {
                    std::fs::remove_file(path).map_err(err)?;
                }
                let listener = UnixListener::bind(path).map_err(err)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "{}{}", Family::UNIX_PREFIX, path.display()),
        }
    }
}

/// A bound listener of either family.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// The endpoint peers should connect to.
    ///
    /// For TCP this is the bound address, so a `:0` bind reports the port the
    /// kernel picked. The host may still be unspecified (`0.0.0.0`); parents
    /// fix that up from the connection's peer address.
    pub fn local_endpoint(&self) -> std::io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Accept one connection, returning it with a printable peer address.
    pub async fn accept(&self) -> Result<(Conn, String), TransportError> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                stream.set_nodelay(true).map_err(TransportError::Accept)?;
                Ok((Box::new(stream), addr.to_string()))
            }
            Listener::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await.map_err(TransportError::Accept)?;
                Ok((Box::new(stream), format!("{}{}", Family::UNIX_PREFIX, path.display())))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Replace an unspecified listen host with the host a peer connected from.
///
/// A child listening on `0.0.0.0:7000` that connected from `10.1.2.3:51234`
/// is reachable at `10.1.2.3:7000`. Unix endpoints and specified hosts pass
/// through unchanged.
pub fn reachable_addr(server_addr: &str, seen_from: &str) -> String {
    let (Ok(server), Ok(peer)) = (
        server_addr.parse::<SocketAddr>(),
        seen_from.parse::<SocketAddr>(),
    ) else {
        return server_addr.to_string();
    };

    if server.ip().is_unspecified() {
        SocketAddr::new(peer.ip(), server.port()).to_string()
    } else {
        server_addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_and_display() {
        let ep = Endpoint::parse("unix:/run/arbor/master.sock");
        assert_eq!(ep, Endpoint::Unix(PathBuf::from("/run/arbor/master.sock")));
        assert_eq!(ep.to_string(), "unix:/run/arbor/master.sock");
        assert_eq!(ep.family(), Family::Unix);

        let ep = Endpoint::parse("127.0.0.1:6666");
        assert_eq!(ep.family(), Family::Tcp);
        assert_eq!(ep.to_string(), "127.0.0.1:6666");
    }

    #[test]
    fn test_reachable_addr() {
        assert_eq!(reachable_addr("0.0.0.0:7000", "10.1.2.3:51234"), "10.1.2.3:7000");
        assert_eq!(reachable_addr("10.9.9.9:7000", "10.1.2.3:51234"), "10.9.9.9:7000");
        assert_eq!(reachable_addr("unix:/tmp/s", "unix:/tmp/p"), "unix:/tmp/s");
    }

    #[tokio::test]
    async fn test_tcp_bind_zero_reports_port() {
        let listener = Endpoint::parse("127.0.0.1:0").bind().await.unwrap();
        let ep = listener.local_endpoint().unwrap();
        assert!(!ep.to_string().ends_with(":0"));

        let client = tokio::spawn({
            let ep = ep.clone();
            async move {
                let mut conn = ep.connect().await.unwrap();
                conn.write_all(b"ping").await.unwrap();
            }
        });

        let (mut conn, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::Unix(dir.path().join("relay.sock"));
        let listener = ep.bind().await.unwrap();

        let client = tokio::spawn({
            let ep = ep.clone();
            async move {
                let mut conn = ep.connect().await.unwrap();
                conn.write_all(b"hi").await.unwrap();
            }
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("unix:"));
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = Endpoint::parse("127.0.0.1:0").bind().await.unwrap();
        let ep = listener.local_endpoint().unwrap();
        drop(listener);

        let err = ep.connect().await.err().expect("connect should fail");
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
