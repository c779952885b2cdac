//! Socket transport between the bridge and its responder.
//!
//! Endpoint kinds:
//! - **Tcp**: loopback (or any local) TCP address, `tcp://127.0.0.1:25333`
//! - **Unix**: filesystem socket (macOS, Linux, BSD), `unix:/run/snowbridge.sock`
//!
//! Both sides work on a [`Connection`]: boxed read/write halves, so the codec
//! layer never needs to know which socket kind it is framing.

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Default endpoint: the port the original game mod used for its gateway.
pub const DEFAULT_PORT: u16 = 25333;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Address of the bridge's listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointParseError {
    #[error("invalid tcp address {addr:?}: {source}")]
    Tcp {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("empty unix socket path")]
    EmptyPath,
    #[error("unix sockets are not supported on this platform")]
    UnixUnsupported,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    /// Accepts `tcp://IP:PORT`, bare `IP:PORT`, `unix:/path` and `unix:///path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("unix:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(EndpointParseError::EmptyPath);
            }
            #[cfg(unix)]
            return Ok(Endpoint::Unix(PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(EndpointParseError::UnixUnsupported);
        }

        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|source| EndpointParseError::Tcp {
                addr: addr.to_string(),
                source,
            })
    }
}

/// An established byte stream, split into owned halves.
pub struct Connection {
    pub reader: BoxedRead,
    pub writer: BoxedWrite,
    /// Human-readable peer address, for logs only.
    pub peer: String,
}

impl Connection {
    fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Box::new(read),
            writer: Box::new(write),
            peer,
        })
    }

    #[cfg(unix)]
    fn from_unix(stream: tokio::net::UnixStream, path: &std::path::Path) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: Box::new(read),
            writer: Box::new(write),
            peer: format!("unix:{}", path.display()),
        }
    }
}

/// Listening side of the transport, owned by the bridge channel.
pub enum BridgeListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl BridgeListener {
    /// Bind the endpoint.
    ///
    /// For Unix sockets a leftover socket file is removed first, but only when
    /// nothing answers on it; a live socket yields `AddrInUse`.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                tracing::debug!(endpoint = %endpoint, "Bound tcp listener");
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    if tokio::net::UnixStream::connect(path).await.is_ok() {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("{} is served by another process", path.display()),
                        ));
                    }
                    tracing::debug!(path = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                tracing::debug!(endpoint = %endpoint, "Bound unix listener");
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The endpoint actually bound (resolves port 0 to the assigned port).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Connection::from_tcp(stream)
            }
            #[cfg(unix)]
            Self::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_unix(stream, path))
            }
        }
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self
            && path.exists()
        {
            tracing::debug!(path = %path.display(), "Cleaning up socket file");
            if let Err(e) = std::fs::remove_file(&*path) {
                tracing::warn!(error = %e, "Failed to clean up socket file");
            }
        }
    }
}

/// Connect to a bridge endpoint (responder side).
pub async fn connect(endpoint: &Endpoint) -> io::Result<Connection> {
    tracing::trace!(endpoint = %endpoint, "Connecting to bridge");
    match endpoint {
        Endpoint::Tcp(addr) => Connection::from_tcp(TcpStream::connect(addr).await?),
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Connection::from_unix(stream, path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn default_endpoint_is_loopback_gateway_port() {
        assert_eq!(Endpoint::default().to_string(), "tcp://127.0.0.1:25333");
    }

    #[test]
    fn parses_tcp_forms() {
        let expected = Endpoint::Tcp("127.0.0.1:4000".parse().unwrap());
        assert_eq!("tcp://127.0.0.1:4000".parse::<Endpoint>().unwrap(), expected);
        assert_eq!("127.0.0.1:4000".parse::<Endpoint>().unwrap(), expected);
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_forms() {
        let expected = Endpoint::Unix(PathBuf::from("/tmp/bridge.sock"));
        assert_eq!("unix:/tmp/bridge.sock".parse::<Endpoint>().unwrap(), expected);
        assert_eq!("unix:///tmp/bridge.sock".parse::<Endpoint>().unwrap(), expected);
        assert!(matches!(
            "unix:".parse::<Endpoint>(),
            Err(EndpointParseError::EmptyPath)
        ));
        assert_eq!(expected.to_string(), "unix:/tmp/bridge.sock");
    }

    #[tokio::test]
    async fn tcp_port_zero_resolves_and_carries_bytes() {
        let endpoint: Endpoint = "127.0.0.1:0".parse().unwrap();
        let listener = BridgeListener::bind(&endpoint).await.unwrap();
        let bound = listener.local_endpoint().unwrap();
        let Endpoint::Tcp(addr) = &bound else {
            panic!("expected tcp endpoint");
        };
        assert_ne!(addr.port(), 0);

        let (server, client) = tokio::join!(listener.accept(), connect(&bound));
        let mut server = server.unwrap();
        let mut client = client.unwrap();

        client.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn tcp_bind_conflict_is_addr_in_use() {
        let first = BridgeListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_endpoint().unwrap();

        let err = match BridgeListener::bind(&taken).await {
            Ok(_) => panic!("second bind should fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let endpoint = Endpoint::Unix(path.clone());

        let listener = BridgeListener::bind(&endpoint).await.unwrap();
        assert!(path.exists());

        let second = BridgeListener::bind(&endpoint).await;
        assert_eq!(second.err().map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _std = std::os::unix::net::UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());

        let listener = BridgeListener::bind(&Endpoint::Unix(path.clone())).await;
        assert!(listener.is_ok());
    }
}
