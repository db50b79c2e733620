//! Transports for the control connection.
//!
//! Addresses take one of these forms:
//! - `unix:/run/agent.sock` or a bare path such as `/tmp/agentd.sock`
//! - `tcp://127.0.0.1:7070` or `127.0.0.1:7070`

use std::fmt;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::path::Path;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::ConnectionError;

#[cfg(unix)]
pub const DEFAULT_AGENT_ADDR: &str = "/tmp/agentd.sock";
#[cfg(not(unix))]
pub const DEFAULT_AGENT_ADDR: &str = "127.0.0.1:60461";

/// Object-safe duplex stream, whatever the transport.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentAddress {
    #[cfg(unix)]
    Unix(String),
    Tcp(String),
}

impl AgentAddress {
    pub async fn connect(&self) -> io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            AgentAddress::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            AgentAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                // Control frames are tiny; don't let Nagle hold them back.
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Listen on this address. A leftover Unix socket from a dead agent is
    /// replaced; a live one is an `AddrInUse` error.
    pub async fn bind(&self) -> io::Result<AgentListener> {
        match self {
            #[cfg(unix)]
            AgentAddress::Unix(path) => Ok(AgentListener::Unix {
                listener: bind_unix(path).await?,
                path: path.clone(),
            }),
            AgentAddress::Tcp(addr) => Ok(AgentListener::Tcp(TcpListener::bind(addr).await?)),
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &str) -> io::Result<UnixListener> {
    let socket_path = Path::new(path);
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match std::fs::symlink_metadata(socket_path) {
        Ok(meta) if meta.file_type().is_socket() => {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("an agent is already listening on {}", path),
                ));
            }
            std::fs::remove_file(socket_path)?;
        }
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path),
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(socket_path)
}

impl FromStr for AgentAddress {
    type Err = ConnectionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let addr = raw.trim();
        if addr.is_empty() {
            return Err(ConnectionError::InvalidAddress(raw.to_string()));
        }
        if let Some(rest) = addr.strip_prefix("tcp://") {
            return parse_tcp(rest, raw);
        }
        if let Some(rest) = addr.strip_prefix("unix:") {
            return parse_unix(rest.trim_start_matches("//"), raw);
        }
        if addr.starts_with('/') || addr.starts_with('.') || !addr.contains(':') {
            return parse_unix(addr, raw);
        }
        parse_tcp(addr, raw)
    }
}

fn parse_tcp(addr: &str, raw: &str) -> Result<AgentAddress, ConnectionError> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(AgentAddress::Tcp(addr.to_string()))
        }
        _ => Err(ConnectionError::InvalidAddress(raw.to_string())),
    }
}

#[cfg(unix)]
fn parse_unix(path: &str, raw: &str) -> Result<AgentAddress, ConnectionError> {
    if path.is_empty() {
        return Err(ConnectionError::InvalidAddress(raw.to_string()));
    }
    Ok(AgentAddress::Unix(path.to_string()))
}

#[cfg(not(unix))]
fn parse_unix(_path: &str, raw: &str) -> Result<AgentAddress, ConnectionError> {
    Err(ConnectionError::InvalidAddress(raw.to_string()))
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            AgentAddress::Unix(path) => write!(f, "unix:{}", path),
            AgentAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Listener over whichever transport the address selected. A Unix socket
/// file is removed when the listener is dropped.
pub enum AgentListener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: String },
    Tcp(TcpListener),
}

impl AgentListener {
    pub async fn accept(&self) -> io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            AgentListener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            AgentListener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The address workers should dial; resolves a TCP port of `0`.
    pub fn local_address(&self) -> io::Result<AgentAddress> {
        match self {
            #[cfg(unix)]
            AgentListener::Unix { path, .. } => Ok(AgentAddress::Unix(path.clone())),
            AgentListener::Tcp(listener) => {
                Ok(AgentAddress::Tcp(listener.local_addr()?.to_string()))
            }
        }
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let AgentListener::Unix { path, .. } = self {
                let _ = std::fs::remove_file(path.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_forms_parse() {
        assert_eq!(
            "tcp://127.0.0.1:7070".parse::<AgentAddress>().unwrap(),
            AgentAddress::Tcp("127.0.0.1:7070".into())
        );
        assert_eq!(
            "localhost:7070".parse::<AgentAddress>().unwrap(),
            AgentAddress::Tcp("localhost:7070".into())
        );
    }

    #[test]
    fn bad_addresses_are_rejected() {
        for raw in ["", "   ", "tcp://nohost", "tcp://:80", "tcp://host:notaport", "unix:"] {
            assert!(
                matches!(
                    raw.parse::<AgentAddress>(),
                    Err(ConnectionError::InvalidAddress(_))
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn unix_forms_parse() {
        assert_eq!(
            "/tmp/agentd.sock".parse::<AgentAddress>().unwrap(),
            AgentAddress::Unix("/tmp/agentd.sock".into())
        );
        assert_eq!(
            "unix:/run/agent.sock".parse::<AgentAddress>().unwrap(),
            AgentAddress::Unix("/run/agent.sock".into())
        );
        assert_eq!(
            "unix:///run/agent.sock".parse::<AgentAddress>().unwrap(),
            AgentAddress::Unix("/run/agent.sock".into())
        );
        assert_eq!(
            "agent.sock".parse::<AgentAddress>().unwrap(),
            AgentAddress::Unix("agent.sock".into())
        );
    }

    #[tokio::test]
    async fn tcp_listener_reports_its_port() {
        let address: AgentAddress = "tcp://127.0.0.1:0".parse().unwrap();
        let listener = address.bind().await.unwrap();
        let address = listener.local_address().unwrap();
        assert!(!address.to_string().ends_with(":0"));

        let (client, server) = tokio::join!(address.connect(), listener.accept());
        assert!(client.is_ok());
        assert!(server.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_socket_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let address = AgentAddress::Unix(path.to_string_lossy().to_string());
        let listener = address.bind().await.unwrap();
        assert_eq!(listener.local_address().unwrap(), address);
        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_socket_and_regular_files_are_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let address = AgentAddress::Unix(path.to_string_lossy().to_string());
        let live = address.bind().await.unwrap();
        let err = address.bind().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        drop(live);

        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "keep me").unwrap();
        let address = AgentAddress::Unix(file.to_string_lossy().to_string());
        let err = address.bind().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "keep me");
    }

    #[cfg(unix)]
    #[test]
    fn display_is_reparseable() {
        for raw in ["/tmp/a.sock", "tcp://127.0.0.1:9"] {
            let addr: AgentAddress = raw.parse().unwrap();
            assert_eq!(addr.to_string().parse::<AgentAddress>().unwrap(), addr);
        }
    }
}
