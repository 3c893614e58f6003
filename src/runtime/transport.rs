//! Byte-stream endpoints.
//!
//! A [`Transport`] is whichever bidirectional stream a connection runs
//! over: TCP, a Unix domain socket, a Windows named pipe, or any boxed
//! `AsyncRead + AsyncWrite` (in-process pipes and test doubles).
//! [`Listener`] produces inbound transports for the acceptor.

use crate::error::{Error, IoOp, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

/// Listen backlog for TCP endpoints.
const BACKLOG: i32 = 1024;

/// Any stream usable as a custom transport.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// Where to listen or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
    /// `pipe:\\.\pipe\name`
    Pipe(String),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty unix socket path".to_string());
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(name) = s.strip_prefix("pipe:") {
            if name.is_empty() {
                return Err("empty pipe name".to_string());
            }
            return Ok(Endpoint::Pipe(name.to_string()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(s.to_string()))
            }
            _ => Err(format!("invalid endpoint '{s}', expected host:port, unix:<path> or pipe:<name>")),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => f.write_str(addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Pipe(name) => write!(f, "pipe:{name}"),
        }
    }
}

/// An open byte stream.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(windows)]
    PipeServer(NamedPipeServer),
    #[cfg(windows)]
    PipeClient(NamedPipeClient),
    Custom(Box<dyn Stream>),
}

impl Transport {
    pub fn custom<S: Stream>(stream: S) -> Self {
        Transport::Custom(Box::new(stream))
    }

    /// Human-readable peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            Transport::Unix(_) => "unix".to_string(),
            #[cfg(windows)]
            Transport::PipeServer(_) | Transport::PipeClient(_) => "pipe".to_string(),
            Transport::Custom(_) => "custom".to_string(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transport").field(&self.peer()).finish()
    }
}

macro_rules! delegate {
    ($self:ident, $stream:ident => $body:expr) => {
        match $self.get_mut() {
            Transport::Tcp($stream) => $body,
            #[cfg(unix)]
            Transport::Unix($stream) => $body,
            #[cfg(windows)]
            Transport::PipeServer($stream) => $body,
            #[cfg(windows)]
            Transport::PipeClient($stream) => $body,
            Transport::Custom($stream) => $body,
        }
    };
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Transport::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Transport::Unix(s) => s.is_write_vectored(),
            #[cfg(windows)]
            Transport::PipeServer(s) => s.is_write_vectored(),
            #[cfg(windows)]
            Transport::PipeClient(s) => s.is_write_vectored(),
            Transport::Custom(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

/// Open an outbound transport.
pub async fn connect(endpoint: &Endpoint) -> Result<Transport> {
    let connect_err = |err| Error::transport(IoOp::Connect, err);
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await.map_err(connect_err)?;
            stream.set_nodelay(true).map_err(connect_err)?;
            Ok(Transport::Tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Transport::Unix(
            UnixStream::connect(path).await.map_err(connect_err)?,
        )),
        #[cfg(windows)]
        Endpoint::Pipe(name) => Ok(Transport::PipeClient(
            ClientOptions::new().open(name).map_err(connect_err)?,
        )),
        #[allow(unreachable_patterns)]
        _ => Err(connect_err(unsupported(endpoint))),
    }
}

fn unsupported(endpoint: &Endpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{endpoint} is not supported on this platform"),
    )
}

/// A bound listening endpoint.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    #[cfg(windows)]
    Pipe { name: String, next: NamedPipeServer },
}

impl Listener {
    /// Bind and listen on `endpoint`.
    ///
    /// Must run inside a tokio runtime.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let bind_err = |err| Error::transport(IoOp::Bind, err);
        match endpoint {
            Endpoint::Tcp(addr) => {
                let addr = tokio::net::lookup_host(addr.as_str())
                    .await
                    .map_err(bind_err)?
                    .next()
                    .ok_or_else(|| {
                        bind_err(io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
                    })?;
                let listener = create_tcp_listener(addr).map_err(bind_err)?;
                Ok(Listener::Tcp(TcpListener::from_std(listener).map_err(bind_err)?))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                // A stale socket file from an earlier run blocks bind; other
                // files are left alone and bind reports the conflict
                let stale = std::fs::symlink_metadata(path)
                    .map(|meta| meta.file_type().is_socket())
                    .unwrap_or(false);
                if stale {
                    let _ = std::fs::remove_file(path);
                }
                Ok(Listener::Unix {
                    listener: UnixListener::bind(path).map_err(bind_err)?,
                    path: path.clone(),
                })
            }
            #[cfg(windows)]
            Endpoint::Pipe(name) => {
                let next = ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(name)
                    .map_err(bind_err)?;
                Ok(Listener::Pipe {
                    name: name.clone(),
                    next,
                })
            }
            #[allow(unreachable_patterns)]
            _ => Err(bind_err(unsupported(endpoint))),
        }
    }

    /// Wait for the next inbound transport.
    pub async fn accept(&mut self) -> io::Result<Transport> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Transport::Unix(stream))
            }
            #[cfg(windows)]
            Listener::Pipe { name, next } => {
                next.connect().await?;
                let fresh = ServerOptions::new().create(name.as_str())?;
                Ok(Transport::PipeServer(std::mem::replace(next, fresh)))
            }
        }
    }

    /// The endpoint actually bound. For TCP this carries the assigned port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            #[cfg(windows)]
            Listener::Pipe { name, .. } => Ok(Endpoint::Pipe(name.clone())),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// TCP listener with SO_REUSEADDR and a deep backlog.
fn create_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            "127.0.0.1:9000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            "[::1]:80".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("[::1]:80".to_string())
        );
        assert_eq!(
            "unix:/tmp/link.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/link.sock"))
        );
        assert_eq!(
            r"pipe:\\.\pipe\link".parse::<Endpoint>().unwrap(),
            Endpoint::Pipe(r"\\.\pipe\link".to_string())
        );
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        for text in ["10.0.0.1:5", "unix:/var/run/x.sock", "pipe:name"] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[tokio::test]
    async fn test_tcp_bind_connect() {
        let endpoint: Endpoint = "127.0.0.1:0".parse().unwrap();
        let mut listener = Listener::bind(&endpoint).await.unwrap();
        let bound = listener.local_endpoint().unwrap();

        let client = tokio::spawn(async move {
            let mut transport = connect(&bound).await.unwrap();
            transport.write_all(b"ping").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_connect() {
        let path = std::env::temp_dir().join(format!("packet-link-{}.sock", std::process::id()));
        let endpoint = Endpoint::Unix(path.clone());
        let mut listener = Listener::bind(&endpoint).await.unwrap();

        let client = tokio::spawn(async move {
            let mut transport = connect(&endpoint).await.unwrap();
            transport.write_all(b"hey").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hey");
        client.await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket_only() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();

        let stale = dir.join(format!("packet-link-stale-{pid}.sock"));
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        assert!(stale.exists());
        let listener = Listener::bind(&Endpoint::Unix(stale.clone())).await.unwrap();
        drop(listener);

        let regular = dir.join(format!("packet-link-regular-{pid}.sock"));
        std::fs::write(&regular, b"keep me").unwrap();
        assert!(Listener::bind(&Endpoint::Unix(regular.clone())).await.is_err());
        assert_eq!(std::fs::read(&regular).unwrap(), b"keep me");
        std::fs::remove_file(&regular).unwrap();
    }

    #[tokio::test]
    async fn test_custom_transport() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut transport = Transport::custom(a);
        assert_eq!(transport.peer(), "custom");
        transport.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }
}
