//! Transport connectors
//!
//! A connector turns a set of `ConnArgs` into an established duplex stream.
//! The pool never opens sockets itself; it only calls `Connector::connect`.
//!
//! Provided connectors:
//! - `TcpConnector`: `host` + `port`, optional `nodelay`, `keepalive`, `connect_timeout_ms`
//! - `UnixConnector`: `path`, optional `connect_timeout_ms` (unix only)
//! - `EndpointConnector`: either of the above, picked at runtime from configuration
//! - `FnConnector`: any async closure

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::args::ConnArgs;

/// Establishes new transports for a pool
pub trait Connector: Send + Sync + 'static {
    /// The raw duplex stream produced by this connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new transport using the given arguments
    fn connect(&self, args: &ConnArgs) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Object-safe bundle of the traits a pooled stream needs
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// A type-erased duplex stream
pub type BoxedStream = Box<dyn Duplex>;

/// Optional connect deadline shared by the stock connectors
fn connect_timeout(args: &ConnArgs) -> io::Result<Option<Duration>> {
    match args.get_int("connect_timeout_ms")? {
        None => Ok(None),
        Some(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms as u64))),
        Some(ms) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("connect_timeout_ms must be positive, got {}", ms),
        )),
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", d),
            )
        })?,
        None => fut.await,
    }
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    async fn open(args: &ConnArgs) -> io::Result<TcpStream> {
        let host = args.require_str("host")?;
        let port = args.require_int("port")?;
        let port = u16::try_from(port).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port out of range: {}", port),
            )
        })?;
        let nodelay = args.get_bool("nodelay")?.unwrap_or(true);
        let keepalive = args.get_bool("keepalive")?.unwrap_or(false);
        let deadline = connect_timeout(args)?;

        debug!(host = %host, port = %port, "Opening TCP connection");

        let stream = with_deadline(deadline, TcpStream::connect((host, port))).await?;
        stream.set_nodelay(nodelay)?;
        if keepalive {
            socket2::SockRef::from(&stream).set_keepalive(true)?;
        }

        Ok(stream)
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, args: &ConnArgs) -> io::Result<TcpStream> {
        Self::open(args).await
    }
}

/// Unix domain socket connector
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixConnector;

#[cfg(unix)]
impl UnixConnector {
    async fn open(args: &ConnArgs) -> io::Result<tokio::net::UnixStream> {
        let path = args.require_str("path")?;
        let deadline = connect_timeout(args)?;

        debug!(path = %path, "Opening Unix socket connection");

        with_deadline(deadline, tokio::net::UnixStream::connect(path)).await
    }
}

#[cfg(unix)]
impl Connector for UnixConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self, args: &ConnArgs) -> io::Result<tokio::net::UnixStream> {
        Self::open(args).await
    }
}

/// Connector selected at runtime, yielding type-erased streams
#[derive(Debug, Clone, Copy)]
pub enum EndpointConnector {
    Tcp(TcpConnector),
    #[cfg(unix)]
    Unix(UnixConnector),
}

impl Connector for EndpointConnector {
    type Stream = BoxedStream;

    async fn connect(&self, args: &ConnArgs) -> io::Result<BoxedStream> {
        match self {
            EndpointConnector::Tcp(_) => {
                let stream = TcpConnector::open(args).await?;
                Ok(Box::new(stream) as BoxedStream)
            }
            #[cfg(unix)]
            EndpointConnector::Unix(_) => {
                let stream = UnixConnector::open(args).await?;
                Ok(Box::new(stream) as BoxedStream)
            }
        }
    }
}

/// Adapts an async closure into a `Connector`
///
/// The closure receives its own copy of the pool's arguments.
pub struct FnConnector<F>(F);

impl<F> FnConnector<F> {
    pub fn new(f: F) -> Self {
        FnConnector(f)
    }
}

impl<F, Fut, S> Connector for FnConnector<F>
where
    F: Fn(ConnArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<S>> + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn connect(&self, args: &ConnArgs) -> impl Future<Output = io::Result<S>> + Send {
        (self.0)(args.clone())
    }
}
