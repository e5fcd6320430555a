//! Pooled connection handle
//!
//! A `Connection` owns one duplex stream and forwards reads and writes to it,
//! remembering whether the read side has hit end-of-stream or failed. That
//! record is what the pool consults when deciding whether a connection can be
//! handed out again.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the read side of a connection has observed so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// No sign of trouble
    Open,

    /// The peer closed its write side
    Eof,

    /// A read returned an error
    Failed(io::ErrorKind),

    /// Bytes arrived while nobody was expecting a reply
    Unsolicited,
}

impl ReadState {
    pub fn is_open(&self) -> bool {
        matches!(self, ReadState::Open)
    }
}

/// A duplex connection checked out from, or idle inside, a pool
pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    read_state: ReadState,
    created_at: Instant,
    use_count: u64,
}

impl<S> Connection<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            id: ConnectionId::next(),
            stream,
            read_state: ReadState::Open,
            created_at: Instant::now(),
            use_count: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    /// Time since the transport was established
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of times this connection has been checked out
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Mutable access to the raw stream.
    ///
    /// I/O done directly on the stream bypasses read-state tracking.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.use_count += 1;
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Check whether this connection can no longer be reused.
    ///
    /// A connection is stale once its read side has recorded end-of-stream
    /// or an error. If nothing has been recorded yet, the stream is polled
    /// once for a single byte without registering interest: a pending read
    /// means the connection is quiet and healthy, anything else is recorded.
    ///
    /// This is stricter than an end-of-stream/error check alone: bytes that
    /// arrived while nobody expected a reply also make the connection stale
    /// (`ReadState::Unsolicited`), and the probed byte is consumed.
    pub fn is_stale(&mut self) -> bool {
        if self.read_state.is_open() {
            self.probe();
        }
        !self.read_state.is_open()
    }

    fn probe(&mut self) {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(Waker::noop());

        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => {}
            Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                self.read_state = ReadState::Eof;
            }
            Poll::Ready(Ok(())) => {
                debug!(id = %self.id, "Unsolicited data on idle connection");
                self.read_state = ReadState::Unsolicited;
            }
            Poll::Ready(Err(e)) => {
                debug!(id = %self.id, error = %e, "Idle connection probe failed");
                self.read_state = ReadState::Failed(e.kind());
            }
        }
    }

    /// Shut down the write side and drop the stream
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(id = %self.id, error = %e, "Error shutting down connection");
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("read_state", &self.read_state)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Connection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();

        let result = Pin::new(&mut this.stream).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if had_room && buf.filled().len() == before => {
                this.read_state = ReadState::Eof;
            }
            Poll::Ready(Err(e)) => {
                this.read_state = ReadState::Failed(e.kind());
            }
            _ => {}
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Connection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
