//! Connected transport handed to the protocol client.
//!
//! Both halves share a drop guard. Once reader and writer are gone the
//! transport counts as closed and the connector's reconnect loop wakes up.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_util::sync::{CancellationToken, DropGuard};

/// A connected byte stream to the language server.
pub struct Transport {
    id: u64,
    stream: TcpStream,
    close_guard: DropGuard,
}

impl Transport {
    /// Wrap a connected stream. The returned token is cancelled when the
    /// transport (or both of its halves) is dropped.
    pub(crate) fn new(id: u64, stream: TcpStream) -> (Self, CancellationToken) {
        let closed = CancellationToken::new();
        let transport = Self {
            id,
            stream,
            close_guard: closed.clone().drop_guard(),
        };
        (transport, closed)
    }

    /// Connect attempt number that produced this transport.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Split into independently owned read and write halves.
    #[must_use]
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (reader, writer) = self.stream.into_split();
        let guard = Arc::new(self.close_guard);
        (
            TransportReader {
                inner: reader,
                _guard: guard.clone(),
            },
            TransportWriter {
                inner: writer,
                _guard: guard,
            },
        )
    }
}

/// Server-to-client half of a [`Transport`].
pub struct TransportReader {
    inner: OwnedReadHalf,
    _guard: Arc<DropGuard>,
}

/// Client-to-server half of a [`Transport`].
pub struct TransportWriter {
    inner: OwnedWriteHalf,
    _guard: Arc<DropGuard>,
}

impl AsyncRead for TransportReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TransportWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
