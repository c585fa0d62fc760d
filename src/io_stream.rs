//! Plain-vs-TLS socket indirection for one connection.
//!
//! A connection is accepted once as plain or TLS and never changes; this
//! thin enum lets [`crate::connection`] and [`crate::h2session`] drive either
//! kind through the same `AsyncRead`/`AsyncWrite` surface without a trait
//! object, keeping the per-connection task monomorphic where it matters.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pub enum IoStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl IoStream {
    pub fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        match self {
            IoStream::Plain(s) => s.set_nodelay(nodelay),
            IoStream::Tls(s) => s.get_ref().0.set_nodelay(nodelay),
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
