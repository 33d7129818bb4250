//! Opaque secure-transport adapter.
//!
//! The connection FSM never touches certificate material: it reads and
//! writes through [`Stream`], which is either a plain [`TcpStream`] or a
//! boxed handshake-complete TLS stream produced by a [`TlsAcceptor`].

use futures::future::BoxFuture;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// Anything the core can read from and write to once a handshake (if any)
/// has completed.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub(crate) type BoxedTransport = Box<dyn Transport + Unpin + Send>;

/// Performs the TLS handshake on an accepted plain socket, producing a
/// boxed stream the core treats identically to plain TCP from then on.
///
/// Embedders construct the certificate store and wrap it behind this
/// trait; the core never sees a certificate or private key.
pub trait TlsAcceptor: Sync + Send + 'static {
    /// Consumes the raw, just-accepted socket and drives the handshake.
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<BoxedTransport>>;
}

impl TlsAcceptor for tokio_rustls::TlsAcceptor {
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<BoxedTransport>> {
        let acceptor = self.clone();
        Box::pin(async move {
            let stream = acceptor.accept(stream).await?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// Either side of the plain/TLS split the worker pool reads and writes
/// through; the connection FSM is generic over neither variant.
pub(crate) enum Stream {
    Plain(TcpStream),
    Secure(BoxedTransport),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Secure(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Secure(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Secure(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Secure(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}
