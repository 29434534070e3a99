//! The session's hot-swappable socket: plain TCP until STARTTLS succeeds, TLS
//! afterward, never back. A single non-generic type lets `Session` hold one
//! stream field across the upgrade instead of re-entering a generic function
//! with a new concrete stream type.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Either a plain TCP socket or a TLS-wrapped one, switched exactly once by
/// [`crate::tls::upgrade`]. `Upgrading` is a transient placeholder occupied
/// only for the duration of the handshake, via `mem::replace`; it is never
/// observed by I/O and any attempt to use it is a bug in the upgrade path.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Upgrading,
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// The chain the peer presented during the TLS handshake, if any.
    /// `None` for plain connections and for TLS connections where the peer
    /// presented no certificate (client auth not required, or peer
    /// unverified).
    pub fn peer_certificates(&self) -> Option<Vec<rustls::pki_types::CertificateDer<'static>>> {
        match self {
            Transport::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec()),
            Transport::Plain(_) | Transport::Upgrading => None,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Transport::Upgrading => unreachable!("I/O attempted on a transport mid-upgrade"),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Transport::Upgrading => unreachable!("I/O attempted on a transport mid-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Transport::Upgrading => unreachable!("I/O attempted on a transport mid-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Transport::Upgrading => unreachable!("I/O attempted on a transport mid-upgrade"),
        }
    }
}
