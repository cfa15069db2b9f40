//! Transport streams and the seams the transport dials through.
//!
//! TLS itself is a collaborator, not a dependency: the server takes a
//! [`TlsAcceptor`] and the client a [`TlsConnector`], both of which hand
//! back an opaque encrypted stream plus the negotiated [`TlsState`].

use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::{Error, Result};

/// A duplex byte stream a connection can run over.
///
/// Blanket-implemented for anything that is async read + write, so
/// `TcpStream`, TLS wrappers, and in-memory duplex pipes all qualify.
pub trait NetworkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> NetworkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An owned, type-erased [`NetworkStream`].
pub type BoxedStream = Box<dyn NetworkStream>;

/// Opens raw transport streams for the client.
pub trait Dialer: Send + Sync {
    /// Dial `addr` (a `host:port` pair) and return the raw stream.
    fn dial(&self, addr: &str) -> BoxFuture<'static, Result<BoxedStream>>;
}

/// The default dialer: plain TCP via tokio.
#[derive(Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str) -> BoxFuture<'static, Result<BoxedStream>> {
        let addr = addr.to_owned();
        Box::pin(async move {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(Error::new_connect)?;
            stream.set_nodelay(true).map_err(Error::new_connect)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// State negotiated by a TLS handshake.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    /// ALPN protocol selected during the handshake, if any.
    pub negotiated_protocol: Option<String>,
    /// SNI server name, when the acceptor saw one.
    pub server_name: Option<String>,
}

/// Client-side TLS seam: wraps an established stream in a handshake.
pub trait TlsConnector: Send + Sync {
    /// Perform a client handshake against `domain` over `io`.
    fn connect(
        &self,
        io: BoxedStream,
        domain: &str,
    ) -> BoxFuture<'static, Result<(BoxedStream, TlsState)>>;
}

/// Server-side TLS seam: accepts a handshake on an inbound stream.
pub trait TlsAcceptor: Send + Sync {
    fn accept(&self, io: BoxedStream) -> BoxFuture<'static, Result<(BoxedStream, TlsState)>>;
}

/// Handles a connection whose ALPN negotiation selected a protocol other
/// than HTTP/1.x. Registered on the server keyed by protocol name.
pub trait ProtoHandler: Send + Sync {
    fn serve(
        &self,
        io: BoxedStream,
        tls: TlsState,
        remote_addr: SocketAddr,
    ) -> BoxFuture<'static, ()>;
}
