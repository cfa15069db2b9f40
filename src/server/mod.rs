//! HTTP/1.x server: accept loop, per-connection lifecycle, handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::{ProtoHandler, TlsAcceptor};
use crate::{Error, Request, Result};

pub(crate) mod conn;
mod response;

pub use self::conn::{ConnInfo, ConnState};
pub use self::response::ResponseWriter;

/// Default cap on request-head bytes (request line plus headers).
pub(crate) const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Serves one request: read from `req`, write through `w`.
///
/// Runs on the connection's own task; the next request on the same
/// connection is not read until this returns (no pipelining).
pub trait Handler: Send + Sync + 'static {
    fn serve<'a>(&'a self, w: &'a mut ResponseWriter, req: &'a mut Request) -> BoxFuture<'a, ()>;
}

/// Adapts a function into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, &'a mut Request) -> BoxFuture<'a, ()>
        + Send
        + Sync
        + 'static,
{
    HandlerFn { f }
}

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ResponseWriter, &'a mut Request) -> BoxFuture<'a, ()>
        + Send
        + Sync
        + 'static,
{
    fn serve<'a>(&'a self, w: &'a mut ResponseWriter, req: &'a mut Request) -> BoxFuture<'a, ()> {
        (self.f)(w, req)
    }
}

/// Panic payload that aborts a handler without the stack-trace log.
/// The connection is still torn down.
#[derive(Debug)]
pub struct AbortHandler;

pub(crate) struct Shutdown {
    pub(crate) token: CancellationToken,
}

/// An HTTP/1.x server.
///
/// Configuration is chained before calling [`Server::serve`]:
///
/// ```no_run
/// # use trestle::server::{Server, handler_fn};
/// # use std::time::Duration;
/// # fn handler<'a>(w: &'a mut trestle::server::ResponseWriter, _req: &'a mut trestle::Request)
/// #     -> futures_util::future::BoxFuture<'a, ()> { Box::pin(async move { let _ = w.write(b"hi").await; }) }
/// let server = Server::new(handler_fn(handler))
///     .read_header_timeout(Duration::from_secs(10))
///     .idle_timeout(Duration::from_secs(60));
/// ```
pub struct Server {
    handler: Arc<dyn Handler>,
    read_timeout: Option<Duration>,
    read_header_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    max_header_bytes: usize,
    tls: Option<Arc<dyn TlsAcceptor>>,
    tls_handshake_timeout: Option<Duration>,
    tls_next_proto: HashMap<String, Arc<dyn ProtoHandler>>,
    conn_state: Option<conn::ConnStateCallback>,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn new<H: Handler>(handler: H) -> Server {
        Server {
            handler: Arc::new(handler),
            read_timeout: None,
            read_header_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            tls: None,
            tls_handshake_timeout: None,
            tls_next_proto: HashMap::new(),
            conn_state: None,
            shutdown: Arc::new(Shutdown {
                token: CancellationToken::new(),
            }),
        }
    }

    /// Maximum duration for reading an entire request, including the body.
    pub fn read_timeout(mut self, dur: Duration) -> Server {
        self.read_timeout = Some(dur);
        self
    }

    /// Maximum duration for reading request headers. Falls back to
    /// `read_timeout` when unset.
    pub fn read_header_timeout(mut self, dur: Duration) -> Server {
        self.read_header_timeout = Some(dur);
        self
    }

    /// Maximum duration of socket flushes while writing a response.
    pub fn write_timeout(mut self, dur: Duration) -> Server {
        self.write_timeout = Some(dur);
        self
    }

    /// How long a keep-alive connection may sit idle between requests.
    /// Falls back to `read_timeout` when unset.
    pub fn idle_timeout(mut self, dur: Duration) -> Server {
        self.idle_timeout = Some(dur);
        self
    }

    /// Cap on request-head bytes. Defaults to 1 MiB.
    pub fn max_header_bytes(mut self, max: usize) -> Server {
        self.max_header_bytes = max;
        self
    }

    pub fn tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Server {
        self.tls = Some(acceptor);
        self
    }

    pub fn tls_handshake_timeout(mut self, dur: Duration) -> Server {
        self.tls_handshake_timeout = Some(dur);
        self
    }

    /// Registers a handler for a TLS ALPN protocol other than HTTP/1.x.
    pub fn tls_next_proto(mut self, proto: &str, handler: Arc<dyn ProtoHandler>) -> Server {
        self.tls_next_proto.insert(proto.to_owned(), handler);
        self
    }

    /// Observes every connection state transition.
    pub fn conn_state<F>(mut self, callback: F) -> Server
    where
        F: Fn(&ConnInfo, ConnState) + Send + Sync + 'static,
    {
        self.conn_state = Some(Arc::new(callback));
        self
    }

    /// Stops the accept loop and lets active connections wind down after
    /// their current request.
    pub fn shutdown(&self) {
        self.shutdown.token.cancel();
    }

    /// Binds `addr` and serves until shut down.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(Error::new_listen)?;
        self.serve(listener).await
    }

    /// Accepts connections, spawning one serving task each, until shut
    /// down. Returns the server-closed error on shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cfg = Arc::new(self.conn_config());
        let mut accept_backoff = Duration::from_millis(5);
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.token.cancelled() => return Err(Error::new_server_closed()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    accept_backoff = Duration::from_millis(5);
                    let local_addr = stream.local_addr().ok();
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", remote_addr, e);
                    }
                    let cfg = cfg.clone();
                    tokio::spawn(async move {
                        conn::serve(cfg, Box::new(stream), remote_addr, local_addr).await;
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    // typically EMFILE pressure; retry after a pause
                    warn!("accept error: {}; retrying in {:?}", e, accept_backoff);
                    tokio::time::sleep(accept_backoff).await;
                    accept_backoff = (accept_backoff * 2).min(Duration::from_secs(1));
                }
                Err(e) => return Err(Error::new_accept(e)),
            }
        }
    }

    fn conn_config(&self) -> conn::ConnConfig {
        conn::ConnConfig {
            handler: self.handler.clone(),
            read_timeout: self.read_timeout,
            read_header_timeout: self.read_header_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            max_header_bytes: self.max_header_bytes,
            tls: self.tls.clone(),
            tls_handshake_timeout: self.tls_handshake_timeout,
            tls_next_proto: self.tls_next_proto.clone(),
            conn_state: self.conn_state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}
