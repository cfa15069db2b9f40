//! Per-connection serving: the request loop, connection states, and the
//! background peek that watches for client disconnects.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_channel::oneshot;
use futures_util::future::FutureExt;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, EXPECT};
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::response::ResponseWriter;
use super::{AbortHandler, Shutdown};
use crate::body::{Body, ContinueLine, WiredState};
use crate::common::with_deadline;
use crate::error::Error;
use crate::net::{BoxedStream, ProtoHandler, TlsAcceptor, TlsState};
use crate::proto::h1::parse::{self, BodyLength, RequestHead};
use crate::proto::h1::{Decoder, ReadSide, WriteSide};
use crate::{headers, Request};

/// States a server connection moves through, surfaced to the
/// `conn_state` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no bytes read yet.
    New,
    /// A request head has arrived and is being served.
    Active,
    /// Between requests on a keep-alive connection.
    Idle,
    /// The handler took the raw socket. Terminal.
    Hijacked,
    /// Closed. Terminal.
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Hijacked => "hijacked",
            ConnState::Closed => "closed",
        })
    }
}

/// Addresses of an accepted connection, handed to the state callback.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
}

pub(crate) type ConnStateCallback = Arc<dyn Fn(&ConnInfo, ConnState) + Send + Sync>;

pub(crate) struct ConnConfig {
    pub(crate) handler: Arc<dyn super::Handler>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) read_header_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_header_bytes: usize,
    pub(crate) tls: Option<Arc<dyn TlsAcceptor>>,
    pub(crate) tls_handshake_timeout: Option<Duration>,
    pub(crate) tls_next_proto: std::collections::HashMap<String, Arc<dyn ProtoHandler>>,
    pub(crate) conn_state: Option<ConnStateCallback>,
    pub(crate) shutdown: Arc<Shutdown>,
}

/// State shared between the serve loop, the response writer, the request
/// body, and the background peek task.
pub(crate) struct ConnShared {
    pub(crate) info: ConnInfo,
    close_notify_tx: watch::Sender<bool>,
    close_notify_rx: watch::Receiver<bool>,
    notified: AtomicBool,
    cancel: StdMutex<CancellationToken>,
    reusable: AtomicBool,
    hijacked: AtomicBool,
    state_cb: Option<ConnStateCallback>,
    pub(crate) background: BackgroundRead,
}

impl ConnShared {
    fn new(info: ConnInfo, state_cb: Option<ConnStateCallback>) -> ConnShared {
        let (close_notify_tx, close_notify_rx) = watch::channel(false);
        ConnShared {
            info,
            close_notify_tx,
            close_notify_rx,
            notified: AtomicBool::new(false),
            cancel: StdMutex::new(CancellationToken::new()),
            reusable: AtomicBool::new(true),
            hijacked: AtomicBool::new(false),
            state_cb,
            background: BackgroundRead::new(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        trace!("conn {} -> {}", self.info.remote_addr, state);
        if let Some(cb) = &self.state_cb {
            cb(&self.info, state);
        }
    }

    /// The client went away: fire close-notify (once) and cancel the
    /// in-flight request context.
    pub(crate) fn client_gone(&self) {
        if self
            .notified
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.close_notify_tx.send(true);
        }
        self.reusable.store(false, Ordering::SeqCst);
        self.cancel_request();
    }

    pub(crate) fn close_notify(&self) -> watch::Receiver<bool> {
        self.close_notify_rx.clone()
    }

    fn begin_request(&self, context: CancellationToken) {
        *self.cancel.lock().unwrap() = context;
    }

    pub(crate) fn cancel_request(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    pub(crate) fn set_not_reusable(&self) {
        self.reusable.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_hijacked(&self) {
        self.hijacked.store(true, Ordering::SeqCst);
        self.set_state(ConnState::Hijacked);
    }

    pub(crate) fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::SeqCst)
    }
}

/// The between-requests one-byte reader that observes client
/// disconnects while a handler is running.
pub(crate) struct BackgroundRead {
    running: AtomicBool,
    interrupt: Notify,
    done: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl BackgroundRead {
    fn new() -> BackgroundRead {
        BackgroundRead {
            running: AtomicBool::new(false),
            interrupt: Notify::new(),
            done: StdMutex::new(None),
        }
    }

    /// Spawns the peek task. At most one may be pending per connection;
    /// a second start is a caller bug.
    pub(crate) fn start(&self, reader: Arc<AsyncMutex<ReadSide>>, shared: Arc<ConnShared>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "background read already started");
            error!("background read already pending; ignoring second start");
            return;
        }
        let (tx, rx) = oneshot::channel();
        *self.done.lock().unwrap() = Some(rx);
        tokio::spawn(async move {
            {
                let mut rd = reader.lock().await;
                tokio::select! {
                    biased;
                    _ = shared.background.interrupt.notified() => {
                        trace!("background read aborted");
                    }
                    res = rd.peek_one() => match res {
                        Ok(0) => {
                            trace!("background read observed EOF");
                            shared.client_gone();
                        }
                        Ok(_) => trace!("background read captured a byte"),
                        Err(e) => {
                            debug!("background read error: {}", e);
                            shared.client_gone();
                        }
                    },
                }
            }
            let _ = tx.send(());
        });
    }

    /// Interrupts any pending peek and waits until the task has yielded
    /// the read side. Returns only after the lock is free again.
    pub(crate) async fn abort(&self) {
        let rx = self.done.lock().unwrap().take();
        if let Some(rx) = rx {
            self.interrupt.notify_one();
            let _ = rx.await;
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

enum Exit {
    Close,
    Hijacked,
}

pub(crate) async fn serve(
    cfg: Arc<ConnConfig>,
    stream: BoxedStream,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
) {
    let shared = Arc::new(ConnShared::new(
        ConnInfo {
            remote_addr,
            local_addr,
        },
        cfg.conn_state.clone(),
    ));
    shared.set_state(ConnState::New);

    let mut stream = stream;
    let mut tls_state: Option<TlsState> = None;
    if let Some(acceptor) = &cfg.tls {
        let handshake = with_deadline(cfg.tls_handshake_timeout, acceptor.accept(stream));
        match handshake.await {
            Ok((io, state)) => {
                if let Some(proto) = state.negotiated_protocol.clone() {
                    if !proto.is_empty() && proto != "http/1.1" && proto != "http/1.0" {
                        if let Some(handler) = cfg.tls_next_proto.get(&proto) {
                            handler.serve(io, state, remote_addr).await;
                            shared.set_state(ConnState::Closed);
                            return;
                        }
                    }
                }
                tls_state = Some(state);
                stream = io;
            }
            Err(e) => {
                debug!("TLS handshake error from {}: {}", remote_addr, e);
                shared.set_state(ConnState::Closed);
                return;
            }
        }
    }

    let (read_half, write_half) = tokio::io::split(stream);
    let reader = Arc::new(AsyncMutex::new(ReadSide::new(read_half)));
    let writer = Arc::new(AsyncMutex::new(WriteSide::new(write_half)));

    let exit = serve_requests(&cfg, &reader, &writer, &shared, tls_state).await;
    match exit {
        Exit::Hijacked => {
            // state already reported by hijack(); the socket is the
            // handler's problem now
        }
        Exit::Close => {
            shared.background.abort().await;
            let _ = writer.lock().await.shutdown().await;
            shared.set_state(ConnState::Closed);
        }
    }
}

async fn serve_requests(
    cfg: &Arc<ConnConfig>,
    reader: &Arc<AsyncMutex<ReadSide>>,
    writer: &Arc<AsyncMutex<WriteSide>>,
    shared: &Arc<ConnShared>,
    tls_state: Option<TlsState>,
) -> Exit {
    let mut first = true;
    loop {
        // the read side must be quiet before the next head is parsed
        shared.background.abort().await;

        if !first {
            // idle keep-alive phase: wait (bounded) for the next byte
            let idle_deadline = cfg.idle_timeout.or(cfg.read_timeout);
            let waited = with_deadline(idle_deadline, async {
                let mut rd = reader.lock().await;
                rd.peek_one().await.map_err(Error::new_io)
            })
            .await;
            match waited {
                Ok(0) => return Exit::Close,
                Ok(_) => {}
                Err(e) => {
                    if !e.is_timeout() {
                        debug!("idle read error from {}: {}", shared.info.remote_addr, e);
                    }
                    return Exit::Close;
                }
            }
        }

        let header_deadline = cfg.read_header_timeout.or(cfg.read_timeout);
        let head = match with_deadline(
            header_deadline,
            read_head(reader, cfg.max_header_bytes),
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => return Exit::Close, // clean EOF between requests
            Err(e) => {
                let e = if e.is_timeout() {
                    Error::new_header_timeout()
                } else {
                    e
                };
                if e.is_parse_too_large() {
                    debug!("request head too large from {}", shared.info.remote_addr);
                    respond_error(
                        writer,
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                        "431 Request Header Fields Too Large",
                    )
                    .await;
                    close_write_and_wait(writer).await;
                } else if e.is_parse() {
                    debug!("bad request from {}: {}", shared.info.remote_addr, e);
                    respond_error(writer, StatusCode::BAD_REQUEST, "400 Bad Request").await;
                }
                // common network read errors exit silently
                return Exit::Close;
            }
        };

        shared.set_state(ConnState::Active);
        first = false;

        // header validation beyond what the parser enforces
        let host = match parse::validate_host(&head) {
            Ok(host) => host,
            Err(e) => {
                debug!("rejecting request: {}", e);
                respond_error(
                    writer,
                    StatusCode::BAD_REQUEST,
                    "400 Bad Request: missing or invalid Host header",
                )
                .await;
                return Exit::Close;
            }
        };
        let (body_len, transfer_encoding) = match parse::request_body_length(&head) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("rejecting request: {}", e);
                respond_error(writer, StatusCode::BAD_REQUEST, "400 Bad Request").await;
                return Exit::Close;
            }
        };

        let expects_continue = headers::expects_continue(&head.headers);
        if head.headers.contains_key(EXPECT) && !expects_continue {
            respond_error(
                writer,
                StatusCode::EXPECTATION_FAILED,
                "417 Expectation Failed",
            )
            .await;
            return Exit::Close;
        }

        let (decoder, content_length) = match body_len {
            BodyLength::Known(n) => (Decoder::length(n), n as i64),
            BodyLength::Chunked => (Decoder::chunked(), -1),
            BodyLength::Close => (Decoder::length(0), 0),
        };
        let body_is_empty = decoder.is_eof();

        let context = CancellationToken::new();
        shared.begin_request(context.clone());
        let allow_continue = Arc::new(AtomicBool::new(
            expects_continue && head.version >= Version::HTTP_11,
        ));
        let wrote_continue = Arc::new(AtomicBool::new(false));

        let mut wired = WiredState::new(reader.clone(), decoder, true);
        if expects_continue {
            wired.set_continue_line(ContinueLine {
                writer: writer.clone(),
                allowed: allow_continue.clone(),
                wrote: wrote_continue.clone(),
            });
        }
        {
            let reader = reader.clone();
            let shared = shared.clone();
            wired.on_finish(move |clean| {
                if clean {
                    let hook_shared = shared.clone();
                    shared.background.start(reader, hook_shared);
                } else {
                    shared.set_not_reusable();
                }
            });
        }
        let body_state = Arc::new(AsyncMutex::new(wired));

        let req_close = headers::should_close(head.version, &head.headers);
        let RequestHead {
            method,
            uri,
            version,
            headers: req_headers,
        } = head;
        let wants_http10_keepalive =
            version == Version::HTTP_10 && headers::connection_has(&req_headers, "keep-alive");

        let mut req = Request::new(method.clone(), uri).with_context(context.clone());
        req.version = version;
        req.headers = req_headers;
        req.body = Body::wired(body_state.clone());
        req.content_length = content_length;
        req.transfer_encoding = transfer_encoding;
        req.host = host;
        req.remote_addr = Some(shared.info.remote_addr);
        req.tls = tls_state.clone();
        req.close = req_close;

        // nothing to read? watch for disconnects right away
        if body_is_empty {
            shared
                .background
                .start(reader.clone(), shared.clone());
        }

        let mut w = ResponseWriter::new(
            writer.clone(),
            reader.clone(),
            shared.clone(),
            super::response::ReplyFacts {
                method,
                version,
                req_close,
                wants_http10_keepalive,
                expects_continue,
                write_timeout: cfg.write_timeout,
            },
            Some(body_state.clone()),
            allow_continue,
            wrote_continue,
        );

        let served = std::panic::AssertUnwindSafe(cfg.handler.serve(&mut w, &mut req))
            .catch_unwind()
            .await;

        // the per-request context dies with the handler
        shared.cancel_request();

        if let Err(panic) = served {
            let aborted = panic.is::<AbortHandler>();
            if !aborted {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(
                    "panic serving {}: {}",
                    shared.info.remote_addr, msg
                );
                if !shared.is_hijacked() && !w.wrote_header() {
                    respond_error(
                        writer,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "500 Internal Server Error",
                    )
                    .await;
                }
            }
            return Exit::Close;
        }

        if shared.is_hijacked() {
            return Exit::Hijacked;
        }

        // finish the response, then the request body, then quiesce the
        // read side
        let finished = w.finish().await;
        let _ = req.body.close().await;
        shared.background.abort().await;

        if finished.is_err() || w.must_close() || !shared.is_reusable() {
            return Exit::Close;
        }

        shared.set_state(ConnState::Idle);

        if cfg.shutdown.token.is_cancelled() {
            return Exit::Close;
        }
    }
}

/// Reads and parses one request head. `Ok(None)` is a clean EOF before
/// any bytes of a new request arrived.
async fn read_head(
    reader: &Arc<AsyncMutex<ReadSide>>,
    max: usize,
) -> crate::Result<Option<RequestHead>> {
    let mut rd = reader.lock().await;
    // slop beyond the cap so the parser is the one to notice overflow
    rd.set_read_limit(Some(max + 4096));
    loop {
        if let Some(head) = parse::parse_request(rd.buffer(), max)? {
            rd.set_read_limit(None);
            return Ok(Some(head));
        }
        let n = rd.fill().await.map_err(Error::new_io)?;
        if n == 0 {
            if rd.limit_reached() {
                return Err(Error::new_too_large());
            }
            return if rd.buffer().is_empty() {
                Ok(None)
            } else {
                Err(Error::new_incomplete())
            };
        }
    }
}

/// Writes a minimal error response directly, bypassing the response
/// writer pipeline.
async fn respond_error(writer: &Arc<AsyncMutex<WriteSide>>, status: StatusCode, body: &str) {
    let mut head = HeaderMap::new();
    head.insert(CONTENT_TYPE, "text/plain; charset=utf-8".parse().unwrap());
    head.insert(CONNECTION, "close".parse().unwrap());
    let mut len = itoa::Buffer::new();
    head.insert(CONTENT_LENGTH, len.format(body.len()).parse().unwrap());

    let mut buf = BytesMut::new();
    parse::encode_response_head(status, None, Version::HTTP_11, &head, &mut buf);
    buf.extend_from_slice(body.as_bytes());

    let mut wr = writer.lock().await;
    wr.buffer().extend_from_slice(&buf);
    if let Err(e) = wr.flush().await {
        debug!("error writing error response: {}", e);
    }
}

/// Closes the write side and lingers briefly so the peer sees the
/// response before any RST from discarded request bytes.
async fn close_write_and_wait(writer: &Arc<AsyncMutex<WriteSide>>) {
    let _ = writer.lock().await.shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
}
