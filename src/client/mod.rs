//! HTTP/1.x client transport: a connection pool plus round-trip
//! execution, with proxies, TLS seams, and idempotent retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, PROXY_AUTHORIZATION, RANGE, TRANSFER_ENCODING,
    USER_AGENT,
};
use http::{Method, Uri, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) mod conn;
mod connect;
pub(crate) mod gzip;
pub(crate) mod pool;
pub mod proxy;

pub use self::proxy::{proxy_from_environment, proxy_url, ProxySelector};

use self::conn::{ConnParams, OutFraming, PersistConn, RoundTripRequest};
use self::pool::{Key, Pool};
use crate::body::Body;
use crate::error::Error;
use crate::message::{GetBody, RequestFacts};
use crate::net::{Dialer, TcpDialer, TlsConnector};
use crate::{headers, proto::h1::parse, Request, Response, Result};

/// Sent when the caller supplied no User-Agent of their own.
pub const DEFAULT_USER_AGENT: &str = concat!("trestle/", env!("CARGO_PKG_VERSION"));

const DEFAULT_MAX_IDLE_CONNS: usize = 100;
const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 1 << 20;

/// Executes single HTTP transactions.
///
/// Must close the request body on all paths, and must not retain the
/// request beyond the round-trip.
pub trait RoundTripper: Send + Sync {
    fn round_trip(&self, req: Request) -> BoxFuture<'static, Result<Response>>;
}

/// How to reach a target: the pool key plus everything dialing needs.
#[derive(Debug, Clone)]
pub(crate) struct ConnectMethod {
    pub(crate) proxy: Option<Uri>,
    pub(crate) scheme: String,
    pub(crate) addr: String,
    pub(crate) host: String,
}

impl ConnectMethod {
    pub(crate) fn key(&self) -> Key {
        (
            self.proxy
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            self.scheme.clone(),
            self.addr.clone(),
        )
    }
}

pub(crate) struct TransportInner {
    pub(crate) pool: Pool,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) tls: Option<Arc<dyn TlsConnector>>,
    pub(crate) tls_handshake_timeout: Duration,
    pub(crate) proxy: Option<ProxySelector>,
    pub(crate) proxy_connect_headers: http::HeaderMap,
    pub(crate) disable_keep_alives: bool,
    pub(crate) disable_compression: bool,
    pub(crate) response_header_timeout: Option<Duration>,
    pub(crate) expect_continue_timeout: Duration,
    pub(crate) max_response_header_bytes: usize,
    pub(crate) alt: StdMutex<HashMap<String, Arc<dyn RoundTripper>>>,
}

impl TransportInner {
    pub(crate) fn conn_params(&self) -> ConnParams {
        ConnParams {
            pool: self.pool.clone(),
            max_response_header_bytes: self.max_response_header_bytes,
            disable_keep_alives: self.disable_keep_alives,
        }
    }
}

/// A pooling HTTP/1.x transport.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Clone for Transport {
    fn clone(&self) -> Transport {
        Transport {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Transport {
    fn default() -> Transport {
        Transport::builder().build()
    }
}

pub struct TransportBuilder {
    dialer: Arc<dyn Dialer>,
    tls: Option<Arc<dyn TlsConnector>>,
    tls_handshake_timeout: Duration,
    proxy: Option<ProxySelector>,
    proxy_connect_headers: http::HeaderMap,
    disable_keep_alives: bool,
    disable_compression: bool,
    max_idle_conns: usize,
    max_idle_conns_per_host: usize,
    idle_conn_timeout: Option<Duration>,
    response_header_timeout: Option<Duration>,
    expect_continue_timeout: Duration,
    max_response_header_bytes: usize,
}

impl TransportBuilder {
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn tls(mut self, connector: Arc<dyn TlsConnector>) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn tls_handshake_timeout(mut self, dur: Duration) -> Self {
        self.tls_handshake_timeout = dur;
        self
    }

    pub fn proxy(mut self, selector: ProxySelector) -> Self {
        self.proxy = Some(selector);
        self
    }

    /// Never use a proxy, regardless of the environment.
    pub fn no_proxy(mut self) -> Self {
        self.proxy = None;
        self
    }

    /// Extra headers sent on CONNECT requests to a proxy.
    pub fn proxy_connect_headers(mut self, headers: http::HeaderMap) -> Self {
        self.proxy_connect_headers = headers;
        self
    }

    pub fn disable_keep_alives(mut self, disabled: bool) -> Self {
        self.disable_keep_alives = disabled;
        self
    }

    pub fn disable_compression(mut self, disabled: bool) -> Self {
        self.disable_compression = disabled;
        self
    }

    pub fn max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = max;
        self
    }

    pub fn idle_conn_timeout(mut self, dur: Duration) -> Self {
        self.idle_conn_timeout = Some(dur);
        self
    }

    pub fn response_header_timeout(mut self, dur: Duration) -> Self {
        self.response_header_timeout = Some(dur);
        self
    }

    pub fn expect_continue_timeout(mut self, dur: Duration) -> Self {
        self.expect_continue_timeout = dur;
        self
    }

    pub fn max_response_header_bytes(mut self, max: usize) -> Self {
        self.max_response_header_bytes = max;
        self
    }

    pub fn build(self) -> Transport {
        Transport {
            inner: Arc::new(TransportInner {
                pool: Pool::new(
                    self.max_idle_conns,
                    self.max_idle_conns_per_host,
                    self.idle_conn_timeout,
                ),
                dialer: self.dialer,
                tls: self.tls,
                tls_handshake_timeout: self.tls_handshake_timeout,
                proxy: self.proxy,
                proxy_connect_headers: self.proxy_connect_headers,
                disable_keep_alives: self.disable_keep_alives,
                disable_compression: self.disable_compression,
                response_header_timeout: self.response_header_timeout,
                expect_continue_timeout: self.expect_continue_timeout,
                max_response_header_bytes: self.max_response_header_bytes,
                alt: StdMutex::new(HashMap::new()),
            }),
        }
    }
}

impl Transport {
    pub fn new() -> Transport {
        Transport::default()
    }

    pub fn builder() -> TransportBuilder {
        TransportBuilder {
            dialer: Arc::new(TcpDialer),
            tls: None,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            proxy: Some(proxy_from_environment()),
            proxy_connect_headers: http::HeaderMap::new(),
            disable_keep_alives: false,
            disable_compression: false,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            idle_conn_timeout: Some(DEFAULT_IDLE_CONN_TIMEOUT),
            response_header_timeout: None,
            expect_continue_timeout: DEFAULT_EXPECT_CONTINUE_TIMEOUT,
            max_response_header_bytes: DEFAULT_MAX_RESPONSE_HEADER_BYTES,
        }
    }

    /// Registers an alternate round tripper for a URL scheme. The
    /// registered tripper may return the skip-alternate-protocol
    /// sentinel to fall back to this transport.
    pub fn register_protocol(&self, scheme: &str, rt: Arc<dyn RoundTripper>) {
        self.inner
            .alt
            .lock()
            .unwrap()
            .insert(scheme.to_ascii_lowercase(), rt);
    }

    /// Closes every idle pooled connection.
    pub fn close_idle_connections(&self) {
        self.inner.pool.close_idle();
    }

    /// How many connections sit idle in the pool right now.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// Executes one HTTP transaction, pooling or dialing a connection
    /// as needed, retrying idempotent requests once-per-stale-conn when
    /// a cached keep-alive connection turns out dead.
    pub async fn round_trip(&self, mut req: Request) -> Result<Response> {
        let scheme = req.uri.scheme_str().map(str::to_owned);

        if let Some(scheme) = scheme.as_deref() {
            let alt = self.inner.alt.lock().unwrap().get(scheme).cloned();
            if let Some(alt) = alt {
                let rebuilt = rebuild_request(&req);
                match alt.round_trip(req).await {
                    Err(e) if e.is_skip_alternate_protocol() => match rebuilt {
                        Some(restored) => req = restored,
                        None => return Err(e),
                    },
                    other => return other,
                }
            }
        }

        match scheme.as_deref() {
            Some("http") | Some("https") => {}
            _ => return Err(Error::new_unsupported_scheme()),
        }
        if req.uri.host().map(str::is_empty).unwrap_or(true) {
            return Err(Error::new_missing_host());
        }
        if let Some(port) = req.uri.port() {
            if port.as_str().parse::<u16>().is_err() {
                return Err(Error::new_invalid_port());
            }
        }

        // buffered bodies are replayable for free
        if req.get_body.is_none() {
            if let Some(bytes) = req.body.full_bytes() {
                if !bytes.is_empty() {
                    req.get_body = Some(Arc::new(move || Ok(Body::from(bytes.clone()))) as GetBody);
                }
            }
        }
        let had_body = req.body.size_hint() != Some(0);

        let cm = self.connect_method(&req.uri)?;

        loop {
            let pc = self.get_conn(&cm, req.cancel.as_ref()).await?;

            let outcome = self.one_attempt(&mut req, &cm, &pc).await;
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if !should_retry_request(&req, &e, &pc, had_body) {
                        return Err(e);
                    }
                    debug!("retrying request after: {}", e);
                    if had_body {
                        match &req.get_body {
                            Some(get_body) => req.body = get_body()?,
                            None => return Err(e),
                        }
                    }
                }
            }
        }
    }

    async fn one_attempt(
        &self,
        req: &mut Request,
        cm: &ConnectMethod,
        pc: &Arc<PersistConn>,
    ) -> Result<Response> {
        let mut headers = req.headers.clone();
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, DEFAULT_USER_AGENT.parse().unwrap());
        }

        // ask for gzip when the caller did not take a position; the
        // response body is then transparently decoded
        let mut requested_gzip = false;
        if !self.inner.disable_compression
            && !headers.contains_key(ACCEPT_ENCODING)
            && !headers.contains_key(RANGE)
            && req.method != Method::HEAD
        {
            requested_gzip = true;
            headers.insert(ACCEPT_ENCODING, "gzip".parse().unwrap());
        }

        let body = std::mem::take(&mut req.body);
        let declared_cl = headers::content_length(&headers).ok().flatten();
        let framing = match (body.size_hint(), declared_cl) {
            (Some(0), _) => OutFraming::Empty,
            (Some(len), _) => {
                let mut buf = itoa::Buffer::new();
                headers.insert(CONTENT_LENGTH, buf.format(len).parse().unwrap());
                OutFraming::Length(len)
            }
            (None, Some(len)) => OutFraming::Length(len),
            (None, None) => {
                headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
                OutFraming::Chunked
            }
        };
        let expects_continue =
            headers::expects_continue(&headers) && framing != OutFraming::Empty;

        if req.close && !headers::connection_has(&headers, "close") {
            headers.insert(CONNECTION, "close".parse().unwrap());
        }
        if pc.is_proxy {
            if let Some(proxy) = &cm.proxy {
                if let Some(auth) = connect::proxy_auth_header(proxy) {
                    headers.insert(PROXY_AUTHORIZATION, auth);
                }
            }
        }

        let host_header = if !req.host.is_empty() {
            req.host.clone()
        } else {
            authority_host(&req.uri)
        };
        let target = if pc.is_proxy {
            req.uri.to_string()
        } else {
            req.uri
                .path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_else(|| "/".to_owned())
        };

        let mut head = BytesMut::new();
        parse::encode_request_head(
            &req.method,
            &target,
            Version::HTTP_11,
            &host_header,
            &headers,
            &mut head,
        );

        pc.round_trip(RoundTripRequest {
            head: head.freeze(),
            body,
            framing,
            facts: RequestFacts {
                method: req.method.clone(),
                uri: req.uri.clone(),
            },
            requested_gzip,
            expects_continue,
            expect_continue_timeout: self.inner.expect_continue_timeout,
            response_header_timeout: self.inner.response_header_timeout,
            cancel: req.cancel.clone(),
        })
        .await
    }

    fn connect_method(&self, uri: &Uri) -> Result<ConnectMethod> {
        let scheme = uri.scheme_str().unwrap_or("http").to_owned();
        let host = uri.host().unwrap_or_default().to_owned();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let proxy = match &self.inner.proxy {
            Some(selector) => selector(uri)?,
            None => None,
        };
        Ok(ConnectMethod {
            proxy,
            addr: format!("{}:{}", host, port),
            scheme,
            host,
        })
    }

    /// Finds a connection for `cm`: pool first, otherwise a dial raced
    /// against the pool's waiter channel. A request waiting on a dial
    /// takes a connection another request just returned ("late
    /// binding"); the dial, once it lands, is offered back to the pool.
    async fn get_conn(
        &self,
        cm: &ConnectMethod,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<PersistConn>> {
        let key = cm.key();
        if let Some(pc) = self.inner.pool.get_idle(&key) {
            trace!("reusing idle connection for {:?}", key);
            pc.set_reused();
            return Ok(pc);
        }

        let (dial_tx, mut dial_rx) = oneshot::channel();
        {
            let inner = self.inner.clone();
            let cm = cm.clone();
            tokio::spawn(async move {
                let dialed = connect::dial_conn(&inner, &cm).await;
                if let Err(unclaimed) = dial_tx.send(dialed) {
                    // the requester found a connection elsewhere;
                    // hand the dial result to the pool instead
                    if let Ok(pc) = unclaimed {
                        if !inner.pool.put_idle(pc.clone()) {
                            pc.close();
                        }
                    }
                }
            });
        }
        let mut idle_rx = self.inner.pool.waiter(&key);

        tokio::select! {
            dialed = &mut dial_rx => {
                handle_dial(dialed, cancel)
            }
            idle = &mut idle_rx => match idle {
                Ok(pc) => {
                    trace!("late binding: idle connection beat the dial for {:?}", key);
                    pc.set_reused();
                    Ok(pc)
                }
                Err(_) => {
                    // waiter dropped (pool churn); fall back to the dial
                    let dialed = (&mut dial_rx).await;
                    handle_dial(dialed, cancel)
                }
            },
            _ = async { cancel.unwrap().cancelled().await }, if cancel.is_some() => {
                Err(Error::new_canceled_waiting())
            }
        }
    }
}

fn handle_dial(
    dialed: std::result::Result<Result<Arc<PersistConn>>, oneshot::Canceled>,
    cancel: Option<&CancellationToken>,
) -> Result<Arc<PersistConn>> {
    match dialed {
        Ok(Ok(pc)) => Ok(pc),
        Ok(Err(e)) => {
            // context cancellation outranks the dial's own error
            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(Error::new_canceled());
            }
            Err(e)
        }
        Err(_) => Err(Error::new_closed()),
    }
}

impl RoundTripper for Transport {
    fn round_trip(&self, req: Request) -> BoxFuture<'static, Result<Response>> {
        let this = self.clone();
        Box::pin(async move { this.round_trip(req).await })
    }
}

/// The retry rule: only a reused keep-alive connection may trigger a
/// retry, and only for requests that can be replayed safely.
fn should_retry_request(
    req: &Request,
    err: &Error,
    pc: &PersistConn,
    had_body: bool,
) -> bool {
    if !pc.was_reused() {
        // a fresh dial that failed would fail again; surface it
        return false;
    }
    if err.is_nothing_written() {
        return !had_body || req.get_body.is_some();
    }
    if !is_replayable(req) {
        return false;
    }
    if had_body && req.get_body.is_none() {
        return false;
    }
    err.is_server_closed_idle()
}

fn is_replayable(req: &Request) -> bool {
    matches!(
        req.method.as_str(),
        "GET" | "HEAD" | "OPTIONS" | "TRACE" | "PROPFIND" | "SEARCH" | "DELETE" | "PUT"
    ) || req.headers.contains_key("idempotency-key")
        || req.headers.contains_key("x-idempotency-key")
}

fn authority_host(uri: &Uri) -> String {
    match uri.authority() {
        Some(authority) => {
            let s = authority.as_str();
            match s.rsplit_once('@') {
                Some((_, host)) => host.to_owned(),
                None => s.to_owned(),
            }
        }
        None => String::new(),
    }
}

/// Rebuilds a request whose body is replayable, for continuing after an
/// alternate protocol returned the skip sentinel.
fn rebuild_request(req: &Request) -> Option<Request> {
    let body = if let Some(bytes) = req.body.full_bytes() {
        Body::from(bytes)
    } else if let Some(get_body) = &req.get_body {
        get_body().ok()?
    } else {
        return None;
    };
    let mut rebuilt = Request::new(req.method.clone(), req.uri.clone());
    rebuilt.version = req.version;
    rebuilt.headers = req.headers.clone();
    rebuilt.body = body;
    rebuilt.content_length = req.content_length;
    rebuilt.host = req.host.clone();
    rebuilt.close = req.close;
    rebuilt.cancel = req.cancel.clone();
    rebuilt.get_body = req.get_body.clone();
    Some(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method) -> Request {
        Request::new(method, "http://example.com/".parse().unwrap())
    }

    #[test]
    fn replayable_methods() {
        assert!(is_replayable(&request(Method::GET)));
        assert!(is_replayable(&request(Method::HEAD)));
        assert!(is_replayable(&request(Method::DELETE)));
        assert!(!is_replayable(&request(Method::POST)));

        let mut req = request(Method::POST);
        req.headers
            .insert("idempotency-key", "abc".parse().unwrap());
        assert!(is_replayable(&req));
    }

    #[test]
    fn default_user_agent_is_set() {
        assert!(DEFAULT_USER_AGENT.starts_with("trestle/"));
    }

    #[test]
    fn connect_method_keys() {
        let transport = Transport::builder().no_proxy().build();
        let cm = transport
            .connect_method(&"http://example.com:8080/x".parse().unwrap())
            .unwrap();
        assert_eq!(
            cm.key(),
            (
                String::new(),
                "http".to_owned(),
                "example.com:8080".to_owned()
            )
        );
        let cm = transport
            .connect_method(&"https://example.com/".parse().unwrap())
            .unwrap();
        assert_eq!(cm.addr, "example.com:443");
    }
}
