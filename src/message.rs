//! The request/response data model.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;

use crate::body::Body;
use crate::net::TlsState;

/// Replays a request body for an idempotent retry.
pub type GetBody = Arc<dyn Fn() -> crate::Result<Body> + Send + Sync>;

/// An HTTP request, as received by a server handler or built for the
/// client transport.
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    /// Declared body length; `-1` means unknown.
    pub content_length: i64,
    /// Transfer codings applied to the body, outermost first.
    pub transfer_encoding: Vec<String>,
    /// The effective host (Host header, or the CONNECT authority).
    pub host: String,
    /// Peer address; present on server-received requests.
    pub remote_addr: Option<SocketAddr>,
    /// TLS state of the receiving connection, if any.
    pub tls: Option<TlsState>,
    /// Whether the connection must close after this exchange.
    pub close: bool,
    /// Client-side: cancels this request wherever it is in flight.
    pub cancel: Option<CancellationToken>,
    /// Client-side: recreates the body so the transport may retry an
    /// idempotent request on a fresh connection.
    pub get_body: Option<GetBody>,
    pub(crate) context: CancellationToken,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Request {
        Request {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::empty(),
            content_length: -1,
            transfer_encoding: Vec::new(),
            host: String::new(),
            remote_addr: None,
            tls: None,
            close: false,
            cancel: None,
            get_body: None,
            context: CancellationToken::new(),
        }
    }

    pub fn get(uri: &str) -> crate::Result<Request> {
        Ok(Request::new(Method::GET, parse_uri(uri)?))
    }

    pub fn head(uri: &str) -> crate::Result<Request> {
        Ok(Request::new(Method::HEAD, parse_uri(uri)?))
    }

    pub fn post(uri: &str, body: Body) -> crate::Result<Request> {
        let mut req = Request::new(Method::POST, parse_uri(uri)?);
        req.body = body;
        Ok(req)
    }

    pub fn put(uri: &str, body: Body) -> crate::Result<Request> {
        let mut req = Request::new(Method::PUT, parse_uri(uri)?);
        req.body = body;
        Ok(req)
    }

    /// The per-request context. The server cancels it when the handler
    /// returns, the client disconnects, or the connection is hijacked.
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Trailer keys this message declared up front via the `Trailer`
    /// header, forbidden keys excluded.
    pub fn declared_trailers(&self) -> Vec<http::header::HeaderName> {
        crate::headers::declared_trailers(&self.headers)
    }

    /// Trailer fields received after the body reached EOF.
    pub fn trailer(&self) -> HeaderMap {
        self.body.trailers().unwrap_or_default()
    }

    pub(crate) fn with_context(mut self, context: CancellationToken) -> Request {
        self.context = context;
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}

fn parse_uri(uri: &str) -> crate::Result<Uri> {
    uri.parse::<Uri>()
        .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))
}

/// The request facts a response carries back to its caller.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: Method,
    pub uri: Uri,
}

/// An HTTP response.
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase, kept only when it differs from the canonical one.
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    /// Always present; an empty sentinel when the message has no body.
    pub body: Body,
    /// Declared body length; `-1` means unknown.
    pub content_length: i64,
    pub transfer_encoding: Vec<String>,
    /// Whether the connection will close after this response.
    pub close: bool,
    /// Set when the transport transparently decompressed the body.
    pub uncompressed: bool,
    /// TLS state of the connection the response arrived on, if any.
    pub tls: Option<TlsState>,
    pub request: RequestFacts,
}

impl Response {
    /// Trailer fields received after the body reached EOF.
    pub fn trailer(&self) -> HeaderMap {
        self.body.trailers().unwrap_or_default()
    }

    /// The `Location` header resolved against the request URI, for
    /// following redirects.
    pub fn location(&self) -> crate::Result<Uri> {
        let raw = self
            .headers
            .get(http::header::LOCATION)
            .ok_or_else(crate::Error::new_missing_location)?;
        let raw = raw
            .to_str()
            .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))?;
        let location = raw
            .parse::<Uri>()
            .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))?;
        if location.scheme().is_some() {
            return Ok(location);
        }
        // relative: graft onto the request URI
        let mut parts = http::uri::Parts::from(self.request.uri.clone());
        parts.path_and_query = location.path_and_query().cloned();
        Uri::from_parts(parts).map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish()
    }
}
