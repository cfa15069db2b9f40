//! Request-line / status-line / header parsing and head emission.

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use http::{Method, StatusCode, Uri, Version};
use tracing::{debug, trace};

use super::date;
use crate::error::{Error, Parse};
use crate::headers;

const MAX_HEADERS: usize = 100;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BodyLength {
    Known(u64),
    Chunked,
    /// Delimited by connection close; responses only.
    Close,
}

/// Parses one request head out of `buf`, consuming it. `Ok(None)` means
/// more bytes are needed; a head that cannot fit `max` bytes is an error.
pub(crate) fn parse_request(buf: &mut BytesMut, max: usize) -> crate::Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Request.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let mut req = httparse::Request::new(&mut headers);
    let (len, head) = match req.parse(&buf[..])? {
        httparse::Status::Complete(len) => {
            trace!("Request.parse Complete({})", len);
            if len > max {
                return Err(Error::new_too_large());
            }
            let method = Method::from_bytes(req.method.unwrap().as_bytes())
                .map_err(|_| Error::new_parse(Parse::Method))?;
            let version = match req.version.unwrap() {
                0 => Version::HTTP_10,
                1 => Version::HTTP_11,
                _ => return Err(Error::new_parse(Parse::Version)),
            };
            let path = req.path.unwrap();
            let uri = if method == Method::CONNECT {
                // authority-form
                Uri::builder()
                    .authority(path)
                    .build()
                    .map_err(|_| Error::new_parse(Parse::Uri))?
            } else {
                path.parse::<Uri>().map_err(|_| Error::new_parse(Parse::Uri))?
            };
            let headers = collect_headers(req.headers)?;
            (
                len,
                RequestHead {
                    method,
                    uri,
                    version,
                    headers,
                },
            )
        }
        httparse::Status::Partial => {
            return if buf.len() >= max {
                debug!("request head over limit ({} bytes buffered)", buf.len());
                Err(Error::new_too_large())
            } else {
                Ok(None)
            };
        }
    };
    let _ = buf.split_to(len);
    Ok(Some(head))
}

/// Parses one response head out of `buf`, consuming it.
pub(crate) fn parse_response(
    buf: &mut BytesMut,
    max: usize,
) -> crate::Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Response.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let mut res = httparse::Response::new(&mut headers);
    let (len, head) = match res.parse(&buf[..])? {
        httparse::Status::Complete(len) => {
            trace!("Response.parse Complete({})", len);
            if len > max {
                return Err(Error::new_too_large());
            }
            let status = StatusCode::from_u16(res.code.unwrap())
                .map_err(|_| Error::new_parse(Parse::Status))?;
            let reason = match res.reason {
                Some(reason) if Some(reason) != status.canonical_reason() => {
                    Some(reason.to_owned())
                }
                _ => None,
            };
            let version = match res.version.unwrap() {
                0 => Version::HTTP_10,
                1 => Version::HTTP_11,
                _ => return Err(Error::new_parse(Parse::Version)),
            };
            let headers = collect_headers(res.headers)?;
            (
                len,
                ResponseHead {
                    status,
                    reason,
                    version,
                    headers,
                },
            )
        }
        httparse::Status::Partial => {
            return if buf.len() >= max {
                debug!("response head over limit ({} bytes buffered)", buf.len());
                Err(Error::new_too_large())
            } else {
                Ok(None)
            };
        }
    };
    let _ = buf.split_to(len);
    Ok(Some(head))
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        if !headers::is_token(header.name.as_bytes()) {
            return Err(Error::new_parse(Parse::Header));
        }
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Enforces the Host rules: at most one Host header ever; exactly one on
/// HTTP/1.1 unless the method is CONNECT; the value must be syntactically
/// a host. Returns the effective host.
pub(crate) fn validate_host(head: &RequestHead) -> crate::Result<String> {
    let mut hosts = head.headers.get_all(HOST).iter();
    let first = hosts.next();
    if hosts.next().is_some() {
        return Err(Error::new_parse(Parse::Host));
    }
    let is_connect = head.method == Method::CONNECT;
    let host = match first {
        Some(value) => {
            let host = value
                .to_str()
                .map_err(|_| Error::new_parse(Parse::Host))?
                .trim()
                .to_owned();
            if !host.is_empty() && !headers::valid_host(&host) {
                return Err(Error::new_parse(Parse::Host));
            }
            host
        }
        None => String::new(),
    };
    if host.is_empty() {
        if is_connect {
            if let Some(authority) = head.uri.authority() {
                return Ok(authority.to_string());
            }
        }
        if head.version >= Version::HTTP_11 {
            return Err(Error::new_parse(Parse::Host));
        }
    }
    Ok(host)
}

/// RFC 7230 §3.3.3 for requests:
/// chunked has a chunked body; a non-chunked Transfer-Encoding is
/// malformed; differing repeated Content-Lengths are malformed; a
/// missing length means no body.
pub(crate) fn request_body_length(head: &RequestHead) -> crate::Result<(BodyLength, Vec<String>)> {
    let te = headers::transfer_encoding(&head.headers);
    if !te.is_empty() {
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 request has Transfer-Encoding header");
            return Err(Error::new_parse(Parse::Header));
        }
        if headers::is_chunked(&te) {
            return Ok((BodyLength::Chunked, te));
        }
        debug!("request with transfer-encoding header, but not chunked, bad request");
        return Err(Error::new_parse(Parse::Header));
    }
    let len = headers::content_length(&head.headers)?.unwrap_or(0);
    Ok((BodyLength::Known(len), te))
}

/// RFC 7230 §3.3.3 for responses, given the request method.
pub(crate) fn response_body_length(
    method: &Method,
    head: &ResponseHead,
) -> crate::Result<(BodyLength, Vec<String>)> {
    let status = head.status;
    let te = headers::transfer_encoding(&head.headers);

    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok((BodyLength::Known(0), te));
    }
    if method == Method::HEAD {
        return Ok((BodyLength::Known(0), te));
    }
    if method == Method::CONNECT && status.is_success() {
        return Ok((BodyLength::Known(0), te));
    }

    if !te.is_empty() {
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 response has Transfer-Encoding header");
            return Err(Error::new_parse(Parse::Header));
        }
        if headers::is_chunked(&te) {
            return Ok((BodyLength::Chunked, te));
        }
        trace!("not chunked, read till eof");
        return Ok((BodyLength::Close, te));
    }
    match headers::content_length(&head.headers)? {
        Some(len) => Ok((BodyLength::Known(len), te)),
        None => {
            trace!("neither Transfer-Encoding nor Content-Length");
            Ok((BodyLength::Close, te))
        }
    }
}

fn extend_version(dst: &mut BytesMut, version: Version) {
    dst.extend_from_slice(match version {
        Version::HTTP_10 => b"HTTP/1.0",
        _ => b"HTTP/1.1",
    });
}

/// Writes a request line plus headers. The Host line leads, the rest is
/// sorted stably by canonical key.
pub(crate) fn encode_request_head(
    method: &Method,
    target: &str,
    version: Version,
    host: &str,
    headers: &HeaderMap,
    dst: &mut BytesMut,
) {
    dst.reserve(64 + headers.len() * 30);
    dst.extend_from_slice(method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" ");
    extend_version(dst, version);
    dst.extend_from_slice(b"\r\n");
    if !host.is_empty() {
        dst.extend_from_slice(b"Host: ");
        dst.extend_from_slice(host.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    headers::write_headers_sorted(headers, dst);
    dst.extend_from_slice(b"\r\n");
}

/// Writes a status line plus headers, appending a Date header when the
/// map carries none.
pub(crate) fn encode_response_head(
    status: StatusCode,
    reason: Option<&str>,
    version: Version,
    headers: &HeaderMap,
    dst: &mut BytesMut,
) {
    dst.reserve(64 + headers.len() * 30);
    extend_version(dst, version);
    dst.extend_from_slice(b" ");
    let mut code = itoa::Buffer::new();
    dst.extend_from_slice(code.format(status.as_u16()).as_bytes());
    dst.extend_from_slice(b" ");
    let reason = reason.or_else(|| status.canonical_reason()).unwrap_or("");
    dst.extend_from_slice(reason.as_bytes());
    dst.extend_from_slice(b"\r\n");
    headers::write_headers_sorted(headers, dst);
    if !headers.contains_key(http::header::DATE) {
        dst.extend_from_slice(b"Date: ");
        date::extend(dst);
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}
