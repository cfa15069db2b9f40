//! Header-map utilities shared by the parser, the encoder, and both
//! connection roles: canonical (title-case) rendering, token checks,
//! Connection-option scanning, and the length rules of RFC 7230 §3.3.3.

use bytes::{BufMut, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRAILER, TRANSFER_ENCODING};
use http::Version;

use crate::error::{Error, Parse};

macro_rules! byte_map {
    ($($flag:expr,)*) => ([
        $($flag != 0,)*
    ])
}

/// Valid header/method token bytes per RFC 7230 §3.2.6.
#[rustfmt::skip]
const TOKEN_MAP: [bool; 256] = byte_map![
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 1, 0, 1, 1, 1, 1, 1, 0, 0, 1, 1, 0, 1, 1, 0,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0,
    0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 1, 0, 1, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[inline]
pub(crate) fn is_token_byte(b: u8) -> bool {
    TOKEN_MAP[b as usize]
}

pub(crate) fn is_token(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(|&b| is_token_byte(b))
}

/// Appends `name` in canonical form: first letter and every letter after
/// a hyphen uppercased, the rest lowercased. Non-token names would not
/// have survived parsing, so no escape hatch is needed here.
pub(crate) fn title_case(dst: &mut BytesMut, name: &[u8]) {
    dst.reserve(name.len());
    let mut at_start = true;
    for &b in name {
        if at_start && b.is_ascii_lowercase() {
            dst.put_u8(b.to_ascii_uppercase());
        } else if !at_start && b.is_ascii_uppercase() {
            dst.put_u8(b.to_ascii_lowercase());
        } else {
            dst.put_u8(b);
        }
        at_start = b == b'-';
    }
}

/// Writes `headers` as wire lines, title-cased, sorted stably by
/// canonical key, values of one key kept in insertion order.
pub(crate) fn write_headers_sorted(headers: &HeaderMap, dst: &mut BytesMut) {
    let mut lines: Vec<(&HeaderName, &HeaderValue)> = Vec::with_capacity(headers.len());
    for name in headers.keys() {
        for value in headers.get_all(name) {
            lines.push((name, value));
        }
    }
    // HeaderName renders lowercase, so byte order is canonical-key order.
    lines.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    for (name, value) in lines {
        title_case(dst, name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// Scans every `Connection` header value for a comma-separated option,
/// case-insensitively.
pub(crate) fn connection_has(headers: &HeaderMap, option: &str) -> bool {
    for value in headers.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            if s.split(',').any(|opt| opt.trim().eq_ignore_ascii_case(option)) {
                return true;
            }
        }
    }
    false
}

/// The keep-alive rule: HTTP/1.0 closes unless `Connection: keep-alive`,
/// HTTP/1.1+ closes only on `Connection: close`.
pub(crate) fn should_close(version: Version, headers: &HeaderMap) -> bool {
    if version == Version::HTTP_10 {
        !connection_has(headers, "keep-alive")
    } else {
        connection_has(headers, "close")
    }
}

pub(crate) fn expects_continue(headers: &HeaderMap) -> bool {
    match headers.get(EXPECT) {
        Some(v) => v.as_bytes().eq_ignore_ascii_case(b"100-continue"),
        None => false,
    }
}

/// Effective Content-Length across possibly repeated headers. Repeats
/// must agree after trimming; disagreement or junk is a hard error.
pub(crate) fn content_length(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let s = value
            .to_str()
            .map_err(|_| Error::new_parse(Parse::ContentLength))?
            .trim();
        let n: u64 = s
            .parse()
            .map_err(|_| Error::new_parse(Parse::ContentLength))?;
        match seen {
            Some(prev) if prev != n => return Err(Error::new_parse(Parse::ContentLength)),
            _ => seen = Some(n),
        }
    }
    Ok(seen)
}

/// Transfer-Encoding values, lowercased, in declaration order.
pub(crate) fn transfer_encoding(headers: &HeaderMap) -> Vec<String> {
    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        if let Ok(s) = value.to_str() {
            for coding in s.split(',') {
                let coding = coding.trim();
                if !coding.is_empty() {
                    codings.push(coding.to_ascii_lowercase());
                }
            }
        }
    }
    codings
}

pub(crate) fn is_chunked(codings: &[String]) -> bool {
    codings.last().map(|c| c == "chunked").unwrap_or(false)
}

/// Syntactic Host check: RFC 3986 reg-name / IP-literal, at most one
/// numeric port, nothing that could smuggle a request line.
pub(crate) fn valid_host(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let (name, port) = match split_host_port(host) {
        Some(parts) => parts,
        None => return false,
    };
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    if name.starts_with('[') {
        // IPv6 literal
        if !name.ends_with(']') {
            return false;
        }
        return name[1..name.len() - 1]
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.' || b == b'%');
    }
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(b, b'-' | b'.' | b'_' | b'~' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' | b'%')
        })
}

/// Splits `host[:port]`, keeping IPv6 literals whole.
pub(crate) fn split_host_port(host: &str) -> Option<(&str, Option<&str>)> {
    if host.starts_with('[') {
        let close = host.find(']')?;
        let rest = &host[close + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?;
        return Some((&host[..close + 1], Some(port)));
    }
    match host.rfind(':') {
        Some(i) if !host[..i].contains(':') => Some((&host[..i], Some(&host[i + 1..]))),
        Some(_) => None, // bare IPv6 without brackets is not a valid Host
        None => Some((host, None)),
    }
}

/// Header names that may never appear in a trailer block.
pub(crate) fn forbidden_trailer(name: &HeaderName) -> bool {
    matches!(*name, TRANSFER_ENCODING | CONTENT_LENGTH | TRAILER)
}

/// Trailer keys a message declared up front via the `Trailer` header.
pub(crate) fn declared_trailers(headers: &HeaderMap) -> Vec<HeaderName> {
    let mut names = Vec::new();
    for value in headers.get_all(TRAILER) {
        if let Ok(s) = value.to_str() {
            for key in s.split(',') {
                if let Ok(name) = key.trim().parse::<HeaderName>() {
                    if !forbidden_trailer(&name) {
                        names.push(name);
                    }
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                k.parse::<HeaderName>().unwrap(),
                v.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_title_case() {
        let cases: &[(&str, &str)] = &[
            ("content-length", "Content-Length"),
            ("x-ss-00-test", "X-Ss-00-Test"),
            ("host", "Host"),
            ("sec-websocket-key", "Sec-Websocket-Key"),
        ];
        for (input, expected) in cases {
            let mut dst = BytesMut::new();
            title_case(&mut dst, input.as_bytes());
            assert_eq!(&dst[..], expected.as_bytes());
        }
    }

    #[test]
    fn test_write_headers_sorted() {
        let map = headers(&[
            ("x-b", "2"),
            ("a-header", "1"),
            ("x-b", "3"),
        ]);
        let mut dst = BytesMut::new();
        write_headers_sorted(&map, &mut dst);
        assert_eq!(&dst[..], b"A-Header: 1\r\nX-B: 2\r\nX-B: 3\r\n" as &[u8]);
    }

    #[test]
    fn test_should_close() {
        let empty = HeaderMap::new();
        assert!(should_close(Version::HTTP_10, &empty));
        assert!(!should_close(Version::HTTP_11, &empty));

        let ka = headers(&[("connection", "Keep-Alive")]);
        assert!(!should_close(Version::HTTP_10, &ka));

        let close = headers(&[("connection", "foo, Close")]);
        assert!(should_close(Version::HTTP_11, &close));
    }

    #[test]
    fn test_content_length_duplicates() {
        let same = headers(&[("content-length", "5"), ("content-length", " 5")]);
        assert_eq!(content_length(&same).unwrap(), Some(5));

        let differ = headers(&[("content-length", "10"), ("content-length", "11")]);
        assert!(content_length(&differ).is_err());

        let junk = headers(&[("content-length", "5x")]);
        assert!(junk.len() == 1 && content_length(&junk).is_err());
    }

    #[test]
    fn test_transfer_encoding_chunked() {
        let te = headers(&[("transfer-encoding", "gzip, Chunked")]);
        let codings = transfer_encoding(&te);
        assert_eq!(codings, vec!["gzip".to_string(), "chunked".to_string()]);
        assert!(is_chunked(&codings));

        let not_final = vec!["chunked".to_string(), "gzip".to_string()];
        assert!(!is_chunked(&not_final));
    }

    #[test]
    fn test_valid_host() {
        assert!(valid_host("example.com"));
        assert!(valid_host("example.com:8080"));
        assert!(valid_host("[::1]:443"));
        assert!(valid_host("127.0.0.1"));
        assert!(!valid_host(""));
        assert!(!valid_host("exa mple.com"));
        assert!(!valid_host("example.com:80x"));
        assert!(!valid_host("::1"));
    }
}
