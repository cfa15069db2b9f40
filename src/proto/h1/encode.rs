use std::error::Error as StdError;
use std::fmt;

use bytes::BytesMut;
use http::HeaderMap;
use tracing::trace;

use crate::error::Error;
use crate::headers;

/// Encoders to handle different Transfer-Encodings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq, Clone)]
enum Kind {
    /// An Encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
    /// An Encoder for when Content-Length is set.
    ///
    /// Enforces that the body is not longer than the Content-Length header.
    Length(u64),
    /// An Encoder for when neither Content-Length nor Chunked encoding is set.
    ///
    /// This is mostly only used with HTTP/1.0 responses. This kind requires
    /// the connection to be closed when the body is finished.
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.kind, Kind::Length(0))
    }

    /// Frames `msg` into `dst`. A sized encoder refuses writes past the
    /// declared length without staging any of the overflow.
    pub(crate) fn encode(&mut self, msg: &[u8], dst: &mut BytesMut) -> crate::Result<()> {
        debug_assert!(!msg.is_empty(), "encode() called with empty buf");

        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", msg.len());
                extend_chunk_size(dst, msg.len());
                dst.extend_from_slice(msg);
                dst.extend_from_slice(b"\r\n");
            }
            Kind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", msg.len());
                if msg.len() as u64 > *remaining {
                    return Err(Error::new_content_length_exceeded());
                }
                *remaining -= msg.len() as u64;
                dst.extend_from_slice(msg);
            }
            Kind::CloseDelimited => {
                trace!("close delimited write {}B", msg.len());
                dst.extend_from_slice(msg);
            }
        }
        Ok(())
    }

    /// Terminates the body. Chunked framing emits the zero chunk plus any
    /// trailer fields; a sized body that never reached its declared
    /// length is a write error.
    pub(crate) fn end(&mut self, trailers: Option<&HeaderMap>, dst: &mut BytesMut) -> crate::Result<()> {
        match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked end");
                dst.extend_from_slice(b"0\r\n");
                if let Some(trailers) = trailers {
                    let mut allowed = HeaderMap::new();
                    for (name, value) in trailers.iter() {
                        if headers::forbidden_trailer(name) {
                            tracing::debug!("dropping forbidden trailer field: {}", name);
                            continue;
                        }
                        allowed.append(name.clone(), value.clone());
                    }
                    headers::write_headers_sorted(&allowed, dst);
                }
                dst.extend_from_slice(b"\r\n");
                self.kind = Kind::Length(0);
                Ok(())
            }
            Kind::Length(0) => Ok(()),
            Kind::Length(n) => Err(Error::new_body_write(NotEof(n))),
            Kind::CloseDelimited => Ok(()),
        }
    }
}

fn extend_chunk_size(dst: &mut BytesMut, len: usize) {
    // longest usize in hex is 16 digits
    let mut hex = [0u8; 16];
    let mut pos = hex.len();
    let mut n = len;
    loop {
        pos -= 1;
        hex[pos] = match (n & 0xF) as u8 {
            d @ 0..=9 => b'0' + d,
            d => b'a' + d - 10,
        };
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    dst.extend_from_slice(&hex[pos..]);
    dst.extend_from_slice(b"\r\n");
}

#[derive(Debug)]
struct NotEof(u64);

impl fmt::Display for NotEof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body write aborted with {} bytes remaining", self.0)
    }
}

impl StdError for NotEof {}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    #[test]
    fn chunked_frames_each_write() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();
        encoder.encode(b"foo bar", &mut dst).unwrap();
        encoder.encode(b"baz", &mut dst).unwrap();
        encoder.end(None, &mut dst).unwrap();
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\n3\r\nbaz\r\n0\r\n\r\n" as &[u8]);
    }

    #[test]
    fn chunked_hex_sizes() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();
        let big = vec![b'x'; 0x2a5];
        encoder.encode(&big, &mut dst).unwrap();
        assert!(dst.starts_with(b"2a5\r\n"));
    }

    #[test]
    fn chunked_end_writes_trailers() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();
        encoder.encode(b"hi", &mut dst).unwrap();

        let mut trailers = HeaderMap::new();
        trailers.insert(
            "chunky-trailer".parse::<HeaderName>().unwrap(),
            HeaderValue::from_static("header data"),
        );
        // forbidden keys are silently dropped
        trailers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("2"),
        );
        encoder.end(Some(&trailers), &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"2\r\nhi\r\n0\r\nChunky-Trailer: header data\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn length_enforces_declared_size() {
        let mut encoder = Encoder::length(10);
        let mut dst = BytesMut::new();
        encoder.encode(b"hello ", &mut dst).unwrap();
        let err = encoder.encode(b"world!", &mut dst).unwrap_err();
        assert!(err.is_content_length_exceeded());
        // nothing from the refused write was staged
        assert_eq!(&dst[..], b"hello " as &[u8]);
    }

    #[test]
    fn length_end_short_is_error() {
        let mut encoder = Encoder::length(10);
        let mut dst = BytesMut::new();
        encoder.encode(b"hello", &mut dst).unwrap();
        assert!(encoder.end(None, &mut dst).is_err());

        let mut encoder = Encoder::length(5);
        encoder.encode(b"hello", &mut dst).unwrap();
        assert!(encoder.is_eof());
        encoder.end(None, &mut dst).unwrap();
    }
}
