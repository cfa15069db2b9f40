use std::error::Error as StdError;
use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace};

use super::io::ReadSide;
use crate::headers;

/// Maximum length of the chunk-size line, hex digits and extensions
/// included. Longer lines fail the message.
const CHUNK_LINE_LIMIT: u64 = 4096;

/// Maximum number of bytes allowed for all trailer fields, bounded by
/// the read buffer a peer can reasonably stage them in.
const TRAILER_LIMIT: usize = 4096;

const TRAILER_MAX_COUNT: usize = 32;

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Clone, Debug, PartialEq)]
enum Kind {
    /// A Reader used when a Content-Length header is passed with a positive integer.
    Length(u64),
    /// A Reader used when Transfer-Encoding is `chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        line_len: u64,
        trailers_buf: Option<BytesMut>,
    },
    /// A Reader used for responses that don't indicate a length or chunked.
    ///
    /// The bool tracks when EOF is seen on the transport. Only valid for
    /// responses: a request without length information has no body.
    Eof(bool),
}

/// One step of decoded body.
#[derive(Debug)]
pub(crate) enum Decoded {
    Data(Bytes),
    Trailers(HeaderMap),
    Eof,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                line_len: 0,
                trailers_buf: None,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Kind::Length(0)
                | Kind::Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | Kind::Eof(true)
        )
    }

    pub(crate) async fn decode(&mut self, rdr: &mut ReadSide) -> io::Result<Decoded> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Eof);
                }
                let to_read = (*remaining).min(8192) as usize;
                let buf = rdr.read_mem(to_read).await?;
                if buf.is_empty() {
                    *remaining = 0;
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
                }
                *remaining -= buf.len() as u64;
                Ok(Decoded::Data(buf))
            }
            Kind::Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut line_len,
                ref mut trailers_buf,
            } => {
                loop {
                    if *state == ChunkedState::End {
                        if let Some(mut raw) = trailers_buf.take() {
                            trace!("found possible trailers");
                            return decode_trailers(&mut raw).map(Decoded::Trailers);
                        }
                        trace!("end of chunked");
                        return Ok(Decoded::Eof);
                    }
                    let mut buf = None;
                    // advances the chunked state
                    *state = state
                        .step(rdr, chunk_len, line_len, &mut buf, trailers_buf)
                        .await?;
                    if let Some(buf) = buf {
                        return Ok(Decoded::Data(buf));
                    }
                }
            }
            Kind::Eof(ref mut is_eof) => {
                if *is_eof {
                    return Ok(Decoded::Eof);
                }
                let slice = rdr.read_mem(8192).await?;
                if slice.is_empty() {
                    *is_eof = true;
                    Ok(Decoded::Eof)
                } else {
                    Ok(Decoded::Data(slice))
                }
            }
        }
    }
}

macro_rules! byte {
    ($rdr:ident) => {{
        let buf = $rdr.read_mem(1).await?;
        if !buf.is_empty() {
            buf[0]
        } else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF during chunk size line",
            ));
        }
    }};
}

macro_rules! or_overflow {
    ($e:expr) => {
        match $e {
            Some(val) => val,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid chunk size: overflow",
                ))
            }
        }
    };
}

macro_rules! put_trailer_u8 {
    ($trailers_buf:expr, $byte:expr) => {
        $trailers_buf.put_u8($byte);

        if $trailers_buf.len() >= TRAILER_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk trailers bytes over limit",
            ));
        }
    };
}

macro_rules! count_line_byte {
    ($line_len:expr) => {
        *$line_len += 1;
        if *$line_len >= CHUNK_LINE_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk size line over limit",
            ));
        }
    };
}

impl ChunkedState {
    async fn step(
        self,
        rdr: &mut ReadSide,
        size: &mut u64,
        line_len: &mut u64,
        buf: &mut Option<Bytes>,
        trailers_buf: &mut Option<BytesMut>,
    ) -> io::Result<ChunkedState> {
        use self::ChunkedState::*;
        match self {
            Start => ChunkedState::read_start(rdr, size, line_len).await,
            Size => ChunkedState::read_size(rdr, size, line_len).await,
            SizeLws => ChunkedState::read_size_lws(rdr, line_len).await,
            Extension => ChunkedState::read_extension(rdr, line_len).await,
            SizeLf => ChunkedState::read_size_lf(rdr, *size, line_len).await,
            Body => ChunkedState::read_body(rdr, size, buf).await,
            BodyCr => ChunkedState::read_body_cr(rdr).await,
            BodyLf => ChunkedState::read_body_lf(rdr).await,
            Trailer => ChunkedState::read_trailer(rdr, trailers_buf).await,
            TrailerLf => ChunkedState::read_trailer_lf(rdr, trailers_buf).await,
            EndCr => ChunkedState::read_end_cr(rdr, trailers_buf).await,
            EndLf => ChunkedState::read_end_lf(rdr, trailers_buf).await,
            End => Ok(End),
        }
    }

    async fn read_start(
        rdr: &mut ReadSide,
        size: &mut u64,
        line_len: &mut u64,
    ) -> io::Result<ChunkedState> {
        trace!("Read chunk start");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: missing size digit",
                ));
            }
        }
        count_line_byte!(line_len);

        Ok(ChunkedState::Size)
    }

    async fn read_size(
        rdr: &mut ReadSide,
        size: &mut u64,
        line_len: &mut u64,
    ) -> io::Result<ChunkedState> {
        trace!("Read chunk hex size");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(ChunkedState::SizeLws),
            b';' => return Ok(ChunkedState::Extension),
            b'\r' => return Ok(ChunkedState::SizeLf),
            b'\n' => {
                // bare LF tolerated on input
                *line_len = 0;
                return Ok(ChunkedState::size_lf_reached(*size));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: Invalid Size",
                ));
            }
        }
        count_line_byte!(line_len);
        Ok(ChunkedState::Size)
    }

    async fn read_size_lws(rdr: &mut ReadSide, line_len: &mut u64) -> io::Result<ChunkedState> {
        trace!("read_size_lws");
        match byte!(rdr) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => {
                count_line_byte!(line_len);
                Ok(ChunkedState::SizeLws)
            }
            b';' => {
                count_line_byte!(line_len);
                Ok(ChunkedState::Extension)
            }
            b'\r' => Ok(ChunkedState::SizeLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size linear white space",
            )),
        }
    }

    async fn read_extension(rdr: &mut ReadSide, line_len: &mut u64) -> io::Result<ChunkedState> {
        trace!("read_extension");
        // Chunk extensions are discarded. They "end" at the next CRLF;
        // some implementations skip the CR check, so a bare LF inside an
        // extension is rejected rather than silently accepted.
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::SizeLf),
            b'\n' => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk extension contains newline",
            )),
            _ => {
                count_line_byte!(line_len);
                Ok(ChunkedState::Extension)
            }
        }
    }

    async fn read_size_lf(
        rdr: &mut ReadSide,
        size: u64,
        line_len: &mut u64,
    ) -> io::Result<ChunkedState> {
        trace!("Chunk size is {:?}", size);
        match byte!(rdr) {
            b'\n' => {
                *line_len = 0;
                Ok(ChunkedState::size_lf_reached(size))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size LF",
            )),
        }
    }

    fn size_lf_reached(size: u64) -> ChunkedState {
        if size == 0 {
            ChunkedState::EndCr
        } else {
            debug!("incoming chunked header: {0:#X} ({0} bytes)", size);
            ChunkedState::Body
        }
    }

    async fn read_body(
        rdr: &mut ReadSide,
        rem: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> io::Result<ChunkedState> {
        trace!("Chunked read, remaining={:?}", rem);

        // cap remaining bytes at the max capacity of usize
        let rem_cap = match *rem {
            r if r > usize::MAX as u64 => usize::MAX,
            r => r as usize,
        };

        let slice = rdr.read_mem(rem_cap).await?;
        let count = slice.len();

        if count == 0 {
            *rem = 0;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
        }
        *buf = Some(slice);
        *rem -= count as u64;

        if *rem > 0 {
            Ok(ChunkedState::Body)
        } else {
            Ok(ChunkedState::BodyCr)
        }
    }

    async fn read_body_cr(rdr: &mut ReadSide) -> io::Result<ChunkedState> {
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::BodyLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body CR",
            )),
        }
    }

    async fn read_body_lf(rdr: &mut ReadSide) -> io::Result<ChunkedState> {
        match byte!(rdr) {
            b'\n' => Ok(ChunkedState::Start),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body LF",
            )),
        }
    }

    async fn read_trailer(
        rdr: &mut ReadSide,
        trailers_buf: &mut Option<BytesMut>,
    ) -> io::Result<ChunkedState> {
        trace!("read_trailer");
        let byte = byte!(rdr);
        put_trailer_u8!(trailers_buf.as_mut().expect("trailers_buf is None"), byte);

        match byte {
            b'\r' => Ok(ChunkedState::TrailerLf),
            _ => Ok(ChunkedState::Trailer),
        }
    }

    async fn read_trailer_lf(
        rdr: &mut ReadSide,
        trailers_buf: &mut Option<BytesMut>,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\n' => {
                put_trailer_u8!(trailers_buf.as_mut().expect("trailers_buf is None"), byte);
                Ok(ChunkedState::EndCr)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid trailer end LF",
            )),
        }
    }

    async fn read_end_cr(
        rdr: &mut ReadSide,
        trailers_buf: &mut Option<BytesMut>,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\r' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_trailer_u8!(trailers_buf, byte);
                }
                Ok(ChunkedState::EndLf)
            }
            byte => {
                match trailers_buf {
                    None => {
                        // 64 will fit a single short trailer without reallocating
                        let mut buf = BytesMut::with_capacity(64);
                        buf.put_u8(byte);
                        *trailers_buf = Some(buf);
                    }
                    Some(ref mut trailers_buf) => {
                        put_trailer_u8!(trailers_buf, byte);
                    }
                }

                Ok(ChunkedState::Trailer)
            }
        }
    }

    async fn read_end_lf(
        rdr: &mut ReadSide,
        trailers_buf: &mut Option<BytesMut>,
    ) -> io::Result<ChunkedState> {
        let byte = byte!(rdr);
        match byte {
            b'\n' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_trailer_u8!(trailers_buf, byte);
                }
                Ok(ChunkedState::End)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk end LF",
            )),
        }
    }
}

fn decode_trailers(buf: &mut BytesMut) -> io::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    let mut parsed = [httparse::EMPTY_HEADER; TRAILER_MAX_COUNT];
    match httparse::parse_headers(buf, &mut parsed) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            for header in parsed.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid trailer name: {:?}", header.name),
                    )
                })?;
                if headers::forbidden_trailer(&name) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("forbidden trailer field: {}", name),
                    ));
                }
                let value = HeaderValue::from_bytes(header.value).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid trailer value: {:?}", header.value),
                    )
                })?;
                trailers.append(name, value);
            }
            Ok(trailers)
        }
        Ok(httparse::Status::Partial) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "partial trailer block",
        )),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
    }
}

#[derive(Debug)]
pub(crate) struct IncompleteBody;

impl fmt::Display for IncompleteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "end of file before message length reached")
    }
}

impl StdError for IncompleteBody {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::io::tests::{read_side_of, read_side_of_mock};

    async fn drain(decoder: &mut Decoder, rdr: &mut ReadSide) -> (Vec<u8>, Option<HeaderMap>) {
        let mut body = Vec::new();
        let mut trailers = None;
        loop {
            match decoder.decode(rdr).await.expect("decode") {
                Decoded::Data(b) => body.extend_from_slice(&b),
                Decoded::Trailers(t) => trailers = Some(t),
                Decoded::Eof => return (body, trailers),
            }
        }
    }

    #[tokio::test]
    async fn test_decode_length() {
        let mut rdr = read_side_of(b"hello unlimited").await;
        let mut decoder = Decoder::length(5);
        let (body, trailers) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"hello");
        assert!(trailers.is_none());
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn test_decode_length_early_eof() {
        let mock = tokio_test::io::Builder::new().read(b"foo bar").build();
        let mut rdr = read_side_of_mock(mock);
        let mut decoder = Decoder::length(10);
        match decoder.decode(&mut rdr).await.expect("first read") {
            Decoded::Data(data) => assert_eq!(&data[..], b"foo bar"),
            other => panic!("expected data, got {:?}", other),
        }
        let err = decoder.decode(&mut rdr).await.expect_err("early eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_decode_chunked_split_reads() {
        // chunk framing arriving one socket read at a time, split mid
        // size-line and mid payload
        let mock = tokio_test::io::Builder::new()
            .read(b"4")
            .read(b"\r\nda")
            .read(b"ta\r\n")
            .read(b"0\r\n")
            .read(b"\r\n")
            .build();
        let mut rdr = read_side_of_mock(mock);
        let mut decoder = Decoder::chunked();
        let (body, trailers) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"data");
        assert!(trailers.is_none());
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn test_decode_eof_mode() {
        let mut rdr = read_side_of(b"everything until close").await;
        let mut decoder = Decoder::eof();
        let (body, _) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"everything until close");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn test_decode_chunked() {
        let mut rdr = read_side_of(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\nGET /next").await;
        let mut decoder = Decoder::chunked();
        let (body, trailers) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"foobar");
        assert!(trailers.is_none());
        // bytes past the terminator stay buffered for the next message
        assert_eq!(&rdr.buffer()[..], b"GET /next");
    }

    #[tokio::test]
    async fn test_decode_chunked_trailers() {
        let mut rdr =
            read_side_of(b"3\r\nfoo\r\n3\r\nbar\r\n0\r\nTrailer-Key: Trailer-Value\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let (body, trailers) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"foobar");
        let trailers = trailers.expect("trailers");
        assert_eq!(trailers["trailer-key"], "Trailer-Value");
    }

    #[tokio::test]
    async fn test_decode_chunked_extension_discarded() {
        let mut rdr = read_side_of(b"3;name=value\r\nfoo\r\n0\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let (body, _) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"foo");
    }

    #[tokio::test]
    async fn test_decode_chunked_forbidden_trailer() {
        let mut rdr = read_side_of(b"3\r\nfoo\r\n0\r\nContent-Length: 3\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        loop {
            match decoder.decode(&mut rdr).await {
                Ok(Decoded::Data(_)) => continue,
                Ok(other) => panic!("expected trailer rejection, got {:?}", other),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::InvalidData);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_decode_chunked_size_line_too_long() {
        let mut data = b"3;".to_vec();
        data.extend(std::iter::repeat(b'x').take(CHUNK_LINE_LIMIT as usize + 16));
        data.extend_from_slice(b"\r\nfoo\r\n0\r\n\r\n");
        let mut rdr = read_side_of(&data).await;
        let mut decoder = Decoder::chunked();
        let err = loop {
            match decoder.decode(&mut rdr).await {
                Ok(Decoded::Data(_)) => continue,
                Ok(other) => panic!("expected line-limit error, got {:?}", other),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_decode_chunked_bare_lf_size_line() {
        // bare LF after the size digits is tolerated on input
        let mut rdr = read_side_of(b"3\nfoo\r\n0\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let (body, _) = drain(&mut decoder, &mut rdr).await;
        assert_eq!(body, b"foo");
    }
}
