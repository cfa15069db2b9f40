//! Streaming message bodies.
//!
//! One type covers every body the transport touches: buffered outgoing
//! payloads, user-supplied streaming readers, and incoming bodies wired
//! straight to a connection's read side through a [`Decoder`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::client::gzip::Gunzip;
use crate::error::Error;
use crate::proto::h1::{Decoded, Decoder, ReadSide, WriteSide};

/// How much of an unread request body a server connection will drain
/// after the handler finished, to keep the connection reusable.
pub(crate) const MAX_POST_HANDLER_READ_BYTES: u64 = 256 << 10;

/// A streaming message body.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Wired(Wired),
    Decompress {
        shared: Arc<AsyncMutex<WiredState>>,
        gunzip: Gunzip,
        done: bool,
    },
    Closed,
}

impl Body {
    /// An empty body, read as immediate EOF.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A streaming body that reads chunks from `reader` until EOF.
    pub fn reader<R>(reader: R) -> Body
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Body {
            kind: Kind::Reader(Box::new(reader)),
        }
    }

    pub(crate) fn wired(shared: Arc<AsyncMutex<WiredState>>) -> Body {
        Body {
            kind: Kind::Wired(Wired { shared }),
        }
    }

    /// Wraps a connection-wired body in a streaming gzip decompressor.
    /// Bodies that are not wired pass through unchanged.
    pub(crate) fn decompress(inner: Body) -> Body {
        match inner.kind {
            Kind::Wired(wired) => Body {
                kind: Kind::Decompress {
                    shared: wired.shared,
                    gunzip: Gunzip::new(),
                    done: false,
                },
            },
            _ => inner,
        }
    }

    /// The byte length, when the body is buffered and knowable up front.
    pub(crate) fn size_hint(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty | Kind::Closed => Some(0),
            Kind::Full(ref chunk) => Some(chunk.as_ref().map(|b| b.len() as u64).unwrap_or(0)),
            _ => None,
        }
    }

    /// The buffered payload, when there is one. Used to derive replay
    /// factories for idempotent retries.
    pub(crate) fn full_bytes(&self) -> Option<Bytes> {
        match self.kind {
            Kind::Empty => Some(Bytes::new()),
            Kind::Full(ref chunk) => Some(chunk.clone().unwrap_or_else(Bytes::new)),
            _ => None,
        }
    }

    /// Pulls the next chunk of the body. `None` is EOF; EOF is observed
    /// exactly once, after which this keeps returning `None` until the
    /// body is closed.
    pub async fn data(&mut self) -> Option<crate::Result<Bytes>> {
        match self.kind {
            Kind::Empty => None,
            Kind::Closed => Some(Err(Error::new_read_after_close())),
            Kind::Full(ref mut chunk) => match chunk.take() {
                Some(bytes) if !bytes.is_empty() => Some(Ok(bytes)),
                _ => None,
            },
            Kind::Reader(ref mut reader) => {
                let mut chunk = BytesMut::with_capacity(8192);
                match reader.read_buf(&mut chunk).await {
                    Ok(0) => None,
                    Ok(_) => Some(Ok(chunk.freeze())),
                    Err(e) => Some(Err(Error::new_user_body(e))),
                }
            }
            Kind::Wired(ref wired) => {
                let mut state = wired.shared.lock().await;
                state.next_chunk().await
            }
            Kind::Decompress {
                ref shared,
                ref mut gunzip,
                ref mut done,
            } => loop {
                if let Some(out) = gunzip.take_output() {
                    return Some(Ok(out));
                }
                if *done {
                    return None;
                }
                let chunk = {
                    let mut state = shared.lock().await;
                    state.next_chunk().await
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        if let Err(e) = gunzip.feed(&chunk) {
                            *done = true;
                            return Some(Err(Error::new_body(e)));
                        }
                    }
                    Some(Err(e)) => {
                        *done = true;
                        return Some(Err(e));
                    }
                    None => {
                        *done = true;
                        if let Err(e) = gunzip.finish() {
                            return Some(Err(Error::new_body(e)));
                        }
                    }
                }
            },
        }
    }

    /// Reads the remainder of the body into one buffer.
    pub async fn read_to_end(&mut self) -> crate::Result<Bytes> {
        let mut all = BytesMut::new();
        while let Some(chunk) = self.data().await {
            all.extend_from_slice(&chunk?);
        }
        Ok(all.freeze())
    }

    /// Trailer fields received after EOF of a chunked body.
    pub fn trailers(&self) -> Option<HeaderMap> {
        match self.kind {
            Kind::Wired(ref wired) => trailers_of(&wired.shared),
            Kind::Decompress { ref shared, .. } => trailers_of(shared),
            _ => None,
        }
    }

    /// Closes the body. Closing after EOF is a no-op; reads after close
    /// fail with a fixed error. A server-side body drains up to
    /// [`MAX_POST_HANDLER_READ_BYTES`] to keep the connection reusable;
    /// a client-side body drains fully.
    pub async fn close(&mut self) -> crate::Result<()> {
        match self.kind {
            Kind::Wired(ref wired) => close_wired(&wired.shared).await,
            Kind::Decompress { ref shared, .. } => close_wired(shared).await,
            _ => {
                self.kind = Kind::Closed;
                Ok(())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            Kind::Empty => "Body::Empty",
            Kind::Full(_) => "Body::Full",
            Kind::Reader(_) => "Body::Reader",
            Kind::Wired(_) => "Body::Wired",
            Kind::Decompress { .. } => "Body::Decompress",
            Kind::Closed => "Body::Closed",
        };
        f.write_str(name)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        if bytes.is_empty() {
            Body::empty()
        } else {
            Body {
                kind: Kind::Full(Some(bytes)),
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s.into_bytes()))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

struct Wired {
    shared: Arc<AsyncMutex<WiredState>>,
}

fn trailers_of(shared: &Arc<AsyncMutex<WiredState>>) -> Option<HeaderMap> {
    shared
        .try_lock()
        .ok()
        .and_then(|state| state.trailers.clone())
}

async fn close_wired(shared: &Arc<AsyncMutex<WiredState>>) -> crate::Result<()> {
    let mut state = shared.lock().await;
    match state.phase {
        Phase::Eof | Phase::Closed => {
            state.phase = Phase::Closed;
            return Ok(());
        }
        Phase::Open => {}
    }
    if state.continue_line.is_some() {
        // the peer was never told to send this body; there is nothing
        // on the wire to drain
        state.phase = Phase::Closed;
        state.fire_finish(false);
        return Ok(());
    }
    let limit = if state.server_side {
        Some(MAX_POST_HANDLER_READ_BYTES)
    } else {
        None
    };
    let outcome = state.drain(limit).await;
    state.phase = Phase::Closed;
    trace!("body close drain outcome: {:?}", outcome);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Open,
    Eof,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DrainOutcome {
    AlreadyEof,
    Drained,
    Overflow,
    Failed,
}

/// The connection-wired side of an incoming body.
///
/// Shared between the owning `Body`, the server's response writer (which
/// may drain it before emitting headers), and the connection's
/// finish-request step. All of them run on the connection's task, so the
/// lock is an ownership device rather than a contention point.
pub(crate) struct WiredState {
    reader: Arc<AsyncMutex<ReadSide>>,
    decoder: Decoder,
    phase: Phase,
    server_side: bool,
    trailers: Option<HeaderMap>,
    finish: Option<Box<dyn FnOnce(bool) + Send>>,
    continue_line: Option<ContinueLine>,
}

/// Writes the `100 Continue` interim line the first time the handler
/// reads the request body, unless the response already started.
pub(crate) struct ContinueLine {
    pub(crate) writer: Arc<AsyncMutex<WriteSide>>,
    /// Cleared by the response writer once the reply begins.
    pub(crate) allowed: Arc<AtomicBool>,
    /// Set once the interim line actually reached the socket.
    pub(crate) wrote: Arc<AtomicBool>,
}

impl WiredState {
    pub(crate) fn new(
        reader: Arc<AsyncMutex<ReadSide>>,
        decoder: Decoder,
        server_side: bool,
    ) -> WiredState {
        let phase = if decoder.is_eof() {
            Phase::Eof
        } else {
            Phase::Open
        };
        WiredState {
            reader,
            decoder,
            phase,
            server_side,
            trailers: None,
            finish: None,
            continue_line: None,
        }
    }

    /// Registers the one-shot hook fired when the body finishes:
    /// `true` for a clean EOF, `false` for an early close or error.
    pub(crate) fn on_finish<F>(&mut self, hook: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        debug_assert!(self.finish.is_none(), "finish hook registered twice");
        self.finish = Some(Box::new(hook));
    }

    pub(crate) fn set_continue_line(&mut self, line: ContinueLine) {
        self.continue_line = Some(line);
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.phase, Phase::Eof)
    }

    async fn next_chunk(&mut self) -> Option<crate::Result<Bytes>> {
        match self.phase {
            Phase::Closed => return Some(Err(Error::new_read_after_close())),
            Phase::Eof => return None,
            Phase::Open => {}
        }
        self.maybe_write_continue().await;
        loop {
            let result = {
                let mut rdr = self.reader.lock().await;
                self.decoder.decode(&mut rdr).await
            };
            match result {
                Ok(Decoded::Data(bytes)) => return Some(Ok(bytes)),
                Ok(Decoded::Trailers(trailers)) => {
                    self.trailers = Some(trailers);
                    continue;
                }
                Ok(Decoded::Eof) => {
                    self.phase = Phase::Eof;
                    self.fire_finish(true);
                    return None;
                }
                Err(e) => {
                    // A decode failure poisons the body: the framing is
                    // gone, so the connection cannot be resumed.
                    self.phase = Phase::Closed;
                    self.fire_finish(false);
                    let err = if e.kind() == io::ErrorKind::UnexpectedEof {
                        Error::new_incomplete().with(e)
                    } else {
                        Error::new_body(e)
                    };
                    return Some(Err(err));
                }
            }
        }
    }

    /// Reads the body to EOF, discarding payload, stopping at `limit`.
    pub(crate) async fn drain(&mut self, limit: Option<u64>) -> DrainOutcome {
        match self.phase {
            Phase::Eof => return DrainOutcome::AlreadyEof,
            Phase::Closed => return DrainOutcome::Failed,
            Phase::Open => {}
        }
        let mut seen: u64 = 0;
        loop {
            let result = {
                let mut rdr = self.reader.lock().await;
                self.decoder.decode(&mut rdr).await
            };
            match result {
                Ok(Decoded::Data(bytes)) => {
                    seen += bytes.len() as u64;
                    if let Some(limit) = limit {
                        if seen > limit {
                            debug!("request body over drain threshold, connection not reusable");
                            self.phase = Phase::Closed;
                            self.fire_finish(false);
                            return DrainOutcome::Overflow;
                        }
                    }
                }
                Ok(Decoded::Trailers(trailers)) => {
                    self.trailers = Some(trailers);
                }
                Ok(Decoded::Eof) => {
                    self.phase = Phase::Eof;
                    self.fire_finish(true);
                    return DrainOutcome::Drained;
                }
                Err(_) => {
                    self.phase = Phase::Closed;
                    self.fire_finish(false);
                    return DrainOutcome::Failed;
                }
            }
        }
    }

    async fn maybe_write_continue(&mut self) {
        if let Some(line) = self.continue_line.take() {
            if line.allowed.swap(false, Ordering::SeqCst) {
                let mut writer = line.writer.lock().await;
                match writer.write_direct(b"HTTP/1.1 100 Continue\r\n\r\n").await {
                    Ok(()) => line.wrote.store(true, Ordering::SeqCst),
                    Err(e) => debug!("error writing 100-continue: {}", e),
                }
            }
        }
    }

    fn fire_finish(&mut self, clean: bool) {
        if let Some(hook) = self.finish.take() {
            hook(clean);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::io::tests::{read_side_of, read_side_of_mock};

    async fn wired_body(data: &[u8], decoder: Decoder, server_side: bool) -> Body {
        let reader = Arc::new(AsyncMutex::new(read_side_of(data).await));
        let state = WiredState::new(reader, decoder, server_side);
        Body::wired(Arc::new(AsyncMutex::new(state)))
    }

    #[tokio::test]
    async fn full_body_reads_once() {
        let mut body = Body::from("hello");
        assert_eq!(body.size_hint(), Some(5));
        let chunk = body.data().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.data().await.is_none());
    }

    #[tokio::test]
    async fn wired_body_eof_and_close() {
        let mut body = wired_body(b"hello", Decoder::length(5), false).await;
        assert_eq!(body.read_to_end().await.unwrap(), &b"hello"[..]);
        // closing after EOF is a no-op
        body.close().await.unwrap();
        // reading after close fails with the fixed error
        let err = body.data().await.unwrap().unwrap_err();
        assert!(err.is_read_after_close());
        let err = body.data().await.unwrap().unwrap_err();
        assert!(err.is_read_after_close());
    }

    #[tokio::test]
    async fn wired_body_over_split_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"hel")
            .read(b"lo")
            .build();
        let reader = Arc::new(AsyncMutex::new(read_side_of_mock(mock)));
        let state = WiredState::new(reader, Decoder::length(5), false);
        let mut body = Body::wired(Arc::new(AsyncMutex::new(state)));
        assert_eq!(body.read_to_end().await.unwrap(), &b"hello"[..]);
    }

    #[tokio::test]
    async fn wired_body_short_read_is_incomplete() {
        let mut body = wired_body(b"abc", Decoder::length(10), false).await;
        let mut got_err = None;
        while let Some(res) = body.data().await {
            if let Err(e) = res {
                got_err = Some(e);
                break;
            }
        }
        assert!(got_err.unwrap().is_incomplete_message());
    }

    #[tokio::test]
    async fn finish_hook_fires_once_on_eof() {
        let fired = Arc::new(AtomicBool::new(false));
        let reader = Arc::new(AsyncMutex::new(read_side_of(b"ok").await));
        let mut state = WiredState::new(reader, Decoder::length(2), true);
        {
            let fired = fired.clone();
            state.on_finish(move |clean| {
                assert!(clean);
                assert!(!fired.swap(true, Ordering::SeqCst));
            });
        }
        let mut body = Body::wired(Arc::new(AsyncMutex::new(state)));
        assert_eq!(body.read_to_end().await.unwrap(), &b"ok"[..]);
        assert!(fired.load(Ordering::SeqCst));
        // another close does not re-fire
        body.close().await.unwrap();
    }

    #[tokio::test]
    async fn server_close_drains_within_threshold() {
        let fired_clean = Arc::new(AtomicBool::new(false));
        let reader = Arc::new(AsyncMutex::new(read_side_of(b"leftover body").await));
        let mut state = WiredState::new(reader, Decoder::length(13), true);
        {
            let fired_clean = fired_clean.clone();
            state.on_finish(move |clean| {
                fired_clean.store(clean, Ordering::SeqCst);
            });
        }
        let mut body = Body::wired(Arc::new(AsyncMutex::new(state)));
        body.close().await.unwrap();
        assert!(fired_clean.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn trailers_surface_after_eof() {
        let mut body = wired_body(
            b"3\r\nfoo\r\n0\r\nTrailer-Key: Trailer-Value\r\n\r\n",
            Decoder::chunked(),
            false,
        )
        .await;
        assert!(body.trailers().is_none());
        assert_eq!(body.read_to_end().await.unwrap(), &b"foo"[..]);
        let trailers = body.trailers().unwrap();
        assert_eq!(trailers["trailer-key"], "Trailer-Value");
    }
}
