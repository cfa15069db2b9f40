//! The handler-facing response writer.
//!
//! Writes stage into a small buffer until the headers can be finalized:
//! content-type sniffing, content-length vs. chunked selection, and the
//! keep-alive decision all happen before the first body byte reaches
//! the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::conn::ConnShared;
use crate::body::{DrainOutcome, WiredState, MAX_POST_HANDLER_READ_BYTES};
use crate::common::with_deadline;
use crate::error::Error;
use crate::hijack::Hijacked;
use crate::proto::h1::{parse, Encoder, ReadSide, WriteSide};
use crate::{headers, sniff};

/// How many body bytes are staged before headers are forced out.
const STAGING_BUFFER_SIZE: usize = 2048;

pub(crate) struct ReplyFacts {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) req_close: bool,
    pub(crate) wants_http10_keepalive: bool,
    pub(crate) expects_continue: bool,
    pub(crate) write_timeout: Option<Duration>,
}

/// What a handler writes a response through.
pub struct ResponseWriter {
    writer: Arc<AsyncMutex<WriteSide>>,
    reader: Arc<AsyncMutex<ReadSide>>,
    shared: Arc<ConnShared>,
    facts: ReplyFacts,
    req_body: Option<Arc<AsyncMutex<WiredState>>>,
    allow_continue: Arc<AtomicBool>,
    wrote_continue: Arc<AtomicBool>,

    headers: HeaderMap,
    trailers: HeaderMap,
    status: Option<StatusCode>,
    staged: BytesMut,
    encoder: Option<Encoder>,
    handler_cl: Option<Option<u64>>,
    written: u64,
    wrote_header: bool,
    close_after_reply: bool,
    hijacked: bool,
    handler_done: bool,
}

impl ResponseWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        writer: Arc<AsyncMutex<WriteSide>>,
        reader: Arc<AsyncMutex<ReadSide>>,
        shared: Arc<ConnShared>,
        facts: ReplyFacts,
        req_body: Option<Arc<AsyncMutex<WiredState>>>,
        allow_continue: Arc<AtomicBool>,
        wrote_continue: Arc<AtomicBool>,
    ) -> ResponseWriter {
        ResponseWriter {
            writer,
            reader,
            shared,
            facts,
            req_body,
            allow_continue,
            wrote_continue,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            status: None,
            staged: BytesMut::with_capacity(STAGING_BUFFER_SIZE),
            encoder: None,
            handler_cl: None,
            written: 0,
            wrote_header: false,
            close_after_reply: false,
            hijacked: false,
            handler_done: false,
        }
    }

    /// The response headers, settable until the headers go out.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Trailer fields to send after a chunked body. May be set during or
    /// after body writes.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    /// Records the status code. Headers are still emitted lazily, before
    /// the first body byte leaves the staging buffer.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.wrote_header || self.status.is_some() {
            warn!("superfluous write_header call");
            return;
        }
        // once a reply is underway, no interim 100 may be written
        self.allow_continue.store(false, Ordering::SeqCst);
        self.status = Some(status);
    }

    /// Writes body bytes, defaulting the status to 200.
    pub async fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        if self.hijacked {
            debug!("write on hijacked connection");
            return Err(Error::new_hijacked());
        }
        self.allow_continue.store(false, Ordering::SeqCst);
        let status = *self.status.get_or_insert(StatusCode::OK);
        if data.is_empty() {
            return Ok(0);
        }
        if self.facts.method != Method::HEAD && !status_allows_body(status) {
            return Err(Error::new_body_not_allowed());
        }

        self.written += data.len() as u64;
        if self.handler_cl.is_none() {
            self.handler_cl = Some(headers::content_length(&self.headers).ok().flatten());
        }
        if let Some(cl) = self.handler_cl.unwrap_or(None) {
            if self.written > cl {
                return Err(Error::new_content_length_exceeded());
            }
        }

        if !self.wrote_header {
            self.staged.extend_from_slice(data);
            if self.staged.len() > STAGING_BUFFER_SIZE {
                self.finalize().await?;
            }
            return Ok(data.len());
        }
        self.encode_out(data).await?;
        Ok(data.len())
    }

    /// Forces header finalization and drains all buffers to the socket.
    pub async fn flush(&mut self) -> crate::Result<()> {
        if self.hijacked {
            return Err(Error::new_hijacked());
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        if !self.wrote_header {
            self.finalize().await?;
        }
        let deadline = self.facts.write_timeout;
        let mut wr = self.writer.lock().await;
        let flushed = with_deadline(deadline, async {
            wr.flush().await.map_err(Error::new_body_write)
        })
        .await;
        if let Err(e) = flushed {
            self.shared.cancel_request();
            return Err(e);
        }
        Ok(())
    }

    /// Observes the client going away before the response is finished.
    /// Fires at most once per connection.
    pub fn close_notify(&self) -> watch::Receiver<bool> {
        self.shared.close_notify()
    }

    /// Takes over the raw connection. Normal HTTP writes on this
    /// response fail afterwards; buffered-but-unread bytes (including a
    /// captured peek byte) are replayed by the returned stream.
    pub async fn hijack(&mut self) -> crate::Result<Hijacked> {
        if self.handler_done {
            panic!("hijack after the handler returned");
        }
        if self.hijacked {
            return Err(Error::new_hijacked());
        }
        // flush anything already committed to the wire
        if self.wrote_header {
            let mut wr = self.writer.lock().await;
            if let Err(e) = wr.flush().await {
                debug!("flush before hijack failed: {}", e);
            }
        }
        // the read side must be fully yielded before it can be stolen
        self.shared.background.abort().await;

        let (read_half, buffered) = {
            let mut rd = self.reader.lock().await;
            (rd.take_io(), rd.take_buf())
        };
        let write_half = self.writer.lock().await.take_io();
        let (read_half, write_half) = match (read_half, write_half) {
            (Some(r), Some(w)) => (r, w),
            _ => return Err(Error::new_hijacked()),
        };
        let stream = read_half.unsplit(write_half);

        self.hijacked = true;
        self.shared.set_hijacked();
        Ok(Hijacked::new(stream, buffered))
    }

    pub(crate) fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    pub(crate) fn must_close(&self) -> bool {
        self.close_after_reply
    }

    /// Completes the response after the handler returned: finalize
    /// headers if they never went out, terminate the body framing, and
    /// drain all buffers.
    pub(crate) async fn finish(&mut self) -> crate::Result<()> {
        self.handler_done = true;
        if self.hijacked {
            return Ok(());
        }
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        if !self.wrote_header {
            self.finalize().await?;
        }
        let deadline = self.facts.write_timeout;
        let mut wr = self.writer.lock().await;
        if let Some(ref mut encoder) = self.encoder {
            let trailers = if self.trailers.is_empty() {
                None
            } else {
                Some(&self.trailers)
            };
            encoder.end(trailers, wr.buffer())?;
        }
        let flushed = with_deadline(deadline, async {
            wr.flush().await.map_err(Error::new_body_write)
        })
        .await;
        if let Err(e) = flushed {
            self.shared.cancel_request();
            return Err(e);
        }
        Ok(())
    }

    async fn encode_out(&mut self, data: &[u8]) -> crate::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let deadline = self.facts.write_timeout;
        let mut wr = self.writer.lock().await;
        if let Some(ref mut encoder) = self.encoder {
            encoder.encode(data, wr.buffer())?;
        }
        // HEAD and bodyless replies swallow writes
        let flushed = with_deadline(deadline, async {
            wr.maybe_flush().await.map_err(Error::new_body_write)
        })
        .await;
        if let Err(e) = flushed {
            self.shared.cancel_request();
            return Err(e);
        }
        Ok(())
    }

    /// Finalizes and emits the response head. Runs at most once, before
    /// the first body byte leaves the staging buffer.
    async fn finalize(&mut self) -> crate::Result<()> {
        debug_assert!(!self.wrote_header);
        self.wrote_header = true;
        self.allow_continue.store(false, Ordering::SeqCst);

        let status = self.status.unwrap_or(StatusCode::OK);
        let is_head = self.facts.method == Method::HEAD;
        let bodyless = !status_allows_body(status);

        let mut declared_cl = headers::content_length(&self.headers).ok().flatten();
        let te = headers::transfer_encoding(&self.headers);
        let has_te = !te.is_empty();

        // 1. a finished handler with a fully-staged body gets an exact
        //    Content-Length
        if self.handler_done
            && declared_cl.is_none()
            && !has_te
            && !bodyless
            && (!is_head || !self.staged.is_empty())
            && self.trailers.is_empty()
        {
            let len = self.staged.len() as u64;
            let mut buf = itoa::Buffer::new();
            self.headers
                .insert(CONTENT_LENGTH, buf.format(len).parse().unwrap());
            declared_cl = Some(len);
        }

        // 2. HTTP/1.0 keep-alive only works with a self-sized reply
        if self.facts.wants_http10_keepalive
            && (is_head || declared_cl.is_some() || bodyless)
        {
            if !headers::connection_has(&self.headers, "keep-alive") {
                self.headers
                    .insert(CONNECTION, "keep-alive".parse().unwrap());
            }
        } else if self.facts.version == Version::HTTP_10 {
            self.close_after_reply = true;
        }

        // 3. explicit close, or an Expect body the client never got
        //    permission to send
        if self.facts.version >= Version::HTTP_11 && self.facts.req_close {
            self.close_after_reply = true;
        }
        let never_continued =
            self.facts.expects_continue && !self.wrote_continue.load(Ordering::SeqCst);
        if never_continued {
            if let Some(body) = &self.req_body {
                if !body.lock().await.is_eof() {
                    self.close_after_reply = true;
                }
            }
        }

        // 4. Content-Length and Transfer-Encoding cannot coexist
        if declared_cl.is_some() && has_te {
            warn!("response has both Transfer-Encoding and Content-Length; dropping Content-Length");
            self.headers.remove(CONTENT_LENGTH);
            declared_cl = None;
        }

        // 5. select body framing
        if is_head || bodyless {
            if status == StatusCode::NOT_MODIFIED {
                self.headers.remove(CONTENT_TYPE);
                self.headers.remove(CONTENT_LENGTH);
                self.headers.remove(TRANSFER_ENCODING);
            } else if status == StatusCode::NO_CONTENT {
                self.headers.remove(TRANSFER_ENCODING);
            }
            self.encoder = None;
        } else if let Some(cl) = declared_cl {
            self.headers.remove(TRANSFER_ENCODING);
            self.encoder = Some(Encoder::length(cl));
        } else if self.facts.version >= Version::HTTP_11 {
            if !has_te {
                self.headers
                    .insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
            }
            self.encoder = Some(Encoder::chunked());
        } else {
            self.encoder = Some(Encoder::close_delimited());
            self.close_after_reply = true;
        }

        // 6. sniff a Content-Type when the handler never chose one;
        //    an empty reply carries no type at all
        if !bodyless
            && !has_te
            && !self.staged.is_empty()
            && !self.headers.contains_key(CONTENT_TYPE)
        {
            let prefix = &self.staged[..self.staged.len().min(sniff::SNIFF_LEN)];
            let ct = sniff::detect_content_type(prefix);
            self.headers.insert(CONTENT_TYPE, ct.parse().unwrap());
        }

        // 7. an unread request body is drained (bounded) before the
        //    reply goes out, to keep the connection reusable. Skipped
        //    when the client is still waiting for a 100 that never came.
        if !never_continued {
            if let Some(body) = &self.req_body {
                let mut body = body.lock().await;
                if !body.is_eof() {
                    match body.drain(Some(MAX_POST_HANDLER_READ_BYTES)).await {
                        DrainOutcome::AlreadyEof | DrainOutcome::Drained => {}
                        DrainOutcome::Overflow | DrainOutcome::Failed => {
                            self.close_after_reply = true;
                        }
                    }
                }
            }
        }

        if self.close_after_reply && !headers::connection_has(&self.headers, "close") {
            self.headers.insert(CONNECTION, "close".parse().unwrap());
        }

        // 8.–9. status line, sorted headers, Date, then the staged body
        // prefix through the encoder
        let deadline = self.facts.write_timeout;
        let mut wr = self.writer.lock().await;
        parse::encode_response_head(
            status,
            None,
            response_version(self.facts.version),
            &self.headers,
            wr.buffer(),
        );
        if !self.staged.is_empty() {
            let staged = self.staged.split().freeze();
            if let Some(ref mut encoder) = self.encoder {
                encoder.encode(&staged, wr.buffer())?;
            }
        }
        let flushed = with_deadline(deadline, async {
            wr.maybe_flush().await.map_err(Error::new_body_write)
        })
        .await;
        if let Err(e) = flushed {
            self.shared.cancel_request();
            return Err(e);
        }
        Ok(())
    }
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn response_version(req_version: Version) -> Version {
    if req_version >= Version::HTTP_11 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    }
}
