//! A pooled client connection and its two background loops.
//!
//! The write loop owns the socket's write half and serializes request
//! emission; the read loop owns the read half and parses responses. A
//! round-trip posts to both and then waits, so requests on one
//! connection are strictly serialized: the read loop does not look at
//! the next request until the previous response body is done.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures_channel::oneshot;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::StatusCode;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::pool::{Key, Pool};
use crate::body::{Body, WiredState};
use crate::error::Error;
use crate::message::{RequestFacts, Response};
use crate::net::{BoxedStream, TlsState};
use crate::proto::h1::parse::{self, BodyLength, ResponseHead};
use crate::proto::h1::{Decoder, Encoder, ReadSide, WriteSide};
use crate::headers;

/// Framing for an outgoing request body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OutFraming {
    Empty,
    Length(u64),
    Chunked,
}

pub(crate) struct ConnParams {
    pub(crate) pool: Pool,
    pub(crate) max_response_header_bytes: usize,
    pub(crate) disable_keep_alives: bool,
}

struct WriteRequest {
    head: Bytes,
    body: Body,
    framing: OutFraming,
    continue_rx: Option<oneshot::Receiver<bool>>,
    expect_continue_timeout: Duration,
    result_tx: oneshot::Sender<crate::Result<()>>,
}

struct ReadRequest {
    facts: RequestFacts,
    requested_gzip: bool,
    continue_tx: Option<oneshot::Sender<bool>>,
    resp_tx: oneshot::Sender<crate::Result<Response>>,
}

/// Everything a single round-trip needs from the transport.
pub(crate) struct RoundTripRequest {
    pub(crate) head: Bytes,
    pub(crate) body: Body,
    pub(crate) framing: OutFraming,
    pub(crate) facts: RequestFacts,
    pub(crate) requested_gzip: bool,
    pub(crate) expects_continue: bool,
    pub(crate) expect_continue_timeout: Duration,
    pub(crate) response_header_timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Busy,
    Idle,
    Dead,
}

struct PcState {
    phase: Phase,
    generation: u64,
    broken: bool,
}

pub(crate) struct PersistConn {
    pub(crate) key: Key,
    pub(crate) is_proxy: bool,
    pub(crate) tls: Option<TlsState>,
    state: StdMutex<PcState>,
    reused: AtomicBool,
    writech: mpsc::Sender<WriteRequest>,
    reqch: mpsc::Sender<ReadRequest>,
    closed: CancellationToken,
}

impl PersistConn {
    pub(crate) fn spawn(
        stream: BoxedStream,
        key: Key,
        is_proxy: bool,
        tls: Option<TlsState>,
        params: ConnParams,
    ) -> Arc<PersistConn> {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = Arc::new(AsyncMutex::new(ReadSide::new(read_half)));
        let (writech, write_rx) = mpsc::channel(1);
        let (reqch, req_rx) = mpsc::channel(1);
        let closed = CancellationToken::new();

        let pc = Arc::new(PersistConn {
            key,
            is_proxy,
            tls,
            state: StdMutex::new(PcState {
                phase: Phase::Busy,
                generation: 0,
                broken: false,
            }),
            reused: AtomicBool::new(false),
            writech,
            reqch,
            closed: closed.clone(),
        });

        tokio::spawn(write_loop(write_half, write_rx, closed.clone()));
        tokio::spawn(read_loop(reader, req_rx, pc.clone(), params));
        pc
    }

    pub(crate) fn set_reused(&self) {
        self.reused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn was_reused(&self) -> bool {
        self.reused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_broken(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.broken || state.phase == Phase::Dead
    }

    /// Busy -> Idle; returns false when the conn can no longer idle.
    pub(crate) fn mark_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.broken || state.phase == Phase::Dead {
            return false;
        }
        state.phase = Phase::Idle;
        state.generation += 1;
        true
    }

    pub(crate) fn idle_generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Idle -> Busy; fails if the idle timer already fired.
    pub(crate) fn acquire_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Idle && !state.broken {
            state.phase = Phase::Busy;
            return true;
        }
        false
    }

    /// The idle-timer side of the reuse race.
    pub(crate) fn expire_if_idle(&self, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Idle && state.generation == generation {
            state.phase = Phase::Dead;
            return true;
        }
        false
    }

    /// Sticky: a closed connection never serves again. Both loops exit
    /// and drop their halves, which closes the socket.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.phase = Phase::Dead;
            state.broken = true;
        }
        self.closed.cancel();
    }

    /// Sends the request through the write loop, registers with the
    /// read loop, and awaits the outcome.
    pub(crate) async fn round_trip(&self, req: RoundTripRequest) -> crate::Result<Response> {
        let RoundTripRequest {
            head,
            body,
            framing,
            facts,
            requested_gzip,
            expects_continue,
            expect_continue_timeout,
            response_header_timeout,
            cancel,
        } = req;

        let (resp_tx, mut resp_rx) = oneshot::channel();
        let (result_tx, mut result_rx) = oneshot::channel();
        let (continue_tx, continue_rx) = if expects_continue {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.writech
            .send(WriteRequest {
                head,
                body,
                framing,
                continue_rx,
                expect_continue_timeout,
                result_tx,
            })
            .await
            .map_err(|_| Error::new_closed())?;
        self.reqch
            .send(ReadRequest {
                facts,
                requested_gzip,
                continue_tx,
                resp_tx,
            })
            .await
            .map_err(|_| Error::new_closed())?;

        let mut write_done = false;
        let mut header_deadline: Option<Pin<Box<tokio::time::Sleep>>> = None;
        loop {
            tokio::select! {
                resp = &mut resp_rx => {
                    return match resp {
                        Ok(result) => result,
                        Err(_) => {
                            self.close();
                            Err(Error::new_closed())
                        }
                    };
                }
                written = &mut result_rx, if !write_done => {
                    write_done = true;
                    match written {
                        Ok(Ok(())) => {
                            if let Some(dur) = response_header_timeout {
                                header_deadline = Some(Box::pin(tokio::time::sleep(dur)));
                            }
                        }
                        Ok(Err(e)) => {
                            self.close();
                            return Err(e);
                        }
                        Err(_) => {
                            self.close();
                            return Err(Error::new_closed());
                        }
                    }
                }
                _ = async { header_deadline.as_mut().unwrap().await }, if header_deadline.is_some() => {
                    debug!("timeout awaiting response headers");
                    self.close();
                    return Err(Error::new_timeout());
                }
                _ = async { cancel.as_ref().unwrap().cancelled().await }, if cancel.is_some() => {
                    self.close();
                    return Err(Error::new_canceled());
                }
            }
        }
    }
}

async fn write_loop(
    write_half: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<WriteRequest>,
    closed: CancellationToken,
) {
    let mut wr = WriteSide::new(write_half);
    loop {
        let wreq = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            wreq = rx.recv() => match wreq {
                Some(wreq) => wreq,
                None => break,
            },
        };

        // a write error poisons the connection
        if write_one(&mut wr, wreq).await.is_err() {
            break;
        }
    }
    trace!("write loop exiting");
}

async fn write_one(wr: &mut WriteSide, wreq: WriteRequest) -> std::io::Result<()> {
    let WriteRequest {
        head,
        mut body,
        framing,
        continue_rx,
        expect_continue_timeout,
        result_tx,
    } = wreq;

    let mut wrote_any = false;
    let outcome: std::io::Result<()> = write_request(
        wr,
        head,
        &mut body,
        framing,
        continue_rx,
        expect_continue_timeout,
        &mut wrote_any,
    )
    .await;

    let report = match &outcome {
        Ok(()) => Ok(()),
        Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
    };
    let _ = result_tx.send(report.map_err(|e| {
        if wrote_any {
            Error::new_body_write(e)
        } else {
            // retry logic distinguishes requests that never reached the wire
            Error::new_nothing_written(e)
        }
    }));
    outcome
}

async fn write_request(
    wr: &mut WriteSide,
    head: Bytes,
    body: &mut Body,
    framing: OutFraming,
    continue_rx: Option<oneshot::Receiver<bool>>,
    expect_continue_timeout: Duration,
    wrote_any: &mut bool,
) -> std::io::Result<()> {
    {
        // headers go out immediately
        wr.buffer().extend_from_slice(&head);
        wr.flush().await?;
        *wrote_any = true;

        // with Expect: 100-continue the body waits for the server's nod,
        // the timeout, or a verdict to skip
        let mut send_body = true;
        if let Some(continue_rx) = continue_rx {
            tokio::select! {
                permission = continue_rx => match permission {
                    Ok(true) => trace!("100-continue received, sending body"),
                    Ok(false) | Err(_) => {
                        trace!("response arrived before 100-continue, skipping body");
                        send_body = false;
                    }
                },
                _ = tokio::time::sleep(expect_continue_timeout) => {
                    trace!("no 100-continue after {:?}, sending body anyway", expect_continue_timeout);
                }
            }
        }

        if send_body {
            match framing {
                OutFraming::Empty => {}
                OutFraming::Length(n) => {
                    let mut encoder = Encoder::length(n);
                    stream_body(wr, body, &mut encoder).await?;
                    // a body shorter than its declared length is a write error
                    encoder.end(None, wr.buffer()).map_err(to_io)?;
                }
                OutFraming::Chunked => {
                    let mut encoder = Encoder::chunked();
                    stream_body(wr, body, &mut encoder).await?;
                    encoder.end(None, wr.buffer()).map_err(to_io)?;
                }
            }
        } else {
            let _ = body.close().await;
        }
        wr.flush().await?;
        Ok(())
    }
}

async fn stream_body(
    wr: &mut WriteSide,
    body: &mut Body,
    encoder: &mut Encoder,
) -> std::io::Result<()> {
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(to_io)?;
        if chunk.is_empty() {
            continue;
        }
        encoder.encode(&chunk, wr.buffer()).map_err(to_io)?;
        wr.maybe_flush().await?;
    }
    Ok(())
}

fn to_io(e: crate::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

async fn read_loop(
    reader: Arc<AsyncMutex<ReadSide>>,
    mut rx: mpsc::Receiver<ReadRequest>,
    pc: Arc<PersistConn>,
    params: ConnParams,
) {
    loop {
        let mut rreq = tokio::select! {
            biased;
            _ = pc.closed.cancelled() => break,
            rreq = rx.recv() => match rreq {
                Some(rreq) => rreq,
                None => break,
            },
        };

        // one-byte peek: detect a connection the server closed while it
        // sat idle in the pool
        let peeked = tokio::select! {
            biased;
            _ = pc.closed.cancelled() => Err(std::io::Error::new(std::io::ErrorKind::Other, "connection closed")),
            peeked = async { reader.lock().await.peek_one().await } => peeked,
        };
        match peeked {
            Ok(0) => {
                let err = if pc.was_reused() {
                    Error::new_server_closed_idle()
                } else {
                    Error::new_incomplete()
                };
                pc.close();
                let _ = rreq.resp_tx.send(Err(err));
                break;
            }
            Err(e) => {
                let err = if pc.was_reused() {
                    Error::new_server_closed_idle().with(e)
                } else {
                    Error::new_io(e)
                };
                pc.close();
                let _ = rreq.resp_tx.send(Err(err));
                break;
            }
            Ok(_) => {}
        }

        // parse response heads until a non-interim one arrives
        let mut forced_close = false;
        let head = loop {
            let head = match read_response_head(&reader, params.max_response_header_bytes).await
            {
                Ok(head) => head,
                Err(e) => {
                    pc.close();
                    let _ = rreq.resp_tx.send(Err(e));
                    return;
                }
            };
            if head.status == StatusCode::CONTINUE {
                trace!("received 100-continue");
                if let Some(tx) = rreq.continue_tx.take() {
                    let _ = tx.send(true);
                }
                continue;
            }
            if head.status.is_informational() {
                // informational responses other than 100 are surfaced
                // as the result, and the connection is not reused
                debug!("surfacing informational response {}", head.status);
                forced_close = true;
            }
            break head;
        };
        // a final response before the body was sent tells the write
        // loop to hold it
        if let Some(tx) = rreq.continue_tx.take() {
            let _ = tx.send(false);
        }

        let (body_len, transfer_encoding) =
            match parse::response_body_length(&rreq.facts.method, &head) {
                Ok(parts) => parts,
                Err(e) => {
                    pc.close();
                    let _ = rreq.resp_tx.send(Err(e));
                    return;
                }
            };
        let close = forced_close
            || headers::should_close(head.version, &head.headers)
            || body_len == BodyLength::Close;

        let decoder = match body_len {
            BodyLength::Known(n) => Decoder::length(n),
            BodyLength::Chunked => Decoder::chunked(),
            BodyLength::Close => Decoder::eof(),
        };

        let ResponseHead {
            status,
            reason,
            version,
            headers: resp_headers,
        } = head;
        let bodyless_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let content_length = match headers::content_length(&resp_headers).ok().flatten() {
            Some(n) => n as i64,
            None if bodyless_status => 0,
            None => -1,
        };

        let mut response = Response {
            status,
            reason,
            version,
            headers: resp_headers,
            body: Body::empty(),
            content_length,
            transfer_encoding,
            close,
            uncompressed: false,
            tls: pc.tls.clone(),
            request: rreq.facts.clone(),
        };

        if decoder.is_eof() {
            // no body: the connection can go back to the pool before the
            // response is even delivered
            let pooled = !close
                && !params.disable_keep_alives
                && params.pool.put_idle(pc.clone());
            if rreq.resp_tx.send(Ok(response)).is_err() {
                debug!("round-trip abandoned before response delivery");
            }
            if !pooled {
                pc.close();
                break;
            }
            continue;
        }

        // wire the body to this read side; we get notified when it is
        // fully read or given up on
        let (done_tx, done_rx) = oneshot::channel::<bool>();
        let mut wired = WiredState::new(reader.clone(), decoder, false);
        wired.on_finish(move |clean| {
            let _ = done_tx.send(clean);
        });
        response.body = Body::wired(Arc::new(AsyncMutex::new(wired)));

        if rreq.requested_gzip && is_gzip(&response.headers) {
            response.headers.remove(CONTENT_ENCODING);
            response.headers.remove(CONTENT_LENGTH);
            response.content_length = -1;
            response.uncompressed = true;
            let inner = std::mem::take(&mut response.body);
            response.body = Body::decompress(inner);
        }

        if rreq.resp_tx.send(Ok(response)).is_err() {
            // nobody will ever read that body
            pc.close();
            break;
        }

        let clean = tokio::select! {
            biased;
            _ = pc.closed.cancelled() => false,
            done = done_rx => done.unwrap_or(false),
        };
        if !clean || close || params.disable_keep_alives || !params.pool.put_idle(pc.clone()) {
            pc.close();
            break;
        }
    }
    pc.close();
    trace!("read loop exiting");
}

fn is_gzip(headers: &http::HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

async fn read_response_head(
    reader: &Arc<AsyncMutex<ReadSide>>,
    max: usize,
) -> crate::Result<ResponseHead> {
    let mut rd = reader.lock().await;
    loop {
        if let Some(head) = parse::parse_response(rd.buffer(), max)? {
            return Ok(head);
        }
        let n = rd.fill().await.map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_incomplete());
        }
    }
}
