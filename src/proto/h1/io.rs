//! Buffered halves of a connection.
//!
//! The read half lives behind `Arc<tokio::sync::Mutex<ReadSide>>` so the
//! serve loop, the request body, and the background peek task can take
//! turns on it; the lock is the hand-off point the disconnect watcher
//! yields through. Peeked bytes land in the ordinary read buffer, which
//! is what makes them visible to a later hijack.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::net::BoxedStream;

pub(crate) const INIT_BUFFER_SIZE: usize = 4096;
pub(crate) const WRITE_FLUSH_SIZE: usize = 4096;

pub(crate) fn hijacked_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "connection has been hijacked")
}

pub(crate) struct ReadSide {
    io: Option<ReadHalf<BoxedStream>>,
    buf: BytesMut,
    read_limit: Option<usize>,
}

impl ReadSide {
    pub(crate) fn new(io: ReadHalf<BoxedStream>) -> ReadSide {
        ReadSide {
            io: Some(io),
            buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            read_limit: None,
        }
    }

    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bounds how many further bytes may be pulled off the socket.
    /// Hitting the bound reads as EOF, which the head parser turns into
    /// a too-large error.
    pub(crate) fn set_read_limit(&mut self, limit: Option<usize>) {
        self.read_limit = limit;
    }

    pub(crate) fn limit_reached(&self) -> bool {
        self.read_limit == Some(0)
    }

    /// Reads more bytes into the buffer, returning how many arrived.
    /// Zero means EOF (or an exhausted read limit).
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let io = match self.io.as_mut() {
            Some(io) => io,
            None => return Err(hijacked_io_error()),
        };
        let max = match self.read_limit {
            Some(0) => return Ok(0),
            Some(limit) => limit.min(INIT_BUFFER_SIZE),
            None => INIT_BUFFER_SIZE,
        };
        let mut tmp = [0u8; INIT_BUFFER_SIZE];
        let n = io.read(&mut tmp[..max]).await?;
        self.buf.extend_from_slice(&tmp[..n]);
        if let Some(limit) = self.read_limit {
            self.read_limit = Some(limit - n);
        }
        Ok(n)
    }

    /// Yields up to `max` buffered bytes, filling from the socket when
    /// empty. An empty result is EOF.
    pub(crate) async fn read_mem(&mut self, max: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() {
            let n = self.fill().await?;
            if n == 0 {
                return Ok(Bytes::new());
            }
        }
        let n = max.min(self.buf.len());
        Ok(self.buf.split_to(n).freeze())
    }

    /// One-byte peek: pulls a single byte into the buffer without
    /// consuming it. Returns 0 on EOF.
    pub(crate) async fn peek_one(&mut self) -> io::Result<usize> {
        if !self.buf.is_empty() {
            return Ok(1);
        }
        let io = match self.io.as_mut() {
            Some(io) => io,
            None => return Err(hijacked_io_error()),
        };
        let mut byte = [0u8; 1];
        let n = io.read(&mut byte).await?;
        if n == 1 {
            self.buf.extend_from_slice(&byte);
        }
        Ok(n)
    }

    pub(crate) fn take_io(&mut self) -> Option<ReadHalf<BoxedStream>> {
        self.io.take()
    }

    pub(crate) fn take_buf(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

pub(crate) struct WriteSide {
    io: Option<WriteHalf<BoxedStream>>,
    buf: BytesMut,
    sticky_err: Option<(io::ErrorKind, String)>,
}

impl WriteSide {
    pub(crate) fn new(io: WriteHalf<BoxedStream>) -> WriteSide {
        WriteSide {
            io: Some(io),
            buf: BytesMut::with_capacity(WRITE_FLUSH_SIZE),
            sticky_err: None,
        }
    }

    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// A write error is sticky: once the socket broke, every later write
    /// reports the same failure.
    pub(crate) fn sticky_err(&self) -> Option<io::Error> {
        self.sticky_err
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if let Some(err) = self.sticky_err() {
            return Err(err);
        }
        let io = match self.io.as_mut() {
            Some(io) => io,
            None => return Err(hijacked_io_error()),
        };
        if !self.buf.is_empty() {
            let data = self.buf.split();
            if let Err(err) = io.write_all(&data).await {
                self.sticky_err = Some((err.kind(), err.to_string()));
                return Err(err);
            }
        }
        if let Err(err) = io.flush().await {
            self.sticky_err = Some((err.kind(), err.to_string()));
            return Err(err);
        }
        Ok(())
    }

    /// Flushes only once enough output has been staged.
    pub(crate) async fn maybe_flush(&mut self) -> io::Result<()> {
        if self.buf.len() >= WRITE_FLUSH_SIZE {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Appends raw bytes ahead of any response framing and pushes them
    /// out immediately. Used for interim `100 Continue` lines.
    pub(crate) async fn write_direct(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        self.flush().await
    }

    /// Closes the write direction after draining buffers.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        match self.io.as_mut() {
            Some(io) => io.shutdown().await,
            None => Err(hijacked_io_error()),
        }
    }

    pub(crate) fn take_io(&mut self) -> Option<WriteHalf<BoxedStream>> {
        self.io.take()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::BoxedStream;

    /// Builds a `ReadSide` that will yield exactly `data`, then EOF.
    pub(crate) async fn read_side_of(data: &[u8]) -> ReadSide {
        let (mut tx, rx) = tokio::io::duplex(data.len().max(1));
        tx.write_all(data).await.expect("duplex write");
        drop(tx);
        let (rh, _wh) = tokio::io::split(Box::new(rx) as BoxedStream);
        ReadSide::new(rh)
    }

    /// Builds a `ReadSide` over a scripted mock, for exercising reads
    /// split at arbitrary byte boundaries.
    pub(crate) fn read_side_of_mock(mock: tokio_test::io::Mock) -> ReadSide {
        let (rh, _wh) = tokio::io::split(Box::new(mock) as BoxedStream);
        ReadSide::new(rh)
    }

    #[tokio::test]
    async fn read_limit_reads_as_eof() {
        let mut rd = read_side_of(b"hello world").await;
        rd.set_read_limit(Some(5));
        assert_eq!(rd.fill().await.unwrap(), 5);
        assert_eq!(&rd.buffer()[..], b"hello");
        assert_eq!(rd.fill().await.unwrap(), 0);
        assert!(rd.limit_reached());

        rd.set_read_limit(None);
        assert_eq!(rd.fill().await.unwrap(), 6);
        assert_eq!(&rd.buffer()[..], b"hello world");
    }

    #[tokio::test]
    async fn peek_lands_in_buffer() {
        let mut rd = read_side_of(b"x").await;
        assert_eq!(rd.peek_one().await.unwrap(), 1);
        assert_eq!(&rd.buffer()[..], b"x");
        // a second peek sees the buffered byte, not the socket
        assert_eq!(rd.peek_one().await.unwrap(), 1);
        let got = rd.read_mem(16).await.unwrap();
        assert_eq!(&got[..], b"x");
        assert_eq!(rd.peek_one().await.unwrap(), 0);
    }
}
