//! The I/O object a handler receives when it hijacks its connection.
//!
//! Reads replay whatever the connection had already buffered (including
//! a byte captured by the background peek) before touching the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::BoxedStream;

/// A hijacked connection: the raw stream plus any bytes the transport
/// had buffered ahead of the caller.
pub struct Hijacked {
    pre: Option<Bytes>,
    inner: BoxedStream,
}

impl Hijacked {
    pub(crate) fn new(inner: BoxedStream, pre: Bytes) -> Hijacked {
        Hijacked {
            pre: if pre.is_empty() { None } else { Some(pre) },
            inner,
        }
    }

    /// Splits into the raw stream and the not-yet-consumed buffered bytes.
    pub fn into_parts(self) -> (BoxedStream, Bytes) {
        (self.inner, self.pre.unwrap_or_else(Bytes::new))
    }
}

impl AsyncRead for Hijacked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut pre) = self.pre.take() {
            // If there are no remaining bytes, let the bytes get dropped.
            if !pre.is_empty() {
                let count = pre.len().min(buf.remaining());
                buf.put_slice(&pre[..count]);
                let _ = pre.split_to(count);
                // Put back what's left
                if !pre.is_empty() {
                    self.pre = Some(pre);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Hijacked {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_buffered_bytes_first() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b" world").await.unwrap();
        drop(tx);

        let mut io = Hijacked::new(Box::new(rx), Bytes::from_static(b"hello"));
        let mut all = Vec::new();
        io.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello world");
    }

    #[tokio::test]
    async fn partial_reads_keep_remainder() {
        let (tx, rx) = tokio::io::duplex(8);
        drop(tx);
        let mut io = Hijacked::new(Box::new(rx), Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = Vec::new();
        io.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }
}
