//! Transparent gzip response decoding.
//!
//! Push-mode wrapper over flate2: compressed chunks go in as the body
//! is pulled, decoded bytes come back out. Nothing here touches the
//! socket, so the decompressor never blocks.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::GzDecoder;

pub(crate) struct Gunzip {
    decoder: GzDecoder<Vec<u8>>,
}

impl Gunzip {
    pub(crate) fn new() -> Gunzip {
        Gunzip {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    /// Feeds one compressed chunk through the decoder.
    pub(crate) fn feed(&mut self, compressed: &[u8]) -> io::Result<()> {
        self.decoder.write_all(compressed)
    }

    /// Validates the gzip trailer once the wire body reaches EOF.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        self.decoder.try_finish()
    }

    /// Takes whatever decoded output has accumulated.
    pub(crate) fn take_output(&mut self) -> Option<Bytes> {
        let out = self.decoder.get_mut();
        if out.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(out)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decodes_in_pieces() {
        let compressed = gzip(b"hello gzip world");
        let mut gz = Gunzip::new();
        let mut out = Vec::new();
        for chunk in compressed.chunks(3) {
            gz.feed(chunk).unwrap();
            if let Some(bytes) = gz.take_output() {
                out.extend_from_slice(&bytes);
            }
        }
        gz.finish().unwrap();
        if let Some(bytes) = gz.take_output() {
            out.extend_from_slice(&bytes);
        }
        assert_eq!(out, b"hello gzip world");
    }

    #[test]
    fn truncated_stream_fails() {
        let compressed = gzip(b"some data that will be cut off");
        let mut gz = Gunzip::new();
        gz.feed(&compressed[..compressed.len() / 2]).unwrap();
        assert!(gz.finish().is_err());
    }
}
