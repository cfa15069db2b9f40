//! Content-type detection over the first bytes of a response body.
//!
//! Run by the response writer when a handler never set Content-Type.
//! At most [`SNIFF_LEN`] bytes are considered.

/// Longest prefix the detector looks at.
pub(crate) const SNIFF_LEN: usize = 512;

const FALLBACK: &str = "application/octet-stream";

/// Detects a MIME type from `data`, always returning something usable.
pub(crate) fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    // Leading whitespace is ignored for text-ish signatures only.
    let trimmed = skip_ws(data);

    for sig in HTML_SIGS {
        if let Some(ct) = match_html(trimmed, sig) {
            return ct;
        }
    }
    for sig in MASKED_SIGS {
        if let Some(ct) = sig.matches(data, trimmed) {
            return ct;
        }
    }
    for (prefix, ct) in EXACT_SIGS {
        if data.starts_with(prefix) {
            return ct;
        }
    }

    if looks_binary(data) {
        FALLBACK
    } else {
        "text/plain; charset=utf-8"
    }
}

fn skip_ws(data: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < data.len() && matches!(data[i], b'\t' | b'\n' | b'\x0c' | b'\r' | b' ') {
        i += 1;
    }
    &data[i..]
}

fn looks_binary(data: &[u8]) -> bool {
    data.iter().any(|&b| {
        b <= 0x08
            || b == 0x0b
            || (0x0e..=0x1a).contains(&b)
            || (0x1c..=0x1f).contains(&b)
    })
}

// A case-insensitive HTML tag, which must be followed by space or '>'.
const HTML_SIGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

fn match_html(data: &[u8], sig: &[u8]) -> Option<&'static str> {
    if data.len() < sig.len() + 1 {
        return None;
    }
    for (i, &want) in sig.iter().enumerate() {
        let got = data[i];
        let got = if want.is_ascii_alphabetic() {
            got.to_ascii_uppercase()
        } else {
            got
        };
        if got != want {
            return None;
        }
    }
    match data[sig.len()] {
        b' ' | b'>' => Some("text/html; charset=utf-8"),
        _ => None,
    }
}

struct Masked {
    mask: &'static [u8],
    pattern: &'static [u8],
    skip_ws: bool,
    ct: &'static str,
}

impl Masked {
    fn matches(&self, raw: &[u8], trimmed: &[u8]) -> Option<&'static str> {
        let data = if self.skip_ws { trimmed } else { raw };
        if data.len() < self.pattern.len() {
            return None;
        }
        for ((&b, &m), &p) in data.iter().zip(self.mask).zip(self.pattern) {
            if b & m != p {
                return None;
            }
        }
        Some(self.ct)
    }
}

const MASKED_SIGS: &[Masked] = &[
    Masked {
        mask: b"\xFF\xFF\xFF\xFF\xFF",
        pattern: b"<?xml",
        skip_ws: true,
        ct: "text/xml; charset=utf-8",
    },
    Masked {
        // "RIFF....WEBPVP"
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WEBPVP",
        skip_ws: false,
        ct: "image/webp",
    },
    Masked {
        // "RIFF....WAVE"
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WAVE",
        skip_ws: false,
        ct: "audio/wave",
    },
    Masked {
        // "RIFF....AVI "
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00AVI ",
        skip_ws: false,
        ct: "video/avi",
    },
];

const EXACT_SIGS: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    // UTF byte-order marks
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"BM", "image/bmp"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"MThd\x00\x00\x00\x06", "audio/midi"),
    (b"ID3", "audio/mpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_html() {
        assert_eq!(
            detect_content_type(b"<!DOCTYPE html><html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            detect_content_type(b"\n\t <html></html>"),
            "text/html; charset=utf-8"
        );
        // tag must terminate with space or '>'
        assert_eq!(
            detect_content_type(b"<htmlfoo"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn sniffs_images() {
        assert_eq!(detect_content_type(b"GIF89a..."), "image/gif");
        assert_eq!(
            detect_content_type(b"\x89PNG\r\n\x1a\n\x00\x00"),
            "image/png"
        );
        assert_eq!(detect_content_type(b"\xFF\xD8\xFF\xE0"), "image/jpeg");
    }

    #[test]
    fn sniffs_riff_families() {
        assert_eq!(detect_content_type(b"RIFF\x01\x02\x03\x04WEBPVP8 "), "image/webp");
        assert_eq!(detect_content_type(b"RIFF\x01\x02\x03\x04WAVEfmt "), "audio/wave");
    }

    #[test]
    fn falls_back() {
        assert_eq!(detect_content_type(b"hello, world"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type(b"\x01\x02\x03"), FALLBACK);
        assert_eq!(detect_content_type(b""), "text/plain; charset=utf-8");
    }
}
