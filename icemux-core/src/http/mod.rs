//! Minimal request layer for the ICE/HTTP dialect
//!
//! Streaming sources and legacy listeners do not speak clean HTTP/1.1: header
//! blocks may end in `\r\n\r\n`, `\n\n` or `\r\r\n\r\r\n`, the protocol token
//! may be `ICE` instead of `HTTP`, and ancient Shoutcast sources put the
//! password on the request line. This module provides the tolerant parser the
//! request-assembly state machine feeds, plus URI normalization.
//!
//! - [`parser`] - request-line, header and query parsing
//! - [`find_terminator`] - the three accepted header terminators
//! - [`normalize_uri`] - percent-decoding with unsafe-path rejection

pub mod parser;

pub use parser::{Method, Protocol, Request};

/// Result type for request parsing
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// Request-parsing error types
#[derive(Debug, Clone)]
pub enum HttpError {
    /// Invalid request format
    InvalidRequest(String),
    /// Invalid header line
    InvalidHeaders(String),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            HttpError::InvalidHeaders(msg) => write!(f, "Invalid headers: {}", msg),
        }
    }
}

impl std::error::Error for HttpError {}

/// Locate the end of a request header block.
///
/// The three accepted terminators are tried in priority order: `\r\n\r\n`,
/// then `\n\n`, then `\r\r\n\r\r\n`. Returns the offset just past the
/// terminator, i.e. the position where any payload bytes begin.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    for (pat, skip) in [
        (&b"\r\n\r\n"[..], 4),
        (&b"\n\n"[..], 2),
        (&b"\r\r\n\r\r\n"[..], 6),
    ] {
        if let Some(pos) = find(buf, pat) {
            return Some(pos + skip);
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Normalize a request URI: percent-decode and reject unsafe paths.
///
/// Returns `None` for URIs that do not start with `/`, contain NUL bytes, or
/// traverse upwards with `..` segments.
pub fn normalize_uri(raw: &str) -> Option<String> {
    if !raw.starts_with('/') {
        return None;
    }
    let decoded = percent_decode(raw)?;
    if decoded.bytes().any(|b| b == 0) {
        return None;
    }
    for segment in decoded.split('/') {
        if segment == ".." {
            return None;
        }
    }
    Some(decoded)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_digit(*bytes.get(i + 1)?)?;
            let lo = hex_digit(*bytes.get(i + 2)?)?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Convert a hex character to its numeric value
pub(crate) fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_crlf() {
        let buf = b"GET / HTTP/1.0\r\nHost: x\r\n\r\nbody";
        assert_eq!(find_terminator(buf), Some(27));
        assert_eq!(&buf[27..], b"body");
    }

    #[test]
    fn test_terminator_lf_only() {
        let buf = b"GET / HTTP/1.0\n\n";
        assert_eq!(find_terminator(buf), Some(buf.len()));
    }

    #[test]
    fn test_terminator_double_cr() {
        let buf = b"GET / HTTP/1.0\r\r\n\r\r\nrest";
        assert_eq!(find_terminator(buf), Some(buf.len() - 4));
    }

    #[test]
    fn test_terminator_priority() {
        // \r\n\r\n wins over a later \n\n
        let buf = b"GET / HTTP/1.0\r\n\r\n\n\n";
        assert_eq!(find_terminator(buf), Some(18));
    }

    #[test]
    fn test_no_terminator() {
        assert_eq!(find_terminator(b"GET / HTTP/1.0\r\n"), None);
    }

    #[test]
    fn test_normalize_plain() {
        assert_eq!(normalize_uri("/stream.ogg"), Some("/stream.ogg".to_string()));
    }

    #[test]
    fn test_normalize_percent() {
        assert_eq!(normalize_uri("/a%20b"), Some("/a b".to_string()));
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert_eq!(normalize_uri("/../etc/passwd"), None);
        assert_eq!(normalize_uri("/a/%2e%2e/b"), None);
        assert_eq!(normalize_uri("no-slash"), None);
    }
}
