//! Minimal HTTP/1.x framing for the event loop.
//!
//! Only the request head is parsed; bodies are ignored and every response
//! closes the connection.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest request head accepted before the connection is rejected.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
}

/// Why a request head was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooLarge,
    InvalidUtf8,
    MalformedRequestLine,
}

impl ParseError {
    /// Status code of the rejection response.
    pub fn status(self) -> u16 {
        match self {
            ParseError::TooLarge => 431,
            ParseError::InvalidUtf8 | ParseError::MalformedRequestLine => 400,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ParseError::TooLarge => "request head too large",
            ParseError::InvalidUtf8 => "request head is not valid UTF-8",
            ParseError::MalformedRequestLine => "malformed request line",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Result of scanning a read buffer for a request head.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Head terminator not seen yet.
    NeedData,
    /// Complete head.
    Complete(RequestHead),
    /// Malformed or oversized head.
    Error(ParseError),
}

/// Scan `input` for a complete request head.
pub fn parse_request_head(input: &[u8]) -> ParseResult {
    let end = match find_head_end(input) {
        Some(end) => end,
        None if input.len() > MAX_HEAD_SIZE => return ParseResult::Error(ParseError::TooLarge),
        None => return ParseResult::NeedData,
    };

    let head = match std::str::from_utf8(&input[..end]) {
        Ok(head) => head,
        Err(_) => return ParseResult::Error(ParseError::InvalidUtf8),
    };

    let request_line = head.split("\r\n").next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
            ParseResult::Complete(RequestHead {
                method: method.to_string(),
                path: path.to_string(),
                version: version.to_string(),
            })
        }
        _ => ParseResult::Error(ParseError::MalformedRequestLine),
    }
}

fn find_head_end(input: &[u8]) -> Option<usize> {
    input.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Response produced by an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    /// Serialize status line, headers and body.
    pub fn encode(&self) -> Bytes {
        let head = self.head();
        let mut out = BytesMut::with_capacity(head.len() + self.body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Serialize status line and headers only, as the answer to `HEAD`.
    ///
    /// `Content-Length` still carries the length of the omitted body.
    pub fn encode_head(&self) -> Bytes {
        Bytes::from(self.head())
    }

    fn head(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len()
        )
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_head() {
        let input = b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(
            parse_request_head(input),
            ParseResult::Complete(RequestHead {
                method: "GET".into(),
                path: "/status".into(),
                version: "HTTP/1.1".into(),
            })
        );
    }

    #[test]
    fn test_parse_partial_head() {
        assert_eq!(
            parse_request_head(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            ParseResult::NeedData
        );
        assert_eq!(parse_request_head(b""), ParseResult::NeedData);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_request_head(b"hello\r\n\r\n"),
            ParseResult::Error(_)
        ));
        assert!(matches!(
            parse_request_head(b"GET / FTP/1.0\r\n\r\n"),
            ParseResult::Error(_)
        ));

        let oversized = vec![b'a'; MAX_HEAD_SIZE + 1];
        assert_eq!(
            parse_request_head(&oversized),
            ParseResult::Error(ParseError::TooLarge)
        );
        assert_eq!(ParseError::TooLarge.status(), 431);
        assert_eq!(
            parse_request_head(b"GET /\r\n\r\n"),
            ParseResult::Error(ParseError::MalformedRequestLine)
        );
        assert_eq!(ParseError::MalformedRequestLine.status(), 400);
        assert_eq!(
            parse_request_head(b"GET /\xff HTTP/1.1\r\n\r\n"),
            ParseResult::Error(ParseError::InvalidUtf8)
        );
    }

    #[test]
    fn test_encode_response() {
        let encoded = Response::text(404, "nope").encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn test_encode_head_omits_body() {
        let response = Response::text(200, "status");
        let encoded = response.encode_head();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(response.encode().len(), encoded.len() + 6);
    }
}
