//! Minimal HTTP/1.1 request parsing and response serialization.
//!
//! Only what the wallet hop needs: POST with `Content-Length` (required)
//! and `Content-Type: application/x-protobuf`. Recognized auxiliary
//! headers are `Authorization`, `X-Request-ID`, and `User-Agent`; anything
//! else is skipped. The server does not route on the path.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

pub const MAX_HEADER_SIZE: usize = 8 * 1024;
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpParseError {
    /// Request line or headers are not valid HTTP/1.1; fatal to the
    /// connection.
    #[error("malformed HTTP request: {0}")]
    Malformed(String),

    #[error("request head exceeds {MAX_HEADER_SIZE} bytes")]
    HeaderTooLarge,

    #[error("Content-Length header is required")]
    MissingContentLength,

    #[error("body of {0} bytes exceeds the {MAX_BODY_SIZE} byte limit")]
    BodyTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,
}

impl HttpParseError {
    pub fn status_code(&self) -> u16 {
        match self {
            HttpParseError::BodyTooLarge(_) => 413,
            _ => 400,
        }
    }
}

/// Parsed request line and the headers this service recognizes.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub content_length: usize,
    pub content_type: Option<String>,
    pub keep_alive: bool,
    pub authorization: Option<String>,
    pub request_id: Option<String>,
    pub user_agent: Option<String>,
}

/// Read and parse one request head (request line + headers up to the blank
/// line). `Ok(None)` means the peer closed the connection cleanly between
/// requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<HttpRequestHead>, HttpParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = HttpRequestHead {
        keep_alive: true,
        ..HttpRequestHead::default()
    };
    let mut total = 0usize;
    let mut line = String::new();
    let mut saw_content_length = false;

    // Request line.
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| HttpParseError::Malformed(e.to_string()))?;
        if n == 0 {
            return if total == 0 {
                Ok(None)
            } else {
                Err(HttpParseError::ConnectionClosed)
            };
        }
        total += n;
        if total > MAX_HEADER_SIZE {
            return Err(HttpParseError::HeaderTooLarge);
        }
        // Tolerate stray blank lines before the request line.
        if !line.trim_end().is_empty() {
            break;
        }
    }

    let request_line = line.trim_end();
    let mut parts = request_line.split_whitespace();
    head.method = parts
        .next()
        .ok_or_else(|| HttpParseError::Malformed("empty request line".to_string()))?
        .to_string();
    head.path = parts
        .next()
        .ok_or_else(|| HttpParseError::Malformed("missing request path".to_string()))?
        .to_string();
    head.version = parts
        .next()
        .ok_or_else(|| HttpParseError::Malformed("missing HTTP version".to_string()))?
        .to_string();
    if parts.next().is_some() {
        return Err(HttpParseError::Malformed("extra request line tokens".to_string()));
    }
    if !head.version.starts_with("HTTP/1.") {
        return Err(HttpParseError::Malformed(format!(
            "unsupported version: {}",
            head.version
        )));
    }
    // HTTP/1.0 defaults to close, 1.1 to keep-alive.
    head.keep_alive = head.version != "HTTP/1.0";

    // Headers until the blank line.
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| HttpParseError::Malformed(e.to_string()))?;
        if n == 0 {
            return Err(HttpParseError::ConnectionClosed);
        }
        total += n;
        if total > MAX_HEADER_SIZE {
            return Err(HttpParseError::HeaderTooLarge);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| HttpParseError::Malformed(format!("bad header line: {trimmed}")))?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let length: usize = value
                    .parse()
                    .map_err(|_| HttpParseError::Malformed(format!("bad Content-Length: {value}")))?;
                head.content_length = length;
                saw_content_length = true;
            }
            "content-type" => head.content_type = Some(value.to_string()),
            "connection" => {
                let value = value.to_ascii_lowercase();
                if value.contains("close") {
                    head.keep_alive = false;
                } else if value.contains("keep-alive") {
                    head.keep_alive = true;
                }
            }
            "authorization" => head.authorization = Some(value.to_string()),
            "x-request-id" => head.request_id = Some(value.to_string()),
            "user-agent" => head.user_agent = Some(value.to_string()),
            _ => {}
        }
    }

    if !saw_content_length {
        return Err(HttpParseError::MissingContentLength);
    }
    if head.content_length > MAX_BODY_SIZE {
        return Err(HttpParseError::BodyTooLarge(head.content_length));
    }
    Ok(Some(head))
}

/// Read exactly `content_length` body bytes.
pub async fn read_body<R>(reader: &mut R, content_length: usize) -> Result<Vec<u8>, HttpParseError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| HttpParseError::ConnectionClosed)?;
    Ok(body)
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serialize a response with the fixed headers this service emits.
pub fn serialize_response(
    status: u16,
    body: &[u8],
    keep_alive: bool,
    request_id: Option<&str>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(
        format!("HTTP/1.1 {status} {}\r\n", status_reason(status)).as_bytes(),
    );
    out.extend_from_slice(b"Content-Type: application/x-protobuf\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    if let Some(request_id) = request_id {
        out.extend_from_slice(format!("X-Request-ID: {request_id}\r\n").as_bytes());
    }
    out.extend_from_slice(if keep_alive {
        b"Connection: keep-alive\r\n"
    } else {
        b"Connection: close\r\n"
    });
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Result<Option<HttpRequestHead>, HttpParseError> {
        let mut reader = BufReader::new(Cursor::new(raw.as_bytes().to_vec()));
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_post_request() {
        let head = parse(
            "POST /api/v1/sign HTTP/1.1\r\n\
             Content-Type: application/x-protobuf\r\n\
             Content-Length: 42\r\n\
             Authorization: Bearer token\r\n\
             X-Request-ID: req-7\r\n\
             User-Agent: wallet/1.0\r\n\
             \r\n",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/api/v1/sign");
        assert_eq!(head.content_length, 42);
        assert_eq!(head.content_type.as_deref(), Some("application/x-protobuf"));
        assert_eq!(head.request_id.as_deref(), Some("req-7"));
        assert_eq!(head.authorization.as_deref(), Some("Bearer token"));
        assert!(head.keep_alive);
    }

    #[tokio::test]
    async fn test_connection_close_honored() {
        let head = parse(
            "POST / HTTP/1.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!head.keep_alive);
    }

    #[tokio::test]
    async fn test_missing_content_length_rejected() {
        let err = parse("POST / HTTP/1.1\r\nContent-Type: application/x-protobuf\r\n\r\n")
            .await
            .unwrap_err();
        assert_eq!(err, HttpParseError::MissingContentLength);
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_garbage_request_line_rejected() {
        assert!(matches!(
            parse("NOT-HTTP\r\n\r\n").await,
            Err(HttpParseError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_declared_rejected() {
        let err = parse(&format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE + 1
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, HttpParseError::BodyTooLarge(_)));
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let raw = format!(
            "POST / HTTP/1.1\r\nContent-Length: 0\r\nX-Pad: {}\r\n\r\n",
            "a".repeat(MAX_HEADER_SIZE)
        );
        assert_eq!(parse(&raw).await.unwrap_err(), HttpParseError::HeaderTooLarge);
    }

    #[tokio::test]
    async fn test_clean_close_between_requests() {
        assert!(parse("").await.unwrap().is_none());
    }

    #[test]
    fn test_serialize_response_shape() {
        let raw = serialize_response(200, b"abc", true, Some("req-1"));
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("X-Request-ID: req-1\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }
}
