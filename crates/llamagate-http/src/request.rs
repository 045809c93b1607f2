//! Inbound request parsing.
//!
//! Requests are read in full before routing: the head up to `\r\n\r\n`, then
//! exactly `Content-Length` body bytes. Chunked request bodies are not
//! accepted.

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HttpError, Result};

/// Hard cap on head plus body for one inbound request.
pub const MAX_REQUEST_BYTES: usize = 20 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// One parsed inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Request target exactly as sent, query string included.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InboundRequest {
    /// Header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Read one request using [`MAX_REQUEST_BYTES`] as the cap.
pub async fn read_request<R>(reader: &mut R) -> Result<InboundRequest>
where
    R: AsyncRead + Unpin,
{
    read_request_with_limit(reader, MAX_REQUEST_BYTES).await
}

/// Read one request, failing once more than `limit` bytes have accumulated.
///
/// Returns [`HttpError::Incomplete`] when the peer closes before the header
/// terminator or before the declared body length has arrived.
pub async fn read_request_with_limit<R>(reader: &mut R, limit: usize) -> Result<InboundRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanned = 0;

    let head_end = loop {
        if let Some(pos) = find_header_end(&buf, scanned) {
            break pos;
        }
        // The terminator may straddle two reads.
        scanned = buf.len().saturating_sub(3);

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Incomplete {
                received: buf.len(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return Err(HttpError::TooLarge { limit });
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| HttpError::Header("request head is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");
    let (method, path) = parse_request_line(lines.next().unwrap_or_default())?;
    let headers = parse_header_lines(lines)?;

    let body_start = head_end + 4;
    let content_length = content_length(&headers)?.unwrap_or(0);
    if body_start.saturating_add(content_length) > limit {
        return Err(HttpError::TooLarge { limit });
    }

    let mut body = buf.split_off(body_start.min(buf.len()));
    // Anything past the declared length would be a pipelined request; ignore it.
    body.truncate(content_length);

    while body.len() < content_length {
        let want = (content_length - body.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HttpError::Incomplete {
                received: body_start + body.len(),
            });
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(InboundRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Position of the first `\r\n\r\n`, searching from `from`.
pub fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + from)
}

fn parse_request_line(line: &str) -> Result<(Method, String)> {
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(HttpError::StartLine(line.to_string())),
    };

    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::StartLine(line.to_string()));
    }

    let method =
        Method::from_bytes(method.as_bytes()).map_err(|_| HttpError::StartLine(line.to_string()))?;

    Ok((method, target.to_string()))
}

/// Parse `Name: value` lines into a case-insensitive map.
///
/// Empty lines are skipped so callers can pass a head that still carries its
/// trailing CRLF.
pub fn parse_header_lines<'a, I>(lines: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Header(line.to_string()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HttpError::Header(line.to_string()))?;
        let value =
            HeaderValue::from_str(value.trim()).map_err(|_| HttpError::Header(line.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// The declared `Content-Length`, if any.
pub fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|_| HttpError::ContentLength("non-ASCII value".to_string()))?;
            text.trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| HttpError::ContentLength(text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_request_with_body() {
        let raw = b"POST /completion HTTP/1.1\r\nHost: localhost\r\ncontent-length: 15\r\n\r\n{\"prompt\":\"hi\"}";
        let mut reader = &raw[..];

        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.path, "/completion");
        assert_eq!(req.header("Content-Length"), Some("15"));
        assert_eq!(req.body_text(), "{\"prompt\":\"hi\"}");
    }

    #[tokio::test]
    async fn reads_body_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            client
                .write_all(b"POST /completion HTTP/1.1\r\nContent-Le")
                .await
                .unwrap();
            client.write_all(b"ngth: 4\r\n\r").await.unwrap();
            client.write_all(b"\nab").await.unwrap();
            client.write_all(b"cd").await.unwrap();
            client
        });

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.body, b"abcd");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn missing_content_length_means_empty_body() {
        let raw = b"GET /props HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = read_request(&mut &raw[..]).await.unwrap();
        assert_eq!(req.method, Method::GET);
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn eof_before_terminator_is_incomplete() {
        let raw = b"GET /props HTTP/1.1\r\nHost: x\r\n";
        let err = read_request(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HttpError::Incomplete { .. }));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn eof_inside_body_is_incomplete() {
        let raw = b"POST /completion HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let err = read_request(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HttpError::Incomplete { .. }));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(256));
        let err = read_request_with_limit(&mut &raw[..], 128)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::TooLarge { limit: 128 }));
    }

    #[tokio::test]
    async fn declared_body_over_limit_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n";
        let err = read_request_with_limit(&mut &raw[..], 256)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_start_line_is_rejected() {
        let raw = b"hello\r\n\r\n";
        let err = read_request(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, HttpError::StartLine(_)));
    }

    #[test]
    fn header_end_found_across_offset() {
        let buf = b"abc\r\n\r\ndef";
        assert_eq!(find_header_end(buf, 0), Some(3));
        assert_eq!(find_header_end(buf, 2), Some(3));
        assert_eq!(find_header_end(b"\r\n", 0), None);
    }

    #[test]
    fn bad_content_length_is_an_error() {
        let headers = parse_header_lines(["Content-Length: twelve"]).unwrap();
        assert!(content_length(&headers).is_err());
    }
}
