//! Upstream response head and body framing.

use std::future::Future;
use std::time::Duration;

use http::header::TRANSFER_ENCODING;
use http::HeaderMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use llamagate_core::{GatewayError, Result};
use llamagate_http::{content_length, parse_header_lines};

/// Cap on the status line plus headers.
pub const MAX_HEAD_BYTES: usize = 256 * 1024;

const MAX_CHUNK_LINE: usize = 1024;
const READ_SIZE: usize = 16 * 1024;

/// Apply the idle timeout, if any, to one I/O step.
pub(crate) async fn idle<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| GatewayError::Timeout(limit))?
            .map_err(GatewayError::from),
        None => fut.await.map_err(GatewayError::from),
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }
}

/// Buffered reader over the upstream connection.
pub(crate) struct ResponseReader<R> {
    inner: BufReader<R>,
    timeout: Option<Duration>,
}

impl<R> ResponseReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(inner: R, timeout: Option<Duration>) -> Self {
        Self {
            inner: BufReader::new(inner),
            timeout,
        }
    }

    /// One line including its `\n`, at most `limit` bytes. Empty at EOF.
    async fn read_line(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut limited = (&mut self.inner).take(limit as u64);
        idle(self.timeout, limited.read_until(b'\n', &mut line)).await?;
        Ok(line)
    }

    pub(crate) async fn read_head(&mut self) -> Result<ResponseHead> {
        let mut head = String::new();
        loop {
            let budget = MAX_HEAD_BYTES.saturating_sub(head.len());
            if budget == 0 {
                return Err(GatewayError::http("response header too large"));
            }
            let line = self.read_line(budget).await?;
            if line.is_empty() {
                return Err(GatewayError::http(
                    "connection closed while reading response header",
                ));
            }
            if !line.ends_with(b"\n") {
                return Err(GatewayError::http("response header too large"));
            }
            if line == b"\r\n" || line == b"\n" {
                break;
            }
            head.push_str(&String::from_utf8_lossy(&line));
        }

        let mut lines = head.lines();
        let status = parse_status_line(lines.next().unwrap_or_default())?;
        let headers = parse_header_lines(lines.map(str::trim_end))
            .map_err(|e| GatewayError::http(e.to_string()))?;

        Ok(ResponseHead { status, headers })
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        idle(self.timeout, self.inner.read_exact(buf)).await?;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        idle(self.timeout, self.inner.read(buf)).await
    }
}

/// Size of the next chunk, or `None` after the last chunk and its trailers.
async fn read_chunk_size<R>(reader: &mut ResponseReader<R>) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let line = reader.read_line(MAX_CHUNK_LINE).await?;
    if line.is_empty() {
        return Err(GatewayError::http("connection closed before chunk size"));
    }
    let text = String::from_utf8_lossy(&line);
    let size_field = text.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_field, 16)
        .map_err(|_| GatewayError::http(format!("bad chunk size line: {}", text.trim())))?;
    if size > 0 {
        return Ok(Some(size));
    }

    // Trailer section ends at the first empty line.
    loop {
        let trailer = reader.read_line(MAX_CHUNK_LINE).await?;
        if trailer.is_empty() || trailer == b"\r\n" || trailer == b"\n" {
            return Ok(None);
        }
    }
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse::<u16>()
            .map_err(|_| GatewayError::http(format!("bad status line: {line}"))),
        _ => Err(GatewayError::http(format!("bad status line: {line}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// `left` is what remains of the current chunk's data.
    Chunked { left: usize },
    Length(usize),
    UntilEof,
}

/// Pull-based body decoder for one response.
#[derive(Debug)]
pub(crate) struct BodyReader {
    framing: Framing,
    done: bool,
}

impl BodyReader {
    pub(crate) fn for_head(head: &ResponseHead) -> Result<Self> {
        let framing = if head.is_chunked() {
            Framing::Chunked { left: 0 }
        } else {
            match content_length(&head.headers).map_err(|e| GatewayError::http(e.to_string()))? {
                Some(len) => Framing::Length(len),
                None => Framing::UntilEof,
            }
        };
        Ok(Self {
            framing,
            done: false,
        })
    }

    /// Next slice of decoded body bytes, or `None` once the body has ended.
    pub(crate) async fn next<R>(&mut self, reader: &mut ResponseReader<R>) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        if self.done {
            return Ok(None);
        }

        match self.framing {
            Framing::Chunked { left } => self.next_chunk(reader, left).await,
            Framing::Length(remaining) => {
                if remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
                let mut buf = vec![0u8; remaining.min(READ_SIZE)];
                let n = reader.read_some(&mut buf).await?;
                if n == 0 {
                    return Err(GatewayError::http(format!(
                        "connection closed with {remaining} body bytes outstanding"
                    )));
                }
                buf.truncate(n);
                self.framing = Framing::Length(remaining - n);
                Ok(Some(buf))
            }
            Framing::UntilEof => {
                let mut buf = vec![0u8; READ_SIZE];
                let n = reader.read_some(&mut buf).await?;
                if n == 0 {
                    self.done = true;
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }

    /// Chunk data is handed out in bounded reads; the size line only sets
    /// how much is still owed.
    async fn next_chunk<R>(&mut self, reader: &mut ResponseReader<R>, left: usize) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let left = if left == 0 {
            match read_chunk_size(reader).await? {
                Some(size) => size,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        } else {
            left
        };

        let mut buf = vec![0u8; left.min(READ_SIZE)];
        let n = reader.read_some(&mut buf).await?;
        if n == 0 {
            return Err(GatewayError::http(format!(
                "connection closed with {left} chunk bytes outstanding"
            )));
        }
        buf.truncate(n);

        let left = left - n;
        if left == 0 {
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await?;
            if &crlf != b"\r\n" {
                return Err(GatewayError::http("chunk data not followed by CRLF"));
            }
        }
        self.framing = Framing::Chunked { left };
        Ok(Some(buf))
    }

    /// Read up to `limit` body bytes for an error message, ignoring failures.
    pub(crate) async fn read_capped<R>(&mut self, reader: &mut ResponseReader<R>, limit: usize) -> String
    where
        R: AsyncRead + Unpin,
    {
        let mut body = Vec::new();
        while body.len() < limit {
            match self.next(reader).await {
                Ok(Some(bytes)) => body.extend_from_slice(&bytes),
                _ => break,
            }
        }
        body.truncate(limit);
        String::from_utf8_lossy(&body).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(raw: &[u8]) -> Result<(ResponseHead, Vec<u8>)> {
        let mut reader = ResponseReader::new(raw, None);
        let head = reader.read_head().await?;
        let mut body = BodyReader::for_head(&head)?;
        let mut out = Vec::new();
        while let Some(bytes) = body.next(&mut reader).await? {
            out.extend_from_slice(&bytes);
        }
        Ok((head, out))
    }

    #[tokio::test]
    async fn decodes_chunked_body_with_extensions_and_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let (head, body) = decode(raw).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn decodes_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\nbodyEXTRA";
        let (_, body) = decode(raw).await.unwrap();
        assert_eq!(body, b"body");
    }

    #[tokio::test]
    async fn reads_to_eof_without_framing_headers() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{\"x\":1}";
        let (_, body) = decode(raw).await.unwrap();
        assert_eq!(body, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn truncated_chunk_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\na\r\nabc";
        assert!(decode(raw).await.is_err());
    }

    #[tokio::test]
    async fn huge_chunk_size_is_read_incrementally() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7fffffffffff\r\nabc";
        let mut reader = ResponseReader::new(&raw[..], None);
        let head = reader.read_head().await.unwrap();
        let mut body = BodyReader::for_head(&head).unwrap();

        assert_eq!(body.next(&mut reader).await.unwrap().unwrap(), b"abc");
        let err = body.next(&mut reader).await.unwrap_err();
        assert!(matches!(err, GatewayError::Http(_)));
        assert!(err.to_string().contains("outstanding"));
    }

    #[tokio::test]
    async fn max_and_overflowing_chunk_sizes_are_errors() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        assert!(matches!(decode(raw).await, Err(GatewayError::Http(_))));

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1ffffffffffffffff\r\nabc";
        let err = decode(raw).await.unwrap_err();
        assert!(err.to_string().contains("bad chunk size"));
    }

    #[tokio::test]
    async fn chunk_larger_than_one_read_is_split() {
        let data = vec![b'z'; READ_SIZE + 5];
        let mut raw = format!("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n", data.len()).into_bytes();
        raw.extend_from_slice(&data);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut reader = ResponseReader::new(&raw[..], None);
        let head = reader.read_head().await.unwrap();
        let mut body = BodyReader::for_head(&head).unwrap();
        let mut reads = Vec::new();
        while let Some(bytes) = body.next(&mut reader).await.unwrap() {
            assert!(bytes.len() <= READ_SIZE);
            reads.push(bytes);
        }
        assert!(reads.len() >= 2);
        assert_eq!(reads.concat(), data);
    }

    #[tokio::test]
    async fn short_content_length_body_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(decode(raw).await.is_err());
    }

    #[tokio::test]
    async fn head_without_terminator_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n";
        assert!(decode(raw).await.is_err());
    }

    #[tokio::test]
    async fn oversized_head_is_an_error() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 10));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = decode(&raw).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn error_body_is_capped() {
        let raw = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 11\r\n\r\noverloaded!";
        let mut reader = ResponseReader::new(&raw[..], None);
        let head = reader.read_head().await.unwrap();
        assert!(!head.is_success());
        let mut body = BodyReader::for_head(&head).unwrap();
        assert_eq!(body.read_capped(&mut reader, 4).await, "over");
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found").unwrap(), 404);
        assert!(parse_status_line("SPDY/3 200").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
    }
}
