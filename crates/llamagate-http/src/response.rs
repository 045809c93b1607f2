//! Outbound response serialization.
//!
//! Every response carries `Connection: close`; the gateway serves exactly one
//! request per connection.

use http::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// A fixed-length response. `Content-Length` is always derived from `body`.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(status)
            .header("Content-Type", "application/json")
            .body(body))
    }

    /// Plain JSON body that is already encoded.
    pub fn json_text<S: Into<String>>(status: StatusCode, text: S) -> Self {
        Self::new(status)
            .header("Content-Type", "application/json")
            .body(text.into().into_bytes())
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::json_text(status, body)
    }

    pub fn header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Full wire form: status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = status_line(self.status).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

/// Writes a `Transfer-Encoding: chunked` response incrementally.
///
/// Once [`ChunkedWriter::begin`] has returned the status is committed; later
/// failures can only be reported inside the body.
pub struct ChunkedWriter<W> {
    inner: W,
    finished: bool,
}

impl<W> ChunkedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Send `200 OK` with chunked framing and return the writer.
    pub async fn begin(mut inner: W, content_type: &str) -> Result<Self> {
        let head = format!(
            "{}Content-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            status_line(StatusCode::OK),
            content_type
        );
        inner.write_all(head.as_bytes()).await?;
        inner.flush().await?;
        Ok(Self {
            inner,
            finished: false,
        })
    }

    /// Write one chunk. Empty payloads are skipped, since a zero-size chunk
    /// would terminate the body.
    pub async fn write_chunk(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || self.finished {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(payload.len() + 12);
        frame.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write the zero-size terminator. Safe to call more than once.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.inner.write_all(b"0\r\n\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_matches_body() {
        let resp = Response::json_text(StatusCode::OK, r#"{"content":"X"}"#);
        let text = String::from_utf8(resp.to_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"content\":\"X\"}"));
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        let resp = Response::json_text(StatusCode::OK, "\"é\"");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 4\r\n"));
    }

    #[test]
    fn error_body_is_json() {
        let resp = Response::error(StatusCode::NOT_FOUND, "Not found");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"], "Not found");
        assert!(String::from_utf8(resp.to_bytes())
            .unwrap()
            .starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn chunked_writer_frames_payloads() {
        let mut out = Vec::new();
        {
            let mut writer = ChunkedWriter::begin(&mut out, "application/json")
                .await
                .unwrap();
            writer.write_chunk(b"data: {}").await.unwrap();
            writer.write_chunk(b"").await.unwrap();
            writer.write_chunk(&[b'a'; 26]).await.unwrap();
            writer.finish().await.unwrap();
            writer.finish().await.unwrap();
            assert!(writer.is_finished());
        }

        let text = String::from_utf8(out).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(
            body,
            format!("8\r\ndata: {{}}\r\n1a\r\n{}\r\n0\r\n\r\n", "a".repeat(26))
        );
    }
}
