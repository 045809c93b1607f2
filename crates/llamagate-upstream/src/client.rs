//! One request/response exchange with an upstream provider.

use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use llamagate_core::{GatewayError, Result, UpstreamTarget};

use crate::framing::{idle, BodyReader, ResponseReader};
use crate::sink::FragmentSink;
use crate::sse::SseSplitter;
use crate::tls;

/// How much of a non-2xx body is kept for the error message.
pub const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// A POST to be written verbatim on a fresh connection.
#[derive(Clone)]
pub struct UpstreamRequest {
    pub target: UpstreamTarget,
    /// Full `Authorization` value; omitted when empty.
    pub authorization: String,
    pub extra_headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UpstreamRequest {
    pub fn post(target: UpstreamTarget, body: Vec<u8>) -> Self {
        Self {
            target,
            authorization: String::new(),
            extra_headers: Vec::new(),
            body,
        }
    }

    pub fn authorization<S: Into<String>>(mut self, value: S) -> Self {
        self.authorization = value.into();
        self
    }

    pub fn header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Request line, headers and body as a single buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\n",
            self.target.path,
            self.target.host_header()
        );
        if !self.authorization.is_empty() {
            head.push_str(&format!("Authorization: {}\r\n", self.authorization));
        }
        for (name, value) in &self.extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!(
            "Content-Type: application/json\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n",
            self.body.len()
        ));

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

// Keeps credentials out of logs.
impl fmt::Debug for UpstreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamRequest")
            .field("target", &self.target)
            .field("extra_headers", &self.extra_headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// What happened to the fragments of one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Fragments handed to the sink.
    pub fragments: usize,
    /// The sink asked to stop before the body ended.
    pub stopped: bool,
}

/// Raw HTTP/1.1 client. Cheap to clone; every call opens its own connection.
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    timeout: Option<Duration>,
}

impl UpstreamClient {
    /// `timeout` bounds connecting and each individual read or write.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            tls: tls::permissive_connector()?,
            timeout,
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Send `request` and feed the response fragments to `sink`.
    ///
    /// `backend` only labels errors. A non-2xx status becomes
    /// [`GatewayError::UpstreamStatus`] and nothing reaches the sink.
    pub async fn send<K>(
        &self,
        backend: &str,
        request: &UpstreamRequest,
        sink: &mut K,
    ) -> Result<Delivery>
    where
        K: FragmentSink + ?Sized,
    {
        let target = &request.target;
        let stream = self.connect(target).await?;

        if target.tls {
            let name = tls::server_name(&target.host)?;
            let stream = idle(self.timeout, self.tls.connect(name, stream))
                .await
                .map_err(|e| match e {
                    GatewayError::Io(io) => GatewayError::tls(target.host.as_str(), io.to_string()),
                    other => other,
                })?;
            exchange(stream, backend, request, self.timeout, sink).await
        } else {
            exchange(stream, backend, request, self.timeout, sink).await
        }
    }

    async fn connect(&self, target: &UpstreamTarget) -> Result<TcpStream> {
        let host = target.host.trim_start_matches('[').trim_end_matches(']');
        debug!(host = %host, port = target.port, tls = target.tls, "connecting upstream");

        let stream = idle(self.timeout, TcpStream::connect((host, target.port)))
            .await
            .map_err(|e| match e {
                GatewayError::Io(io) => GatewayError::connect(host, target.port, io.to_string()),
                other => other,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY on upstream socket: {}", e);
        }
        Ok(stream)
    }
}

impl fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run one exchange over an already-open stream.
pub async fn exchange<S, K>(
    mut stream: S,
    backend: &str,
    request: &UpstreamRequest,
    timeout: Option<Duration>,
    sink: &mut K,
) -> Result<Delivery>
where
    S: AsyncRead + AsyncWrite + Unpin,
    K: FragmentSink + ?Sized,
{
    idle(timeout, stream.write_all(&request.to_bytes())).await?;
    idle(timeout, stream.flush()).await?;

    let mut reader = ResponseReader::new(stream, timeout);
    let head = reader.read_head().await?;
    let mut body = BodyReader::for_head(&head)?;

    if !head.is_success() {
        let text = body.read_capped(&mut reader, ERROR_BODY_LIMIT).await;
        return Err(GatewayError::upstream_status(backend, head.status, text));
    }

    let mut splitter = SseSplitter::new();
    let mut delivery = Delivery::default();

    while let Some(bytes) = body.next(&mut reader).await? {
        for fragment in splitter.push(&bytes)? {
            delivery.fragments += 1;
            if sink.on_fragment(fragment).await.is_break() {
                delivery.stopped = true;
                return Ok(delivery);
            }
        }
    }

    for fragment in splitter.finish() {
        delivery.fragments += 1;
        if let ControlFlow::Break(()) = sink.on_fragment(fragment).await {
            delivery.stopped = true;
            break;
        }
    }

    debug!(backend, fragments = delivery.fragments, "upstream body consumed");
    Ok(delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use crate::sse::Fragment;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request() -> UpstreamRequest {
        let target = UpstreamTarget::parse("http://127.0.0.1:8080/v1/chat/completions").unwrap();
        UpstreamRequest::post(target, b"{\"model\":\"m\"}".to_vec())
            .authorization("Bearer sk-test")
            .header("anthropic-version", "2023-06-01")
    }

    /// Answer one request on the far end of a duplex pipe with `response`.
    fn serve<B>(response: B) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Vec<u8>>)
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let (client, mut server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if n == 0 || llamagate_http::find_header_end(&seen, 0).is_some() {
                    break;
                }
            }
            // The client may hang up early once it has seen enough.
            let _ = server.write_all(response.as_ref()).await;
            seen
        });
        (client, handle)
    }

    #[test]
    fn request_bytes_have_expected_headers() {
        let bytes = request().to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /v1/chat/completions HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n"));
        assert!(text.contains("Authorization: Bearer sk-test\r\n"));
        assert!(text.contains("anthropic-version: 2023-06-01\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("Content-Length: 13\r\n\r\n{\"model\":\"m\"}"));
    }

    #[test]
    fn empty_authorization_is_omitted() {
        let target = UpstreamTarget::parse("http://localhost/x").unwrap();
        let text = String::from_utf8(UpstreamRequest::post(target, Vec::new()).to_bytes()).unwrap();
        assert!(!text.contains("Authorization"));
        assert!(text.contains("Host: localhost\r\n"));
    }

    #[tokio::test]
    async fn streams_chunked_sse_fragments_in_order() {
        let (stream, server) = serve(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              d\r\ndata: {\"a\":1}\r\n\
              10\r\n\n\ndata: {\"a\":2}\n\r\n\
              f\r\n\ndata: [DONE]\n\n\r\n\
              0\r\n\r\n",
        );
        let mut sink = CollectSink::new();

        let delivery = exchange(stream, "stub", &request(), None, &mut sink)
            .await
            .unwrap();

        assert_eq!(delivery.fragments, 3);
        assert_eq!(
            sink.fragments,
            vec![
                Fragment::Data("{\"a\":1}".into()),
                Fragment::Data("{\"a\":2}".into()),
                Fragment::Done
            ]
        );
        let sent = server.await.unwrap();
        assert!(String::from_utf8_lossy(&sent).starts_with("POST /v1/chat/completions"));
    }

    #[tokio::test]
    async fn non_stream_body_is_one_fragment() {
        let (stream, _server) = serve(
            b"HTTP/1.1 200 OK\r\nContent-Length: 41\r\n\r\n{\"choices\":[{\"message\":{\"content\":\"X\"}}]}",
        );
        let mut sink = CollectSink::new();
        exchange(stream, "stub", &request(), None, &mut sink)
            .await
            .unwrap();
        let data: Vec<&str> = sink.data().collect();
        assert_eq!(data, vec!["{\"choices\":[{\"message\":{\"content\":\"X\"}}]}"]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_error() {
        let (stream, _server) =
            serve(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 12\r\n\r\nbad api key!");
        let mut sink = CollectSink::new();
        let err = exchange(stream, "stub", &request(), None, &mut sink)
            .await
            .unwrap_err();

        match err {
            GatewayError::UpstreamStatus {
                backend,
                status,
                body,
            } => {
                assert_eq!(backend, "stub");
                assert_eq!(status, 401);
                assert_eq!(body, "bad api key!");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(sink.fragments.is_empty());
    }

    struct StopAfterFirst(usize);

    #[async_trait]
    impl FragmentSink for StopAfterFirst {
        async fn on_fragment(&mut self, _fragment: Fragment) -> ControlFlow<()> {
            self.0 += 1;
            ControlFlow::Break(())
        }
    }

    #[tokio::test]
    async fn sink_break_stops_the_exchange() {
        let (stream, _server) = serve(
            b"HTTP/1.1 200 OK\r\n\r\ndata: {\"a\":1}\n\ndata: {\"a\":2}\n\n",
        );
        let mut sink = StopAfterFirst(0);
        let delivery = exchange(stream, "stub", &request(), None, &mut sink)
            .await
            .unwrap();
        assert!(delivery.stopped);
        assert_eq!(sink.0, 1);
    }

    #[tokio::test]
    async fn endless_event_is_cut_off() {
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\ndata: ".to_vec();
        response.resize(response.len() + crate::sse::MAX_EVENT_BYTES + 1024, b'x');
        let (stream, _server) = serve(response);
        let mut sink = CollectSink::new();

        let err = exchange(stream, "stub", &request(), None, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Http(_)));
        assert!(sink.fragments.is_empty());
    }

    #[tokio::test]
    async fn stalled_upstream_times_out() {
        let (stream, _peer) = tokio::io::duplex(4096);
        let mut sink = CollectSink::new();
        let err = exchange(
            stream,
            "stub",
            &request(),
            Some(Duration::from_millis(50)),
            &mut sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(limit) if limit == Duration::from_millis(50)));
        assert_eq!(err.to_string(), "Request timed out after 50ms");
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = UpstreamClient::new(Some(Duration::from_secs(2))).unwrap();
        let target = UpstreamTarget::parse(&format!("http://127.0.0.1:{port}/v1")).unwrap();
        let mut sink = CollectSink::new();
        let err = client
            .send("down", &UpstreamRequest::post(target, Vec::new()), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connect { .. }));
    }
}
