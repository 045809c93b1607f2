//! Completion forwarding: translate, send through the selector, relay back.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use llamagate_backends::BackendCall;
use llamagate_core::{BackendConfig, GatewayError, Result};
use llamagate_http::{ChunkedWriter, InboundRequest, Response, StatusCode};
use llamagate_translate::{
    from_provider_fragment, provider_headers, to_provider_request, translate_fragment, ChatResult,
    LlamaRequest,
};
use llamagate_upstream::{CollectSink, Fragment, FragmentSink, UpstreamRequest, MAX_COLLECTED_BYTES};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::server::GatewayState;

/// Content type of streamed completion bodies.
const STREAM_CONTENT_TYPE: &str = "application/json";

/// How a streamed completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The upstream body ended or sent its done sentinel.
    Completed,
    /// Writing to the caller failed; nothing more is sent.
    ClientDisconnected,
    /// The upstream failed after results were already relayed.
    Interrupted(String),
}

/// Build the outbound request for one attempt against `backend`.
pub fn upstream_request(request: &LlamaRequest, backend: &BackendConfig) -> Result<UpstreamRequest> {
    let body = to_provider_request(request, backend).to_json()?;
    let mut upstream =
        UpstreamRequest::post(backend.target()?, body).authorization(backend.auth_header());
    for (name, value) in provider_headers(backend) {
        upstream = upstream.header(name, value);
    }
    Ok(upstream)
}

/// Handle a completion request. Returns whether it succeeded.
pub(crate) async fn handle_completion<S>(
    state: &Arc<GatewayState>,
    inbound: &InboundRequest,
    stream: &mut S,
) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let request = match LlamaRequest::from_body(&inbound.body) {
        Ok(request) => request,
        Err(e) => {
            warn!("rejecting completion with malformed body: {}", e);
            state.metrics.record_error(None, "malformed_request");
            let response =
                Response::error(StatusCode::BAD_REQUEST, &format!("Invalid request body: {}", e));
            if let Err(e) = response.write_to(stream).await {
                debug!("failed to write response: {}", e);
            }
            return false;
        }
    };

    if request.is_stream() {
        stream_completion(state, &request, stream).await
    } else {
        buffered_completion(state, &request, stream).await
    }
}

struct BufferedCompletion<'a> {
    state: &'a GatewayState,
    request: &'a LlamaRequest,
}

#[async_trait]
impl<'a> BackendCall for BufferedCompletion<'a> {
    type Output = String;

    async fn call(&mut self, backend: &BackendConfig, attempt: usize) -> Result<String> {
        let upstream = upstream_request(self.request, backend)?;
        let mut sink = CollectSink::new();
        self.state
            .upstream
            .send(&backend.name, &upstream, &mut sink)
            .await?;
        if sink.overflowed() {
            return Err(GatewayError::http(format!(
                "upstream response exceeds {MAX_COLLECTED_BYTES} bytes"
            )));
        }

        let fragments: Vec<&str> = sink.data().collect();
        debug!(backend = %backend.name, attempt, fragments = fragments.len(), "buffered upstream body");
        buffered_body(&fragments, self.request, backend)
            .ok_or_else(|| GatewayError::EmptyResponse(backend.name.clone()))
    }
}

/// Collapse the data fragments of a non-streamed forward into one body.
///
/// A single fragment is the usual case. Upstreams that stream regardless
/// get their texts joined into one terminal result. `None` when there was
/// nothing at all.
pub fn buffered_body(
    fragments: &[&str],
    request: &LlamaRequest,
    backend: &BackendConfig,
) -> Option<String> {
    match fragments {
        [] => None,
        [only] => Some(from_provider_fragment(only, request, backend)),
        many => {
            let content: String = many
                .iter()
                .filter_map(|fragment| translate_fragment(fragment, true))
                .map(|result| result.content)
                .collect();
            Some(ChatResult::new(content, true).to_json())
        }
    }
}

async fn buffered_completion<S>(state: &Arc<GatewayState>, request: &LlamaRequest, stream: &mut S) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let mut call = BufferedCompletion {
        state: state.as_ref(),
        request,
    };

    let (response, ok) = match state.selector.forward(&mut call).await {
        Ok(body) => (Response::json_text(StatusCode::OK, body), true),
        Err(e) => {
            warn!("completion failed: {}", e);
            state.metrics.record_error(None, e.kind());
            let body = ChatResult::error(&e).to_json();
            (Response::json_text(StatusCode::INTERNAL_SERVER_ERROR, body), false)
        }
    };

    if let Err(e) = response.write_to(stream).await {
        debug!("failed to write completion response: {}", e);
        return false;
    }
    ok
}

struct StreamCompletion<'a, W> {
    state: &'a GatewayState,
    request: &'a LlamaRequest,
    writer: ChunkedWriter<W>,
    /// Chunks relayed across every attempt so far.
    emitted: usize,
}

#[async_trait]
impl<'a, W> BackendCall for StreamCompletion<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    type Output = StreamOutcome;

    async fn call(&mut self, backend: &BackendConfig, attempt: usize) -> Result<StreamOutcome> {
        let upstream = upstream_request(self.request, backend)?;
        let mut sink = ClientSink {
            writer: &mut self.writer,
            emitted: 0,
            client_gone: false,
        };
        let result = self
            .state
            .upstream
            .send(&backend.name, &upstream, &mut sink)
            .await;

        self.emitted += sink.emitted;
        if sink.client_gone {
            return Ok(StreamOutcome::ClientDisconnected);
        }

        match result {
            Ok(delivery) if delivery.fragments == 0 && self.emitted == 0 => {
                Err(GatewayError::EmptyResponse(backend.name.clone()))
            }
            Ok(delivery) => {
                debug!(backend = %backend.name, attempt, fragments = delivery.fragments, "stream complete");
                Ok(StreamOutcome::Completed)
            }
            // The caller has already seen output from this backend; switching
            // to another one would splice two answers together.
            Err(e) if self.emitted > 0 => {
                warn!(backend = %backend.name, "upstream failed mid-stream: {}", e);
                Ok(StreamOutcome::Interrupted(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Relays translated fragments to the caller as they arrive.
struct ClientSink<'w, W> {
    writer: &'w mut ChunkedWriter<W>,
    emitted: usize,
    client_gone: bool,
}

#[async_trait]
impl<'w, W> FragmentSink for ClientSink<'w, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn on_fragment(&mut self, fragment: Fragment) -> ControlFlow<()> {
        let text = match fragment {
            Fragment::Done => return ControlFlow::Break(()),
            Fragment::Data(text) => text,
        };

        let Some(result) = translate_fragment(&text, true) else {
            return ControlFlow::Continue(());
        };

        if let Err(e) = self.writer.write_chunk(&event_bytes(&result)).await {
            debug!("client went away mid-stream: {}", e);
            self.client_gone = true;
            return ControlFlow::Break(());
        }
        self.emitted += 1;

        if result.stop {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// One streamed unit: `data: <json>` followed by a blank line.
fn event_bytes(result: &ChatResult) -> Vec<u8> {
    let mut event = result.to_sse().into_bytes();
    event.extend_from_slice(b"\n\n");
    event
}

async fn stream_completion<S>(state: &Arc<GatewayState>, request: &LlamaRequest, stream: &mut S) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let writer = match ChunkedWriter::begin(&mut *stream, STREAM_CONTENT_TYPE).await {
        Ok(writer) => writer,
        Err(e) => {
            debug!("client went away before the stream started: {}", e);
            return false;
        }
    };

    let mut call = StreamCompletion {
        state: state.as_ref(),
        request,
        writer,
        emitted: 0,
    };

    let failure = match state.selector.forward(&mut call).await {
        Ok(StreamOutcome::Completed) => None,
        Ok(StreamOutcome::ClientDisconnected) => return false,
        Ok(StreamOutcome::Interrupted(message)) => Some(message),
        Err(e) => {
            warn!("streamed completion failed: {}", e);
            state.metrics.record_error(None, e.kind());
            Some(e.to_string())
        }
    };

    let writer = &mut call.writer;
    if let Some(message) = &failure {
        if let Err(e) = writer.write_chunk(&event_bytes(&ChatResult::error(message))).await {
            debug!("failed to write error event: {}", e);
            return false;
        }
    }
    if let Err(e) = writer.finish().await {
        debug!("failed to terminate stream: {}", e);
        return false;
    }

    info!(chunks = call.emitted, "streamed completion finished");
    failure.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamagate_core::Provider;

    fn backend(provider: Provider) -> BackendConfig {
        BackendConfig::new("b", provider, "https://api.example.com/v1/messages", "m")
            .with_api_key("sk-1")
    }

    #[test]
    fn anthropic_request_carries_provider_headers() {
        let request = LlamaRequest {
            prompt: Some("hi".into()),
            ..Default::default()
        };
        let upstream = upstream_request(&request, &backend(Provider::Anthropic)).unwrap();
        let text = String::from_utf8(upstream.to_bytes()).unwrap();

        assert!(text.starts_with("POST /v1/messages HTTP/1.1\r\n"));
        assert!(text.contains("Authorization: Bearer sk-1\r\n"));
        assert!(text.contains("x-api-key: sk-1\r\n"));
        assert!(text.contains("anthropic-version: 2023-06-01\r\n"));
        assert!(text.contains(r#""max_tokens":1024"#));
    }

    #[test]
    fn invalid_endpoint_fails_the_attempt() {
        let bad = BackendConfig::new("bad", Provider::OpenAI, "ftp://nowhere", "m");
        assert!(upstream_request(&LlamaRequest::default(), &bad).is_err());
    }

    #[test]
    fn buffered_body_single_and_many() {
        let b = backend(Provider::OpenAI);
        let request = LlamaRequest::default();

        assert_eq!(buffered_body(&[], &request, &b), None);
        assert_eq!(
            buffered_body(&[r#"{"choices":[{"message":{"content":"X"}}]}"#], &request, &b).unwrap(),
            r#"{"content":"X","stop":true,"id_slot":0}"#
        );

        let deltas = [
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"He"}}]}"#,
            r#"{"choices":[{"delta":{"content":"llo"},"finish_reason":"stop"}]}"#,
        ];
        assert_eq!(
            buffered_body(&deltas, &request, &b).unwrap(),
            r#"{"content":"Hello","stop":true,"id_slot":0}"#
        );
    }

    #[test]
    fn events_end_with_blank_line() {
        let bytes = event_bytes(&ChatResult::new("a", false));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "data: {\"content\":\"a\",\"stop\":false,\"id_slot\":0}\n\n"
        );
    }
}
