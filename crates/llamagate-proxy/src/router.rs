//! Per-connection request handling and path dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use llamagate_http::{read_request, HttpError, InboundRequest, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::forward;
use crate::handlers;
use crate::server::GatewayState;

/// Inbound routes, matched by case-insensitive substring of the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Completion,
    Template,
    Detokenize,
    Tokenize,
    Slot,
    Props,
    Metrics,
    NotFound,
}

impl Route {
    /// First match wins. `detokenize` is checked before `tokenize`, which it
    /// contains.
    pub fn for_path(path: &str) -> Self {
        let path = path.to_ascii_lowercase();
        if path.contains("completion") {
            Route::Completion
        } else if path.contains("template") {
            Route::Template
        } else if path.contains("detokenize") {
            Route::Detokenize
        } else if path.contains("tokenize") {
            Route::Tokenize
        } else if path.contains("slot") {
            Route::Slot
        } else if path.contains("props") || path.contains("health") {
            Route::Props
        } else if path.contains("metrics") {
            Route::Metrics
        } else {
            Route::NotFound
        }
    }

    /// Label used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Route::Completion => "completion",
            Route::Template => "template",
            Route::Detokenize => "detokenize",
            Route::Tokenize => "tokenize",
            Route::Slot => "slot",
            Route::Props => "props",
            Route::Metrics => "metrics",
            Route::NotFound => "not_found",
        }
    }
}

/// Keeps the active-connections gauge honest on every exit path.
struct ConnectionGuard(Arc<GatewayState>);

impl ConnectionGuard {
    fn new(state: &Arc<GatewayState>) -> Self {
        state.connection_opened();
        Self(Arc::clone(state))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Serve exactly one request on `stream`, then close it.
pub(crate) async fn serve_connection<S>(state: Arc<GatewayState>, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _guard = ConnectionGuard::new(&state);

    let request = match read_inbound(&state, &mut stream).await {
        Ok(request) => request,
        Err(e) => {
            if e.is_disconnect() {
                debug!(%peer, "client closed before sending a full request: {}", e);
            } else {
                warn!(%peer, "dropping malformed request: {}", e);
            }
            state.metrics.record_error(None, "malformed_request");
            return;
        }
    };

    let route = Route::for_path(&request.path);
    debug!(%peer, method = %request.method, path = %request.path, route = route.name(), "request");

    let started = Instant::now();
    state.metrics.record_request_start(route.name());

    let success = dispatch(&state, route, &request, &mut stream).await;

    state
        .metrics
        .record_request_end(route.name(), success, Some(started.elapsed().as_secs_f64()));

    if let Err(e) = stream.shutdown().await {
        debug!(%peer, "error closing connection: {}", e);
    }
}

async fn read_inbound<S>(state: &GatewayState, stream: &mut S) -> Result<InboundRequest, HttpError>
where
    S: AsyncRead + Unpin,
{
    match state.client_read_timeout {
        Some(limit) => match tokio::time::timeout(limit, read_request(stream)).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out reading request",
            ))),
        },
        None => read_request(stream).await,
    }
}

/// Run the handler for `route`. Returns whether the request succeeded.
async fn dispatch<S>(
    state: &Arc<GatewayState>,
    route: Route,
    request: &InboundRequest,
    stream: &mut S,
) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let response = match route {
        Route::Completion => return forward::handle_completion(state, request, stream).await,
        Route::Template => handlers::template(&state.selector),
        Route::Detokenize => handlers::detokenize(),
        Route::Tokenize => handlers::tokenize(),
        Route::Slot => handlers::slot(),
        Route::Props => handlers::props(&state.selector),
        Route::Metrics => handlers::metrics(state.metrics.as_ref()),
        Route::NotFound => Response::error(
            StatusCode::NOT_FOUND,
            &format!("Endpoint not found: {}", request.path),
        ),
    };

    let ok = response.status.is_success();
    if let Err(e) = response.write_to(stream).await {
        debug!("failed to write response: {}", e);
        return false;
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_match_case_insensitive_substrings() {
        assert_eq!(Route::for_path("/completion"), Route::Completion);
        assert_eq!(Route::for_path("/v1/Completions"), Route::Completion);
        assert_eq!(Route::for_path("/apply-template"), Route::Template);
        assert_eq!(Route::for_path("/detokenize"), Route::Detokenize);
        assert_eq!(Route::for_path("/TOKENIZE"), Route::Tokenize);
        assert_eq!(Route::for_path("/slots"), Route::Slot);
        assert_eq!(Route::for_path("/props"), Route::Props);
        assert_eq!(Route::for_path("/health"), Route::Props);
        assert_eq!(Route::for_path("/metrics"), Route::Metrics);
        assert_eq!(Route::for_path("/nope"), Route::NotFound);
    }

    #[test]
    fn first_match_wins() {
        // Contains both "completion" and "template".
        assert_eq!(Route::for_path("/template/completion"), Route::Completion);
        assert_eq!(Route::for_path("/slot/health"), Route::Slot);
    }
}
