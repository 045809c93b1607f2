//! Listener lifecycle: bind with port fallback, accept loop, stop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llamagate_backends::BackendSelector;
use llamagate_config::ListenerConfig;
use llamagate_core::{BackendConfig, GatewayError, Result};
use llamagate_telemetry::{MetricsRecorder, NoopMetricsRecorder};
use llamagate_upstream::UpstreamClient;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router;

/// How long [`ProxyServer::stop`] waits for the accept loop to exit.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Tunables for the listener and the forwarding path.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Ports tried, starting at the requested one, before giving up.
    pub max_port_fallbacks: u16,
    /// Forwarding attempts per completion request.
    pub max_attempts: usize,
    /// Idle timeout for upstream connect, reads and writes.
    pub upstream_timeout: Option<Duration>,
    /// Deadline for reading one inbound request.
    pub client_read_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_port_fallbacks: 10,
            max_attempts: 3,
            upstream_timeout: Some(Duration::from_secs(120)),
            client_read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl From<&ListenerConfig> for ProxyOptions {
    fn from(cfg: &ListenerConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            max_port_fallbacks: cfg.max_port_fallbacks,
            max_attempts: cfg.max_attempts,
            upstream_timeout: secs(cfg.upstream_timeout_secs),
            client_read_timeout: secs(cfg.client_read_timeout_secs),
        }
    }
}

/// A bind that landed somewhere other than the requested port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChange {
    pub requested: u16,
    pub bound: u16,
}

/// Notified once per start when port fallback kicked in.
///
/// Called from the task that ran [`ProxyServer::start`]; implementations
/// should hand the work off (for example to a host dispatcher) and return.
pub type PortObserver = Arc<dyn Fn(PortChange) + Send + Sync>;

/// State shared by the accept loop and every connection worker.
pub(crate) struct GatewayState {
    pub(crate) selector: BackendSelector,
    pub(crate) upstream: UpstreamClient,
    pub(crate) metrics: Arc<dyn MetricsRecorder>,
    pub(crate) running: AtomicBool,
    pub(crate) client_read_timeout: Option<Duration>,
    active_connections: AtomicU64,
}

impl GatewayState {
    pub(crate) fn connection_opened(&self) {
        let now = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_active_connections(now);
    }

    pub(crate) fn connection_closed(&self) {
        let now = self
            .active_connections
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        self.metrics.set_active_connections(now);
    }
}

struct ListenerHandle {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The loopback gateway.
///
/// `start` binds and spawns the accept loop; `stop` tears it down. Both can
/// be called repeatedly.
pub struct ProxyServer {
    state: Arc<GatewayState>,
    options: ProxyOptions,
    port_observer: Option<PortObserver>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ProxyServer {
    pub fn builder(backends: Vec<BackendConfig>) -> ProxyServerBuilder {
        ProxyServerBuilder::new(backends)
    }

    /// Bind on loopback and start accepting. Returns the bound port.
    ///
    /// When `requested_port` is taken the next ports are tried, up to
    /// `max_port_fallbacks` binds in total. Passing 0 lets the OS choose.
    pub async fn start(&self, requested_port: u16) -> Result<u16> {
        let mut slot = self.listener.lock().await;
        if let Some(handle) = slot.as_ref() {
            warn!(port = handle.port, "gateway already running");
            return Ok(handle.port);
        }

        let (listener, port) =
            bind_with_fallback(requested_port, self.options.max_port_fallbacks).await?;

        if requested_port != 0 && port != requested_port {
            warn!(
                requested = requested_port,
                bound = port,
                "requested port unavailable, fell back to another port"
            );
            if let Some(observer) = &self.port_observer {
                observer(PortChange {
                    requested: requested_port,
                    bound: port,
                });
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.state.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state), shutdown_rx));

        info!(port, "gateway listening on 127.0.0.1:{}", port);
        *slot = Some(ListenerHandle {
            port,
            shutdown,
            task,
        });
        Ok(port)
    }

    /// Close the listener and wait briefly for the accept loop to exit.
    ///
    /// In-flight connections are left to finish on their own. Calling this
    /// when the gateway is not running does nothing.
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);

        let handle = self.listener.lock().await.take();
        let Some(ListenerHandle {
            port,
            shutdown,
            mut task,
        }) = handle
        else {
            debug!("stop requested but gateway is not running");
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("accept loop ended abnormally: {}", e),
            Err(_) => {
                warn!("accept loop did not stop in time, aborting it");
                task.abort();
            }
        }
        info!(port, "gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Port of the live listener, if any.
    pub async fn bound_port(&self) -> Option<u16> {
        self.listener.lock().await.as_ref().map(|h| h.port)
    }

    /// Replace the backend list wholesale; in-flight attempts keep their snapshot.
    pub fn update_backends(&self, backends: Vec<BackendConfig>, active: usize) {
        info!(count = backends.len(), active, "updating backend list");
        self.state.selector.replace(backends, active);
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.state.selector
    }

    pub fn metrics(&self) -> Arc<dyn MetricsRecorder> {
        Arc::clone(&self.state.metrics)
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.listener.try_lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.shutdown.send(true);
            }
        }
    }
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
    backends: Vec<BackendConfig>,
    active: usize,
    options: ProxyOptions,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    port_observer: Option<PortObserver>,
}

impl ProxyServerBuilder {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends,
            active: 0,
            options: ProxyOptions::default(),
            metrics: None,
            port_observer: None,
        }
    }

    pub fn active(mut self, index: usize) -> Self {
        self.active = index;
        self
    }

    pub fn options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a shared `MetricsRecorder`. Defaults to a no-op recorder.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn port_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(PortChange) + Send + Sync + 'static,
    {
        self.port_observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> Result<ProxyServer> {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetricsRecorder) as Arc<dyn MetricsRecorder>);

        let selector = BackendSelector::new(self.backends, self.active, self.options.max_attempts)
            .with_metrics(Arc::clone(&metrics));

        let state = GatewayState {
            selector,
            upstream: UpstreamClient::new(self.options.upstream_timeout)?,
            metrics,
            running: AtomicBool::new(false),
            client_read_timeout: self.options.client_read_timeout,
            active_connections: AtomicU64::new(0),
        };

        Ok(ProxyServer {
            state: Arc::new(state),
            options: self.options,
            port_observer: self.port_observer,
            listener: Mutex::new(None),
        })
    }
}

/// Bind `127.0.0.1:requested`, moving to the next port while the address is
/// in use. Makes at most `max_attempts` binds.
pub async fn bind_with_fallback(requested: u16, max_attempts: u16) -> Result<(TcpListener, u16)> {
    let mut attempts = 0;

    for port in fallback_ports(requested, max_attempts) {
        attempts += 1;
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                debug!(port = bound, attempt = attempts, "bound listener");
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(port, attempt = attempts, "port in use");
            }
            Err(e) => {
                return Err(GatewayError::Bind {
                    port,
                    message: e.to_string(),
                })
            }
        }
    }

    Err(GatewayError::BindExhausted {
        start_port: requested,
        attempts,
    })
}

/// Ports tried for `requested`, stopping early at the top of the range.
fn fallback_ports(requested: u16, max_attempts: u16) -> impl Iterator<Item = u16> {
    (requested..=u16::MAX).take(usize::from(max_attempts.max(1)))
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("accept loop running");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_worker(&state, stream, peer),
                Err(e) => {
                    if !state.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("accept error: {}", e);
                    // Avoid spinning on persistent errors such as fd exhaustion.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("accept loop exiting");
}

fn spawn_worker(state: &Arc<GatewayState>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    debug!(%peer, "accepted connection");
    let state = Arc::clone(state);
    tokio::spawn(async move {
        router::serve_connection(state, stream, peer).await;
    });
}
