use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use llamagate_core::{BackendConfig, GatewayError, Result};
use llamagate_telemetry::{AttemptOutcome, MetricsRecorder};
use tracing::{debug, warn};

/// One forwarding attempt against a single backend.
///
/// Implementations are called at most `max_attempts` times per
/// [`BackendSelector::forward`], each time with the backend that is active at
/// that moment. State that must survive between attempts (for example a
/// client socket that is already streaming) lives in `self`.
#[async_trait]
pub trait BackendCall: Send {
    type Output: Send;

    async fn call(&mut self, backend: &BackendConfig, attempt: usize) -> Result<Self::Output>;
}

/// Ordered backend list plus the active index used for failover.
///
/// The list is copy-on-replace: [`BackendSelector::replace`] swaps the whole
/// `Vec` and in-flight attempts keep the snapshot they loaded. The active
/// index is shared by every connection. Concurrent forwards may move it
/// under each other; every attempt re-reads it, so that only changes which
/// backend is tried first.
pub struct BackendSelector {
    backends: ArcSwap<Vec<BackendConfig>>,
    active: AtomicUsize,
    max_attempts: usize,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl BackendSelector {
    /// Create a selector. An out-of-range `active` index falls back to 0 and
    /// `max_attempts` is at least 1.
    pub fn new(backends: Vec<BackendConfig>, active: usize, max_attempts: usize) -> Self {
        let active = if active < backends.len() { active } else { 0 };
        Self {
            backends: ArcSwap::from_pointee(backends),
            active: AtomicUsize::new(active),
            max_attempts: max_attempts.max(1),
            metrics: None,
        }
    }

    /// Attach a shared `MetricsRecorder` for per-attempt outcomes.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Swap in a new backend list and active index.
    pub fn replace(&self, backends: Vec<BackendConfig>, active: usize) {
        let active = if active < backends.len() { active } else { 0 };
        debug!(count = backends.len(), active, "replacing backend list");
        self.backends.store(Arc::new(backends));
        self.active.store(active, Ordering::SeqCst);
    }

    /// Current list snapshot.
    pub fn snapshot(&self) -> Arc<Vec<BackendConfig>> {
        self.backends.load_full()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Index of the backend the next attempt will use.
    pub fn active_index(&self) -> usize {
        let len = self.len();
        if len == 0 {
            0
        } else {
            self.active.load(Ordering::SeqCst) % len
        }
    }

    /// The backend the next attempt will use.
    pub fn active(&self) -> Option<BackendConfig> {
        let backends = self.backends.load();
        if backends.is_empty() {
            return None;
        }
        let index = self.active.load(Ordering::SeqCst) % backends.len();
        backends.get(index).cloned()
    }

    /// Move past `failed`, unless another request already has.
    fn advance(&self, failed: usize, len: usize) {
        let next = (failed + 1) % len;
        let _ = self
            .active
            .compare_exchange(failed, next, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Run `call` against the active backend, rotating on every failure.
    ///
    /// Returns the first successful output, or
    /// [`GatewayError::RetriesExhausted`] after `max_attempts` failures.
    pub async fn forward<C>(&self, call: &mut C) -> Result<C::Output>
    where
        C: BackendCall + ?Sized,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let backends = self.backends.load_full();
            if backends.is_empty() {
                return Err(GatewayError::NoBackends);
            }
            let index = self.active.load(Ordering::SeqCst) % backends.len();
            let backend = &backends[index];

            debug!(backend = %backend.name, index, attempt, "forwarding attempt");

            match call.call(backend, attempt).await {
                Ok(output) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_upstream_attempt(&backend.name, AttemptOutcome::Success);
                    }
                    return Ok(output);
                }
                Err(err) => {
                    warn!(
                        backend = %backend.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        "forwarding attempt failed: {}",
                        err
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_upstream_attempt(&backend.name, AttemptOutcome::Failure);
                        metrics.record_error(Some(backend.name.as_str()), err.kind());
                    }
                    self.advance(index, backends.len());
                    last_error = Some(err);
                }
            }
        }

        Err(GatewayError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }
}

impl std::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelector")
            .field("backends", &self.snapshot())
            .field("active", &self.active_index())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamagate_core::Provider;
    use std::sync::Mutex;

    fn backend(name: &str) -> BackendConfig {
        BackendConfig::new(name, Provider::OpenAI, "http://127.0.0.1:1/v1", "m")
    }

    /// Fails for every backend whose name is listed, records what it saw.
    struct Scripted {
        failing: Vec<&'static str>,
        seen: Vec<(String, usize)>,
    }

    #[async_trait]
    impl BackendCall for Scripted {
        type Output = String;

        async fn call(&mut self, backend: &BackendConfig, attempt: usize) -> Result<String> {
            self.seen.push((backend.name.clone(), attempt));
            if self.failing.iter().any(|name| *name == backend.name) {
                Err(GatewayError::connect("127.0.0.1", 1, "connection refused"))
            } else {
                Ok(format!("ok from {}", backend.name))
            }
        }
    }

    #[tokio::test]
    async fn first_backend_success_keeps_active_index() {
        let selector = BackendSelector::new(vec![backend("a"), backend("b")], 0, 3);
        let mut call = Scripted {
            failing: vec![],
            seen: vec![],
        };

        assert_eq!(selector.forward(&mut call).await.unwrap(), "ok from a");
        assert_eq!(selector.active_index(), 0);
        assert_eq!(call.seen, vec![("a".to_string(), 1)]);
    }

    #[tokio::test]
    async fn failover_moves_active_index_to_working_backend() {
        let selector = BackendSelector::new(vec![backend("a"), backend("b")], 0, 3);
        let mut call = Scripted {
            failing: vec!["a"],
            seen: vec![],
        };

        assert_eq!(selector.forward(&mut call).await.unwrap(), "ok from b");
        assert_eq!(selector.active_index(), 1);
        assert_eq!(selector.active().unwrap().name, "b");
        assert_eq!(
            call.seen,
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_wrap_around_and_report_count() {
        let selector = BackendSelector::new(vec![backend("a"), backend("b")], 1, 3);
        let mut call = Scripted {
            failing: vec!["a", "b"],
            seen: vec![],
        };

        let err = selector.forward(&mut call).await.unwrap_err();
        match err {
            GatewayError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let order: Vec<&str> = call.seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "b"]);
    }

    /// Fails the first backend with a configuration error rather than an I/O one.
    struct BadEndpointFirst(Vec<String>);

    #[async_trait]
    impl BackendCall for BadEndpointFirst {
        type Output = String;

        async fn call(&mut self, backend: &BackendConfig, _attempt: usize) -> Result<String> {
            self.0.push(backend.name.clone());
            if backend.name == "a" {
                Err(GatewayError::invalid_config("endpoint", "unsupported scheme"))
            } else {
                Ok(format!("ok from {}", backend.name))
            }
        }
    }

    #[tokio::test]
    async fn any_error_kind_rotates_to_the_next_backend() {
        let selector = BackendSelector::new(vec![backend("a"), backend("b")], 0, 3);
        let mut call = BadEndpointFirst(Vec::new());

        assert_eq!(selector.forward(&mut call).await.unwrap(), "ok from b");
        assert_eq!(selector.active_index(), 1);
        assert_eq!(call.0, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_list_is_no_backends() {
        let selector = BackendSelector::new(Vec::new(), 0, 3);
        let mut call = Scripted {
            failing: vec![],
            seen: vec![],
        };
        assert!(matches!(
            selector.forward(&mut call).await,
            Err(GatewayError::NoBackends)
        ));
        assert!(selector.active().is_none());
        assert!(call.seen.is_empty());
    }

    #[test]
    fn replace_swaps_list_and_clamps_index() {
        let selector = BackendSelector::new(vec![backend("a")], 5, 0);
        assert_eq!(selector.active_index(), 0);
        assert_eq!(selector.max_attempts(), 1);

        let before = selector.snapshot();
        selector.replace(vec![backend("x"), backend("y"), backend("z")], 2);
        assert_eq!(selector.len(), 3);
        assert_eq!(selector.active().unwrap().name, "z");
        // Earlier snapshots are unaffected.
        assert_eq!(before.len(), 1);

        selector.replace(vec![backend("only")], 7);
        assert_eq!(selector.active_index(), 0);
    }

    #[derive(Default)]
    struct CountingMetrics {
        attempts: Mutex<Vec<(String, AttemptOutcome)>>,
    }

    impl MetricsRecorder for CountingMetrics {
        fn record_request_start(&self, _route: &str) {}
        fn record_request_end(&self, _route: &str, _success: bool, _latency_secs: Option<f64>) {}
        fn record_upstream_attempt(&self, backend: &str, outcome: AttemptOutcome) {
            self.attempts
                .lock()
                .unwrap()
                .push((backend.to_string(), outcome));
        }
        fn record_error(&self, _backend: Option<&str>, _kind: &str) {}
        fn set_active_connections(&self, _count: u64) {}
    }

    #[tokio::test]
    async fn attempts_are_recorded_per_backend() {
        let metrics = Arc::new(CountingMetrics::default());
        let selector = BackendSelector::new(vec![backend("a"), backend("b")], 0, 3)
            .with_metrics(metrics.clone());
        let mut call = Scripted {
            failing: vec!["a"],
            seen: vec![],
        };
        selector.forward(&mut call).await.unwrap();

        assert_eq!(
            *metrics.attempts.lock().unwrap(),
            vec![
                ("a".to_string(), AttemptOutcome::Failure),
                ("b".to_string(), AttemptOutcome::Success)
            ]
        );
    }
}
