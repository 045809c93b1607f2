use std::env;
use std::str::FromStr;

use time::{format_description, UtcOffset};
use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::prelude::*;

#[cfg(feature = "prometheus")]
pub use crate::prometheus_impl::PrometheusMetricsRecorder;

/// Error type for telemetry initialisation failures.
///
/// This is intentionally lightweight so `llamagate-telemetry` can be used
/// without depending on `llamagate-core`. Callers can map this into their own
/// error types as needed.
#[derive(Debug)]
pub enum TelemetryError {
    /// Provided log level string could not be parsed.
    InvalidLevel(String),

    /// Failed to configure the subscriber (should be rare).
    SubscriberInit(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::InvalidLevel(level) => {
                write!(f, "invalid log level: {}", level)
            }
            TelemetryError::SubscriberInit(msg) => write!(f, "failed to init telemetry: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Outcome of one forwarding attempt against one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }
}

/// Rendered metrics ready to be served over HTTP.
#[derive(Debug, Clone)]
pub struct MetricsExport {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Interface for recording gateway metrics.
///
/// Implementations are expected to be cheap and non-panicking; they are
/// called from connection workers on the hot path.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// Record that an inbound request has been routed.
    ///
    /// - `route`: short, stable route name (e.g. "completion", "props").
    fn record_request_start(&self, route: &str);

    /// Record that an inbound request has completed.
    ///
    /// - `route`: short, stable route name.
    /// - `success`: whether the request was considered successful.
    /// - `latency_secs`: request latency in seconds (optional if not measured).
    fn record_request_end(&self, route: &str, success: bool, latency_secs: Option<f64>);

    /// Record a single forwarding attempt against a backend.
    fn record_upstream_attempt(&self, backend: &str, outcome: AttemptOutcome);

    /// Record an error associated with a backend or the gateway as a whole.
    ///
    /// - `backend`: backend name, if applicable.
    /// - `kind`: a short, stable error kind string (e.g. "timeout",
    ///   "upstream_status", "malformed_request").
    fn record_error(&self, backend: Option<&str>, kind: &str);

    /// Record the number of connections currently being served.
    fn set_active_connections(&self, count: u64);

    /// Render the current metrics, if this backend supports exposition.
    fn export(&self) -> Option<MetricsExport> {
        None
    }
}

/// A no-op metrics recorder that does nothing.
///
/// This is useful as a default implementation in environments where metrics
/// are not configured or desired.
#[derive(Debug, Clone, Default)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn record_request_start(&self, _route: &str) {}

    fn record_request_end(&self, _route: &str, _success: bool, _latency_secs: Option<f64>) {}

    fn record_upstream_attempt(&self, _backend: &str, _outcome: AttemptOutcome) {}

    fn record_error(&self, _backend: Option<&str>, _kind: &str) {}

    fn set_active_connections(&self, _count: u64) {}
}

#[cfg(feature = "prometheus")]
pub mod prometheus_impl {
    use super::*;

    use prometheus::{
        Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
        TextEncoder,
    };

    /// Prometheus-backed metrics recorder.
    ///
    /// This is behind the `prometheus` feature flag so that embedders which do
    /// not require metrics do not have to pull in the Prometheus stack.
    #[derive(Clone)]
    pub struct PrometheusMetricsRecorder {
        registry: Registry,
        requests_total: IntCounterVec,
        request_latency_seconds: HistogramVec,
        upstream_attempts_total: IntCounterVec,
        errors_total: IntCounterVec,
        active_connections: IntGauge,
    }

    impl PrometheusMetricsRecorder {
        /// Create a new Prometheus-backed recorder with a fresh registry.
        ///
        /// Metric descriptors are static, so construction failures indicate a
        /// programming error rather than a runtime condition.
        pub fn new() -> Self {
            let registry = Registry::new();

            let requests_total = IntCounterVec::new(
                Opts::new("requests_total", "Total number of inbound requests processed")
                    .namespace("llamagate"),
                &["route", "success"],
            )
            .expect("failed to create llamagate_requests_total counter");
            registry
                .register(Box::new(requests_total.clone()))
                .expect("failed to register llamagate_requests_total");

            let request_latency_seconds = HistogramVec::new(
                HistogramOpts::new("request_latency_seconds", "Request latency in seconds")
                    .namespace("llamagate"),
                &["route"],
            )
            .expect("failed to create llamagate_request_latency_seconds histogram");
            registry
                .register(Box::new(request_latency_seconds.clone()))
                .expect("failed to register llamagate_request_latency_seconds");

            let upstream_attempts_total = IntCounterVec::new(
                Opts::new(
                    "upstream_attempts_total",
                    "Forwarding attempts per backend and outcome",
                )
                .namespace("llamagate"),
                &["backend", "outcome"],
            )
            .expect("failed to create llamagate_upstream_attempts_total counter");
            registry
                .register(Box::new(upstream_attempts_total.clone()))
                .expect("failed to register llamagate_upstream_attempts_total");

            let errors_total = IntCounterVec::new(
                Opts::new("errors_total", "Total number of errors encountered")
                    .namespace("llamagate"),
                &["backend", "kind"],
            )
            .expect("failed to create llamagate_errors_total counter");
            registry
                .register(Box::new(errors_total.clone()))
                .expect("failed to register llamagate_errors_total");

            let active_connections = IntGauge::with_opts(
                Opts::new("active_connections", "Number of connections being served")
                    .namespace("llamagate"),
            )
            .expect("failed to create llamagate_active_connections gauge");
            registry
                .register(Box::new(active_connections.clone()))
                .expect("failed to register llamagate_active_connections");

            Self {
                registry,
                requests_total,
                request_latency_seconds,
                upstream_attempts_total,
                errors_total,
                active_connections,
            }
        }

        /// Access the underlying Prometheus registry.
        pub fn registry(&self) -> &Registry {
            &self.registry
        }
    }

    impl Default for PrometheusMetricsRecorder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MetricsRecorder for PrometheusMetricsRecorder {
        fn record_request_start(&self, _route: &str) {
            // Nothing to count yet; the end event carries the outcome.
        }

        fn record_request_end(&self, route: &str, success: bool, latency_secs: Option<f64>) {
            let success_label = if success { "true" } else { "false" };

            self.requests_total
                .with_label_values(&[route, success_label])
                .inc();

            if let Some(lat) = latency_secs {
                self.request_latency_seconds
                    .with_label_values(&[route])
                    .observe(lat);
            }
        }

        fn record_upstream_attempt(&self, backend: &str, outcome: AttemptOutcome) {
            self.upstream_attempts_total
                .with_label_values(&[backend, outcome.as_str()])
                .inc();
        }

        fn record_error(&self, backend: Option<&str>, kind: &str) {
            let backend_label = backend.unwrap_or("_none");
            self.errors_total
                .with_label_values(&[backend_label, kind])
                .inc();
        }

        fn set_active_connections(&self, count: u64) {
            self.active_connections.set(count as i64);
        }

        /// Encode the registry into Prometheus' text exposition format.
        fn export(&self) -> Option<MetricsExport> {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();

            let mut buffer = Vec::new();
            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                tracing::warn!("failed to encode Prometheus metrics: {}", err);
                return None;
            }

            Some(MetricsExport {
                content_type: encoder.format_type().to_string(),
                body: buffer,
            })
        }
    }
}

/// Initialise the global telemetry / logging subscriber.
///
/// This sets up a `tracing_subscriber` using `EnvFilter` and a formatted
/// output layer. It is intended to be called once at process startup.
///
/// # Parameters
///
/// - `level`: Optional log level string. If `None`, the function will:
///   - Respect `RUST_LOG` if it is set, or
///   - Default to `"info"` otherwise.
///   If `Some(level)` is provided, it takes precedence over `RUST_LOG`.
///
/// # Examples
///
/// ```ignore
/// llamagate_telemetry::init(None)?;
/// llamagate_telemetry::init(Some("info,llamagate_proxy=debug"))?;
/// ```
pub fn init(level: Option<&str>) -> Result<()> {
    let filter = if let Some(level_str) = level {
        parse_level_filter(level_str)?
    } else if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_timer(OffsetTime::new(
            // Falls back to UTC if the local offset cannot be determined.
            UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
            format_description::parse(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z",
            )
            .unwrap_or_default(),
        ));

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);

    subscriber
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(())
}

/// Parse a simple level string into an `EnvFilter`.
///
/// Supports both plain levels ("info", "debug", etc.) and full `EnvFilter`
/// expressions (like "info,llamagate_proxy=debug").
fn parse_level_filter(level_str: &str) -> Result<EnvFilter> {
    if Level::from_str(level_str).is_ok() {
        return Ok(EnvFilter::new(level_str));
    }

    EnvFilter::builder()
        .parse(level_str)
        .map_err(|e| TelemetryError::InvalidLevel(format!("{} ({})", level_str, e)))
}
