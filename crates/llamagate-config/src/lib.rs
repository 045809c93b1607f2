//! Configuration loading and types for llamagate.
//!
//! This crate is responsible for:
//! - Defining the configuration model consumed by the daemon and the proxy
//! - Loading configuration from TOML files
//! - Providing a simple default search strategy (/etc/llamagate/llamagate.toml, ./llamagate.toml)
//!
//! Writing configuration back to disk is not handled here; the gateway only
//! reports a reassigned listen port to whoever owns the settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use llamagate_core::{BackendConfig, GatewayError, Provider, Result, UpstreamTarget};

/// Root configuration struct for llamagate.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listener and forwarding behaviour.
    #[serde(default)]
    pub gateway: ListenerConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,

    /// Ordered upstream backends. Failover walks this list circularly.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

impl GatewayConfig {
    /// Perform basic structural validation of the configuration.
    ///
    /// This does not contact any upstream; it only checks for obviously
    /// invalid or inconsistent values.
    pub fn validate(&self) -> Result<()> {
        self.validate_gateway()?;
        self.validate_backends()?;
        Ok(())
    }

    fn validate_gateway(&self) -> Result<()> {
        if self.gateway.listen_port == 0 {
            return Err(GatewayError::invalid_config(
                "gateway.listen_port",
                "gateway.listen_port must be non-zero",
            ));
        }

        if self.gateway.max_port_fallbacks == 0 {
            return Err(GatewayError::invalid_config(
                "gateway.max_port_fallbacks",
                "gateway.max_port_fallbacks must be at least 1",
            ));
        }

        if self.gateway.max_attempts == 0 {
            return Err(GatewayError::invalid_config(
                "gateway.max_attempts",
                "gateway.max_attempts must be at least 1",
            ));
        }

        if !self.backends.is_empty() && self.gateway.active_backend >= self.backends.len() {
            return Err(GatewayError::invalid_config(
                "gateway.active_backend",
                &format!(
                    "gateway.active_backend is {} but only {} backends are configured",
                    self.gateway.active_backend,
                    self.backends.len()
                ),
            ));
        }

        Ok(())
    }

    fn validate_backends(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(GatewayError::invalid_config(
                    "backends.name",
                    "backend name must not be empty",
                ));
            }

            if !seen.insert(backend.name.clone()) {
                return Err(GatewayError::invalid_config(
                    "backends.name",
                    &format!("duplicate backend name: {}", backend.name),
                ));
            }

            if backend.model.trim().is_empty() {
                return Err(GatewayError::invalid_config(
                    "backends.model",
                    &format!("backend '{}' has an empty model", backend.name),
                ));
            }

            // Resolving the target checks scheme and host in one place.
            if let Err(err) = UpstreamTarget::parse(&backend.api_endpoint) {
                return Err(GatewayError::invalid_config(
                    "backends.api_endpoint",
                    &format!("backend '{}': {}", backend.name, err),
                ));
            }
        }

        Ok(())
    }

    /// Convert the file entries into the runtime backend list.
    pub fn backend_configs(&self) -> Vec<BackendConfig> {
        self.backends.iter().map(BackendEntry::to_backend).collect()
    }

    /// Effective log level from the file, if any.
    pub fn log_level(&self) -> Option<&str> {
        self.telemetry.as_ref().and_then(|t| t.log_level.as_deref())
    }

    /// Whether Prometheus metrics should be collected and served.
    pub fn metrics_enabled(&self) -> bool {
        self.telemetry
            .as_ref()
            .map(|t| !t.disable_metrics)
            .unwrap_or(true)
    }
}

/// Listener and forwarding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Requested loopback port. Defaults to 13333.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// How many consecutive ports to try when the requested one is taken.
    #[serde(default = "default_max_port_fallbacks")]
    pub max_port_fallbacks: u16,

    /// Forwarding attempts per request across backends.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Upstream connect/read idle timeout in seconds; 0 disables it.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Inbound request read timeout in seconds; 0 disables it.
    #[serde(default = "default_client_read_timeout_secs")]
    pub client_read_timeout_secs: u64,

    /// Index of the backend tried first.
    #[serde(default)]
    pub active_backend: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            max_port_fallbacks: default_max_port_fallbacks(),
            max_attempts: default_max_attempts(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            client_read_timeout_secs: default_client_read_timeout_secs(),
            active_backend: 0,
        }
    }
}

/// Telemetry configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter expression, e.g. `info` or `info,llamagate_proxy=debug`.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Disable the Prometheus recorder and the `metrics` route.
    #[serde(default)]
    pub disable_metrics: bool,
}

/// One `[[backends]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    /// Logical name for this backend (unique per config file).
    pub name: String,

    #[serde(default)]
    pub provider: Provider,

    #[serde(default)]
    pub api_key: String,

    /// Full chat-completion URL.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_chat_template")]
    pub chat_template: String,
}

impl BackendEntry {
    fn to_backend(&self) -> BackendConfig {
        BackendConfig::new(
            self.name.as_str(),
            self.provider,
            self.api_endpoint.as_str(),
            self.model.as_str(),
        )
        .with_api_key(self.api_key.as_str())
        .with_chat_template(self.chat_template.as_str())
    }
}

/// Load configuration from a specific file path.
///
/// This function parses TOML into [`GatewayConfig`] and maps errors into
/// [`GatewayError::Config`] / [`GatewayError::InvalidConfig`] as appropriate.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| {
        GatewayError::config(format!(
            "failed to read config file '{}': {}",
            path_ref.display(),
            err
        ))
    })?;

    parse_str(&contents).map_err(|err| match err {
        GatewayError::InvalidConfig { message, .. } => {
            GatewayError::invalid_config(path_ref.display().to_string(), message)
        }
        other => other,
    })
}

/// Parse configuration from TOML text.
pub fn parse_str(contents: &str) -> Result<GatewayConfig> {
    toml::from_str(contents).map_err(|err| {
        GatewayError::invalid_config(
            "<toml>".to_string(),
            format!("failed to parse config: {}", err),
        )
    })
}

/// Attempt to load configuration using the default search strategy.
///
/// Current strategy (in order):
/// 1. `/etc/llamagate/llamagate.toml`
/// 2. `./llamagate.toml` (in the current working directory)
pub fn load_default() -> Result<GatewayConfig> {
    let candidates = default_candidates();

    for candidate in &candidates {
        if candidate.exists() {
            return load_from_path(candidate);
        }
    }

    Err(GatewayError::ConfigNotFound(
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    ))
}

fn default_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/llamagate/llamagate.toml"),
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("llamagate.toml"),
    ]
}

fn default_listen_port() -> u16 {
    13333
}

fn default_max_port_fallbacks() -> u16 {
    10
}

fn default_max_attempts() -> usize {
    3
}

fn default_upstream_timeout_secs() -> u64 {
    120
}

fn default_client_read_timeout_secs() -> u64 {
    30
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_chat_template() -> String {
    "chatml".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    const FULL: &str = r#"
[gateway]
listen_port = 14000
max_attempts = 2
active_backend = 1

[telemetry]
log_level = "debug"

[[backends]]
name = "openai"
provider = "openai"
api_key = "sk-test"
api_endpoint = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o-mini"

[[backends]]
name = "claude"
provider = "anthropic"
api_key = "sk-ant"
api_endpoint = "https://api.anthropic.com/v1/messages"
model = "claude-3-5-haiku-latest"
chat_template = "claude"
"#;

    #[test]
    fn test_load_from_path_full() {
        let path = std::env::temp_dir().join(format!(
            "test_llamagate_config_{}.toml",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        {
            let mut file = fs::File::create(&path).expect("create temp config file");
            write!(file, "{}", FULL).expect("write config");
        }

        let cfg = load_from_path(&path).expect("load config");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.gateway.listen_port, 14000);
        assert_eq!(cfg.gateway.max_attempts, 2);
        assert_eq!(cfg.gateway.max_port_fallbacks, 10);
        assert_eq!(cfg.gateway.active_backend, 1);
        assert_eq!(cfg.log_level(), Some("debug"));
        assert!(cfg.metrics_enabled());

        let backends = cfg.backend_configs();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].provider, Provider::OpenAI);
        assert_eq!(backends[0].chat_template, "chatml");
        assert_eq!(backends[1].provider, Provider::Anthropic);
        assert_eq!(backends[1].chat_template, "claude");
        assert_eq!(backends[1].api_key, "sk-ant");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_defaults_for_empty_file() {
        let cfg = parse_str("").expect("empty config parses");
        assert_eq!(cfg.gateway.listen_port, 13333);
        assert_eq!(cfg.gateway.max_attempts, 3);
        assert_eq!(cfg.gateway.upstream_timeout_secs, 120);
        assert!(cfg.backends.is_empty());
        cfg.validate().expect("empty backend list is structurally valid");
    }

    #[test]
    fn test_backend_entry_defaults() {
        let cfg = parse_str("[[backends]]\nname = \"default\"\n").unwrap();
        let backend = &cfg.backend_configs()[0];
        assert_eq!(backend.provider, Provider::OpenAI);
        assert_eq!(
            backend.api_endpoint,
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(backend.model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_missing_file_errors() {
        let res = load_from_path("/this/definitely/does/not/exist.toml");
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_backend_names() {
        let cfg = parse_str(
            r#"
[[backends]]
name = "dup"
[[backends]]
name = "dup"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let cfg = parse_str(
            r#"
[[backends]]
name = "broken"
api_endpoint = "localhost:8080/v1"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_active_backend() {
        let cfg = parse_str(
            r#"
[gateway]
active_backend = 3

[[backends]]
name = "only"
"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let cfg = parse_str("[gateway]\nmax_attempts = 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
