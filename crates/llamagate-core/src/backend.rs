//! Backend configuration types.
//!
//! A backend is one upstream chat-completion API the gateway can forward to.
//! Configurations are immutable for the duration of a request; callers swap
//! whole lists instead of editing entries in place.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, Result};

/// Wire dialect spoken by an upstream provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat-completions shape.
    #[default]
    #[serde(alias = "OpenAI")]
    OpenAI,

    /// Anthropic messages shape.
    #[serde(alias = "Anthropic")]
    Anthropic,

    /// Any OpenAI-compatible endpoint.
    #[serde(alias = "Custom")]
    Custom,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// A single configured upstream.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Display name, unique within a configuration list
    pub name: String,

    /// Request/response dialect
    pub provider: Provider,

    /// Secret sent as `Authorization: Bearer <api_key>`
    pub api_key: String,

    /// Full URL of the chat-completion endpoint
    pub api_endpoint: String,

    /// Model identifier forwarded to the provider
    pub model: String,

    /// Chat template name reported to llama.cpp clients
    pub chat_template: String,
}

impl BackendConfig {
    /// Create a backend with no API key and the `chatml` template.
    pub fn new<S: Into<String>>(name: S, provider: Provider, api_endpoint: S, model: S) -> Self {
        Self {
            name: name.into(),
            provider,
            api_key: String::new(),
            api_endpoint: api_endpoint.into(),
            model: model.into(),
            chat_template: "chatml".to_string(),
        }
    }

    /// Set the API key.
    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set the chat template name.
    pub fn with_chat_template<S: Into<String>>(mut self, chat_template: S) -> Self {
        self.chat_template = chat_template.into();
        self
    }

    /// Value of the outbound `Authorization` header.
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// Resolve `api_endpoint` into a connectable target.
    pub fn target(&self) -> Result<UpstreamTarget> {
        UpstreamTarget::parse(&self.api_endpoint)
    }
}

// Hand-written so API keys never reach the logs.
impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("api_endpoint", &self.api_endpoint)
            .field("model", &self.model)
            .field("chat_template", &self.chat_template)
            .finish()
    }
}

/// Where and how to open the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    /// Path plus query string, always starting with `/`
    pub path: String,
    pub tls: bool,
}

impl UpstreamTarget {
    /// Parse an absolute `http://` or `https://` URL.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint.trim()).map_err(|e| {
            GatewayError::invalid_config("api_endpoint".to_string(), format!("{endpoint}: {e}"))
        })?;

        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(GatewayError::invalid_config(
                    "api_endpoint".to_string(),
                    format!("unsupported scheme '{other}' in {endpoint}"),
                ))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| {
                GatewayError::invalid_config(
                    "api_endpoint".to_string(),
                    format!("missing host in {endpoint}"),
                )
            })?
            .to_string();

        let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    /// Value for the outbound `Host` header.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
