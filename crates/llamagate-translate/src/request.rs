//! llama.cpp request in, provider request out.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use llamagate_core::{BackendConfig, GatewayError, Provider, Result};

/// Anthropic requires `max_tokens`; used when `n_predict` is absent or not positive.
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The fields of a llama.cpp `/completion` body the gateway looks at.
///
/// Everything is optional. Numbers and booleans are accepted as JSON strings
/// too, and values that cannot be interpreted are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LlamaRequest {
    #[serde(default, deserialize_with = "lenient::text")]
    pub prompt: Option<String>,

    #[serde(default, deserialize_with = "lenient::float")]
    pub temperature: Option<f64>,

    #[serde(default, deserialize_with = "lenient::float")]
    pub top_p: Option<f64>,

    #[serde(default, deserialize_with = "lenient::integer")]
    pub n_predict: Option<i64>,

    /// Copied through untouched: a string or an array of strings.
    #[serde(default)]
    pub stop: Option<Value>,

    #[serde(default, deserialize_with = "lenient::boolean")]
    pub stream: Option<bool>,
}

impl LlamaRequest {
    /// Decode an inbound body. An empty body is an empty request.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// `n_predict` as a token budget, only when positive.
    pub fn max_tokens(&self) -> Option<u32> {
        self.n_predict
            .filter(|n| *n > 0)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.prompt
            .as_ref()
            .map(|prompt| vec![ChatMessage::user(prompt.as_str())])
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// OpenAI chat-completions body, also used for custom endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    pub stream: bool,
}

/// Anthropic messages body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProviderRequest {
    OpenAi(OpenAiRequest),
    Anthropic(AnthropicRequest),
}

impl ProviderRequest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(GatewayError::from)
    }
}

/// Build the provider body for `backend` from a llama.cpp request.
pub fn to_provider_request(request: &LlamaRequest, backend: &BackendConfig) -> ProviderRequest {
    match backend.provider {
        Provider::OpenAI | Provider::Custom => to_openai(request, backend),
        Provider::Anthropic => to_anthropic(request, backend),
    }
}

fn to_openai(request: &LlamaRequest, backend: &BackendConfig) -> ProviderRequest {
    ProviderRequest::OpenAi(OpenAiRequest {
        model: backend.model.clone(),
        messages: request.messages(),
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens(),
        stop: request.stop.clone(),
        stream: request.is_stream(),
    })
}

fn to_anthropic(request: &LlamaRequest, backend: &BackendConfig) -> ProviderRequest {
    ProviderRequest::Anthropic(AnthropicRequest {
        model: backend.model.clone(),
        messages: request.messages(),
        max_tokens: request.max_tokens().unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        temperature: request.temperature,
    })
}

/// Headers beyond `Authorization` that a provider expects.
pub fn provider_headers(backend: &BackendConfig) -> Vec<(String, String)> {
    match backend.provider {
        Provider::Anthropic => vec![
            ("x-api-key".to_string(), backend.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ],
        Provider::OpenAI | Provider::Custom => Vec::new(),
    }
}

mod lenient {
    use super::*;

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        })
    }

    pub fn float<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0),
            Some(Value::String(s)) => s.trim().to_ascii_lowercase().parse().ok(),
            _ => None,
        })
    }
}
