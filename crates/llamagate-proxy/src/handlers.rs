//! Fixed-shape llama.cpp endpoints that never touch a backend.

use llamagate_backends::BackendSelector;
use llamagate_http::{Response, StatusCode};
use llamagate_telemetry::MetricsRecorder;
use serde::Serialize;
use tracing::error;

/// Model name reported when no backend is configured.
const UNKNOWN_MODEL: &str = "unknown";
/// Template reported when no backend is configured.
const DEFAULT_TEMPLATE: &str = "chatml";

#[derive(Debug, Serialize)]
pub struct GenerationSettings {
    pub n_predict: i64,
    pub temperature: f64,
    pub top_p: f64,
}

/// `/props` and `/health` body.
#[derive(Debug, Serialize)]
pub struct Props {
    pub default_generation_settings: GenerationSettings,
    pub total_slots: u32,
    pub model: String,
    pub system_prompt: String,
}

#[derive(Debug, Serialize)]
pub struct Template {
    pub template: String,
}

#[derive(Debug, Serialize)]
pub struct Slot {
    pub slot: u32,
    pub in_use: bool,
    pub current_task: String,
    pub user: String,
    pub system_prompt: String,
}

#[derive(Debug, Serialize)]
pub struct Tokens {
    pub tokens: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct Text {
    pub text: String,
}

fn json<T: Serialize>(value: &T) -> Response {
    match Response::json(StatusCode::OK, value) {
        Ok(response) => response,
        Err(e) => {
            error!("failed to encode response: {}", e);
            Response::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response")
        }
    }
}

pub fn props(selector: &BackendSelector) -> Response {
    let model = selector
        .active()
        .map(|backend| backend.model)
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

    json(&Props {
        default_generation_settings: GenerationSettings {
            n_predict: 128,
            temperature: 0.7,
            top_p: 0.9,
        },
        total_slots: 1,
        model,
        system_prompt: String::new(),
    })
}

pub fn template(selector: &BackendSelector) -> Response {
    let template = selector
        .active()
        .map(|backend| backend.chat_template)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
    json(&Template { template })
}

pub fn slot() -> Response {
    json(&Slot {
        slot: 0,
        in_use: false,
        current_task: String::new(),
        user: String::new(),
        system_prompt: String::new(),
    })
}

pub fn tokenize() -> Response {
    json(&Tokens { tokens: Vec::new() })
}

pub fn detokenize() -> Response {
    json(&Text {
        text: String::new(),
    })
}

/// Text exposition from the installed recorder, or 404 when it has none.
pub fn metrics(recorder: &dyn MetricsRecorder) -> Response {
    match recorder.export() {
        Some(export) => Response::new(StatusCode::OK)
            .header("Content-Type", export.content_type)
            .body(export.body),
        None => Response::error(StatusCode::NOT_FOUND, "Metrics are not enabled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamagate_core::{BackendConfig, Provider};
    use llamagate_telemetry::NoopMetricsRecorder;
    use serde_json::Value;

    fn body(response: &Response) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn props_names_active_model() {
        let selector = BackendSelector::new(
            vec![
                BackendConfig::new("a", Provider::OpenAI, "http://127.0.0.1/v1", "gpt-a"),
                BackendConfig::new("b", Provider::Anthropic, "http://127.0.0.1/v1", "claude-b"),
            ],
            1,
            3,
        );
        let value = body(&props(&selector));
        assert_eq!(value["model"], "claude-b");
        assert_eq!(value["total_slots"], 1);
        assert_eq!(value["default_generation_settings"]["n_predict"], 128);
    }

    #[test]
    fn props_and_template_without_backends() {
        let selector = BackendSelector::new(Vec::new(), 0, 3);
        assert_eq!(body(&props(&selector))["model"], "unknown");
        assert_eq!(body(&template(&selector))["template"], "chatml");
    }

    #[test]
    fn template_uses_backend_setting() {
        let backend = BackendConfig::new("a", Provider::Custom, "http://127.0.0.1/v1", "m")
            .with_chat_template("llama3");
        let selector = BackendSelector::new(vec![backend], 0, 3);
        assert_eq!(body(&template(&selector))["template"], "llama3");
    }

    #[test]
    fn stubs_are_empty() {
        assert_eq!(body(&tokenize())["tokens"], serde_json::json!([]));
        assert_eq!(body(&detokenize())["text"], "");
        let slot = body(&slot());
        assert_eq!(slot["slot"], 0);
        assert_eq!(slot["in_use"], false);
    }

    #[test]
    fn metrics_without_exporter_is_not_found() {
        let response = metrics(&NoopMetricsRecorder);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
