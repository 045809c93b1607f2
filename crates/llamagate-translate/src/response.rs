//! Provider fragment in, llama.cpp completion out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use llamagate_core::BackendConfig;

use crate::request::LlamaRequest;

/// The llama.cpp completion shape returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub stop: bool,
    pub id_slot: i32,
}

impl ChatResult {
    pub fn new<S: Into<String>>(content: S, stop: bool) -> Self {
        Self {
            content: content.into(),
            stop,
            id_slot: 0,
        }
    }

    /// Terminal result carrying an error message.
    pub fn error<S: std::fmt::Display>(message: S) -> Self {
        Self::new(format!("Error: {}", message), true)
    }

    pub fn to_json(&self) -> String {
        // Plain strings, a bool and an int cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `data: <json>` for one streamed unit.
    pub fn to_sse(&self) -> String {
        format!("data: {}", self.to_json())
    }
}

/// Text and completion flag pulled out of one provider fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub content: String,
    pub terminal: bool,
}

/// Find the generated text in any of the supported provider shapes.
///
/// Lookup order: `choices[0].message.content`, `choices[0].text`,
/// `choices[0].delta.content`, top-level `content` (string, first array
/// element's `text`, or an object's `text`), then `completion`, `text`,
/// `output`. The first non-empty value wins.
pub fn extract(value: &Value) -> Extracted {
    let mut out = Extracted::default();

    if let Some(first) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        out.terminal = is_set(first.get("finish_reason"));
        out.content = first_text([
            first.get("message").and_then(|m| m.get("content")),
            first.get("text"),
            first.get("delta").and_then(|d| d.get("content")),
        ]);
    }

    if is_set(value.get("stop_reason")) {
        out.terminal = true;
    }

    if out.content.is_empty() {
        out.content = value.get("content").map(top_level_content).unwrap_or_default();
    }

    if out.content.is_empty() {
        out.content = first_text([
            value.get("completion"),
            value.get("text"),
            value.get("output"),
        ]);
    }

    out
}

fn is_set(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn first_text<const N: usize>(candidates: [Option<&Value>; N]) -> String {
    candidates
        .into_iter()
        .flatten()
        .map(as_text)
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

fn top_level_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => match items.first() {
            Some(first) => match first.get("text") {
                Some(text) => as_text(text),
                None => as_text(first),
            },
            None => String::new(),
        },
        Value::Object(_) => content.get("text").map(as_text).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Turn one provider fragment into a result, or `None` when there is nothing
/// to emit.
///
/// Streaming results are only emitted when they carry text or end the stream.
/// A non-streaming result is always terminal. Unparseable input becomes a
/// terminal error result rather than a failure.
pub fn translate_fragment(fragment: &str, stream: bool) -> Option<ChatResult> {
    if fragment.trim().is_empty() {
        return Some(ChatResult::error("Empty response from API"));
    }

    let value: Value = match serde_json::from_str(fragment) {
        Ok(value) => value,
        Err(err) => {
            warn!("failed to parse provider fragment: {}", err);
            return Some(ChatResult::error(format!(
                "Failed to parse API response - {}",
                err
            )));
        }
    };

    let Extracted { content, terminal } = extract(&value);

    if content.is_empty() && !terminal {
        debug!(fragment = %fragment, "no content in provider fragment");
        if stream {
            return None;
        }
    }

    Some(ChatResult::new(content, !stream || terminal))
}

/// Render one provider fragment for the llama.cpp caller.
///
/// Returns `data: <json>` for streaming requests, the bare JSON otherwise, and
/// an empty string when the fragment should be skipped.
pub fn from_provider_fragment(
    fragment: &str,
    request: &LlamaRequest,
    backend: &BackendConfig,
) -> String {
    let stream = request.is_stream();
    match translate_fragment(fragment, stream) {
        Some(result) if stream => result.to_sse(),
        Some(result) => result.to_json(),
        None => {
            debug!(backend = %backend.name, "skipping empty stream fragment");
            String::new()
        }
    }
}
