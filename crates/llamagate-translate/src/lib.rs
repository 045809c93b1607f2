//! Schema translation between the llama.cpp completion API and upstream
//! chat-completion providers.
//!
//! Requests go out as OpenAI chat-completions (OpenAI and custom backends) or
//! Anthropic messages. Responses come back as either a whole JSON body or one
//! SSE event at a time and are mapped onto [`ChatResult`].

pub mod request;
pub mod response;

pub use request::{
    provider_headers, to_provider_request, AnthropicRequest, ChatMessage, LlamaRequest,
    OpenAiRequest, ProviderRequest, ANTHROPIC_DEFAULT_MAX_TOKENS, ANTHROPIC_VERSION,
};
pub use response::{extract, from_provider_fragment, translate_fragment, ChatResult, Extracted};
