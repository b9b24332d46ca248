//! Provider boundary: outbound request payloads, the streaming provider
//! trait, and the Gemini adapter.

use std::sync::Arc;

mod gemini;
mod provider;

pub use gemini::{
    DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, GEMINI_PROVIDER_ID, GeminiAdapter,
};
pub use provider::{
    GenerateRequest, LlmProvider, Part, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Turn, make_event_stream,
};

/// Builds a provider adapter for the configured provider id.
pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" => {
            config.provider_id = GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(GeminiAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
