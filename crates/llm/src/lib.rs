use std::sync::Arc;

use provider::UnsupportedProviderSnafu;

mod model;
mod provider;
mod rig_adapter;

pub use model::{
    CachedModels, DEFAULT_MODEL, MODEL_CACHE_TTL, Model, ModelCache, ModelCatalog,
    ModelCatalogSource, OPENROUTER_DEFAULT_MODEL, default_models, openrouter_default_models,
    shared_model_cache,
};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, StreamSender, StreamSessionId, StreamTarget,
    make_event_stream,
};
pub use rig_adapter::{
    OPENAI_PROVIDER_ID, OPENROUTER_ENDPOINT, OPENROUTER_PROVIDER_ID, RigProviderAdapter,
};

/// Builds the adapter for `config.provider_id`; blank ids mean OpenAI.
pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    let provider_id = match config.provider_id.to_ascii_lowercase().as_str() {
        "" | "openai" | "rig-openai" => OPENAI_PROVIDER_ID,
        "openrouter" => OPENROUTER_PROVIDER_ID,
        _ => {
            return UnsupportedProviderSnafu {
                stage: "create-provider",
                provider_id: config.provider_id,
            }
            .fail();
        }
    };
    let endpoint = if config.endpoint.is_empty() && provider_id == OPENROUTER_PROVIDER_ID {
        OPENROUTER_ENDPOINT.to_string()
    } else {
        config.endpoint
    };

    let adapter = RigProviderAdapter::new(ProviderConfig {
        provider_id: provider_id.to_string(),
        endpoint,
        ..config
    })?;
    Ok(Arc::new(adapter))
}

pub async fn fetch_models_for_provider(provider: &dyn LlmProvider) -> ProviderResult<ModelCatalog> {
    provider.fetch_models().await
}
