use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::oneshot;

use super::model::{
    CachedModels, DEFAULT_MODEL, Model, ModelCache, ModelCatalog, ModelListing,
    OPENROUTER_DEFAULT_MODEL, default_models, openrouter_default_models, shared_model_cache,
};
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyMessageSetSnafu, EmptyModelListSnafu,
    HttpClientSnafu, LlmProvider, MissingApiKeySnafu, ModelFetchStatusSnafu,
    ModelPayloadParseSnafu, ProviderConfig, ProviderError, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEventPayload, StreamRequest, StreamSender,
    StreamTarget, make_event_stream,
};

pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const OPENROUTER_PROVIDER_ID: &str = "openrouter";
pub const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1";

// OpenRouter enables its web-search plugin for any model id carrying this suffix.
const OPENROUTER_SEARCH_SUFFIX: &str = ":online";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let fallback_models = if Self::is_openrouter(&config) {
            openrouter_default_models()
        } else {
            default_models()
        };
        Ok(Self {
            config,
            fallback_models,
            model_cache: shared_model_cache(),
        })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let models = Self::parse_model_listing(&payload)?;
        tracing::debug!(
            provider_id = %self.config.provider_id,
            model_count = models.len(),
            "fetched provider model listing"
        );
        Ok(models)
    }

    fn parse_model_listing(payload: &str) -> ProviderResult<Vec<Model>> {
        let listing = serde_json::from_str::<ModelListing>(payload).context(
            ModelPayloadParseSnafu {
                stage: "parse-model-response",
            },
        )?;

        let models = listing.into_models();
        ensure!(
            !models.is_empty(),
            EmptyModelListSnafu {
                stage: "parse-model-response",
            }
        );
        Ok(models)
    }

    fn is_openrouter(config: &ProviderConfig) -> bool {
        config.provider_id == OPENROUTER_PROVIDER_ID
    }

    fn request_model_id(config: &ProviderConfig, request: &StreamRequest) -> String {
        if !request.enable_search {
            return request.model_id.clone();
        }

        if !Self::is_openrouter(config) {
            tracing::debug!(
                provider_id = %config.provider_id,
                model_id = %request.model_id,
                "web search requested but provider has no search routing; sending plain request"
            );
            return request.model_id.clone();
        }

        if request.model_id.ends_with(OPENROUTER_SEARCH_SUFFIX) {
            request.model_id.clone()
        } else {
            format!("{}{}", request.model_id, OPENROUTER_SEARCH_SUFFIX)
        }
    }

    /// Splits chat turns into the history and the final prompt rig expects.
    fn prompt_and_history(
        request: &StreamRequest,
    ) -> ProviderResult<(RigMessage, Vec<RigMessage>)> {
        let mut turns = request
            .messages
            .iter()
            .filter_map(|message| match message.role {
                Role::System => None,
                Role::User => Some(RigMessage::user(message.content.clone())),
                Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
            })
            .collect::<Vec<_>>();

        let prompt = turns.pop().context(EmptyMessageSetSnafu {
            stage: "split-prompt",
            target: request.target,
        })?;
        Ok((prompt, turns))
    }

    /// Request preamble followed by any system-role turns, blank parts skipped.
    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let system_turns = request
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str());
        let parts = request
            .preamble
            .as_deref()
            .into_iter()
            .chain(system_turns)
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>();

        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let model_id = Self::request_model_id(config, request);
        let (prompt, history) = Self::prompt_and_history(request).inspect_err(|_| {
            tracing::warn!(
                target = ?request.target,
                %model_id,
                message_count = request.messages.len(),
                "no user or assistant turns left to send"
            );
        })?;

        let client = Self::build_client(config)?;
        let mut builder = client
            .completion_model(model_id)
            .completion_request(prompt)
            .messages(history);
        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        sender: StreamSender,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let forwarder = StreamForwarder {
            target: request.target,
            sender,
        };
        let stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?request.target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    %error,
                    "failed to open provider stream"
                );
                forwarder.sender.emit(StreamEventPayload::Error(error.to_string()));
                return;
            }
        };

        let ending = forwarder.pump(stream, cancel_rx).await;
        tracing::debug!(target = ?request.target, ?ending, "provider stream ended");
        if ending == StreamEnding::Completed {
            forwarder.sender.emit(StreamEventPayload::Done);
        }
    }

    async fn catalog_without_provider(
        &self,
        cached: CachedModels,
        error: ProviderError,
    ) -> ModelCatalog {
        let warning = error.to_string();
        match cached {
            CachedModels::Fresh(models) | CachedModels::Stale(models) => {
                tracing::warn!(
                    provider_id = %self.id(),
                    cached_model_count = models.len(),
                    %warning,
                    "model fetch failed; serving stale cached models"
                );
                ModelCatalog::from_cache_stale(models, warning)
            }
            CachedModels::Missing => {
                tracing::warn!(
                    provider_id = %self.id(),
                    fallback_model_count = self.fallback_models.len(),
                    %warning,
                    "model fetch failed without cache; serving static fallback models"
                );
                ModelCatalog::from_static_fallback(self.fallback_models.clone(), warning)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnding {
    Completed,
    Cancelled,
    Failed,
    ReceiverGone,
}

/// Forwards rig stream items to one event receiver.
struct StreamForwarder {
    target: StreamTarget,
    sender: StreamSender,
}

impl StreamForwarder {
    async fn pump(
        &self,
        mut stream: RigStreamingResponse,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> StreamEnding {
        loop {
            let item = tokio::select! {
                _ = &mut cancel_rx => {
                    stream.cancel();
                    return StreamEnding::Cancelled;
                }
                item = stream.next() => item,
            };

            match item {
                None => return StreamEnding::Completed,
                Some(Ok(content)) => {
                    let Some(payload) = Self::payload_of(content) else {
                        continue;
                    };
                    if !self.sender.emit(payload) {
                        return StreamEnding::ReceiverGone;
                    }
                }
                Some(Err(source)) => {
                    tracing::warn!(
                        target = ?self.target,
                        error = %source,
                        "provider stream failed mid-reply"
                    );
                    let error = ProviderError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    };
                    self.sender.emit(StreamEventPayload::Error(error.to_string()));
                    return StreamEnding::Failed;
                }
            }
        }
    }

    fn payload_of<R>(content: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match content {
            StreamedAssistantContent::Text(text) => Some(StreamEventPayload::Delta(text.text)),
            StreamedAssistantContent::Reasoning(reasoning) => Some(reasoning.reasoning.concat())
                .filter(|text| !text.is_empty())
                .map(StreamEventPayload::ReasoningDelta),
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => Some(reasoning)
                .filter(|text| !text.is_empty())
                .map(StreamEventPayload::ReasoningDelta),
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        if Self::is_openrouter(&self.config) {
            "OpenRouter"
        } else {
            "OpenAI"
        }
    }

    fn default_model(&self) -> &str {
        if Self::is_openrouter(&self.config) {
            OPENROUTER_DEFAULT_MODEL
        } else {
            DEFAULT_MODEL
        }
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            let cached = match self.model_cache.lookup(self.id()).await {
                CachedModels::Fresh(models) => return Ok(ModelCatalog::from_cache_fresh(models)),
                other => other,
            };

            Ok(match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.store(self.id(), models.clone()).await;
                    ModelCatalog::from_provider_api(models)
                }
                Err(error) => self.catalog_without_provider(cached, error).await,
            })
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (sender, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            sender,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
