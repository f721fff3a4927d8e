use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::{Model, ModelCatalog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    /// OpenAI-compatible base URL; empty uses the provider's own.
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let trimmed = |value: String| value.trim().to_string();
        Self {
            provider_id: trimmed(provider_id.into()),
            api_key: trimmed(api_key.into()),
            endpoint: trimmed(endpoint.into()),
        }
    }
}

/// Provider-side speaker role, mapped from chat roles at the crate boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Identifier for one streaming generation.
///
/// Every submit, append or reload mints a fresh one so late chunks from an
/// abandoned stream can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(session_id: StreamSessionId) -> Self {
        Self { session_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One generation: the conversation so far plus per-request knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    /// Oldest first; the last user or assistant turn becomes the prompt.
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub max_tokens: Option<u64>,
    pub enable_search: bool,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            preamble: None,
            max_tokens: None,
            enable_search: false,
        }
    }

    pub fn with_preamble(self, preamble: impl Into<String>) -> Self {
        Self {
            preamble: Some(preamble.into()),
            ..self
        }
    }

    pub fn with_max_tokens(self, max_tokens: u64) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..self
        }
    }

    pub fn with_search(self, enable_search: bool) -> Self {
        Self {
            enable_search,
            ..self
        }
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    ReasoningDelta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider model list on `{stage}`: {source}"))]
    ModelPayloadParse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("provider model list on `{stage}` contained no models"))]
    EmptyModelList { stage: &'static str },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

/// Worker-side half of a stream; tags every payload with its target.
#[derive(Debug, Clone)]
pub struct StreamSender {
    target: StreamTarget,
    events: mpsc::UnboundedSender<StreamEventMapped>,
}

impl StreamSender {
    /// Returns false once the consumer has gone away.
    pub fn emit(&self, payload: StreamEventPayload) -> bool {
        self.events
            .send(StreamEventMapped {
                target: self.target,
                payload,
            })
            .is_ok()
    }
}

/// Fires the worker's cancel signal at most once, at the latest on drop.
struct CancelGuard(Option<oneshot::Sender<()>>);

impl CancelGuard {
    fn fire(&mut self) -> bool {
        self.0.take().is_some_and(|signal| signal.send(()).is_ok())
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Consumer half of a stream. Dropping it cancels the worker.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel: CancelGuard,
}

impl ProviderEventStream {
    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    /// Returns false when the worker was already told to stop or has exited.
    pub fn cancel(&mut self) -> bool {
        self.cancel.fire()
    }
}

/// What `stream_chat` hands back: events to read and a worker to spawn.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn fallback_models(&self) -> &[Model];
    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Wires a worker to its consumer.
///
/// The worker emits through the sender and should stop once the receiver
/// resolves, which happens on cancel or when the stream is dropped.
pub fn make_event_stream(
    target: StreamTarget,
) -> (StreamSender, ProviderEventStream, oneshot::Receiver<()>) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let sender = StreamSender {
        target,
        events: events_tx,
    };
    let stream = ProviderEventStream {
        events,
        cancel: CancelGuard(Some(cancel_tx)),
    };
    (sender, stream, cancel_rx)
}
