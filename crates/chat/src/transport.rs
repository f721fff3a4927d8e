use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deeplist_llm::{
    BoxFuture, LlmProvider, ProviderEventStream, ProviderMessage, StreamEventPayload,
    StreamRequest, StreamSessionId, StreamTarget,
};
use deeplist_storage::{ChatId, MessageId};
use snafu::{OptionExt, ResultExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::collaborators::{ChatTransport, MessageCache};
use super::error::{CollaboratorResult, NothingToReloadSnafu, ProviderSnafu, StreamBusySnafu};
use super::message::{ChatMessage, MessageStatus, Role};
use super::message_list::MessageList;
use super::request::TransportRequest;

const STREAM_ENDED_EARLY: &str = "provider stream ended before a terminal event";

struct ActiveStream {
    target: StreamTarget,
    chat_id: ChatId,
    assistant_message_id: MessageId,
    reader: Option<JoinHandle<()>>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveStream>>>;

/// Streams replies from an [`LlmProvider`] into the visible message list.
///
/// One stream at a time: a request made while a reply is streaming is refused
/// until the reply finishes or [`ChatTransport::stop`] is called.
pub struct ProviderTransport {
    provider: Arc<dyn LlmProvider>,
    messages: MessageList,
    cache: Option<Arc<dyn MessageCache>>,
    model_max_tokens: HashMap<String, u64>,
    next_session_id: AtomicU64,
    active: ActiveSlot,
}

impl ProviderTransport {
    pub fn new(provider: Arc<dyn LlmProvider>, messages: MessageList) -> Self {
        Self {
            provider,
            messages,
            cache: None,
            model_max_tokens: HashMap::new(),
            next_session_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Completed assistant replies are written to `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_model_max_tokens(mut self, limits: HashMap<String, u64>) -> Self {
        self.model_max_tokens = limits;
        self
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Opens the stream and returns the ids of replies a reload dropped.
    fn start(&self, request: TransportRequest) -> CollaboratorResult<Vec<MessageId>> {
        let kind = request.kind();
        let body = request.body().clone();
        let snapshot = self.messages.snapshot();

        let (mut history, new_user, reload_anchor) = match request {
            TransportRequest::Submit(request) => (
                history_of(&snapshot),
                Some(ChatMessage::user(request.input, request.attachments)),
                None,
            ),
            TransportRequest::Append(request) => (
                history_of(&snapshot),
                Some(ChatMessage::user(request.message, Vec::new())),
                None,
            ),
            TransportRequest::Reload(_) => {
                let anchor = snapshot
                    .iter()
                    .rposition(|message| message.role == Role::User && message.is_history())
                    .context(NothingToReloadSnafu {
                        stage: "reload-find-user-message",
                    })?;
                (
                    history_of(&snapshot[..=anchor]),
                    None,
                    Some(snapshot[anchor].id),
                )
            }
        };
        if let Some(user) = &new_user {
            history.push(ProviderMessage::new(
                user.role.to_provider(),
                user.provider_content(),
            ));
        }

        let session_id = StreamSessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let target = StreamTarget::new(session_id);
        let assistant = ChatMessage::assistant_streaming();
        let assistant_message_id = assistant.id;

        {
            let mut active = lock(&self.active);
            if let Some(current) = active.as_ref() {
                return StreamBusySnafu {
                    stage: "reserve-stream",
                    chat_id: current.chat_id.to_string(),
                }
                .fail();
            }
            *active = Some(ActiveStream {
                target,
                chat_id: body.chat_id.clone(),
                assistant_message_id,
                reader: None,
            });
        }

        let mut stream_request = StreamRequest::new(target, body.model.clone(), history)
            .with_preamble(body.system_prompt.clone())
            .with_search(body.enable_search);
        if let Some(max_tokens) = self.model_max_tokens.get(&body.model) {
            stream_request = stream_request.with_max_tokens(*max_tokens);
        }

        let handle = match self
            .provider
            .stream_chat(stream_request)
            .context(ProviderSnafu {
                stage: "open-provider-stream",
            }) {
            Ok(handle) => handle,
            Err(error) => {
                release_if_current(&self.active, target);
                return Err(error);
            }
        };

        let mut replaced = Vec::new();
        if let Some(anchor) = reload_anchor {
            replaced = snapshot
                .iter()
                .skip_while(|message| message.id != anchor)
                .skip(1)
                .map(|message| message.id)
                .collect();
            self.messages.truncate_after(anchor);
        }
        if let Some(user) = new_user {
            self.messages.push(user);
        }
        self.messages.push(assistant);

        tokio::spawn(handle.worker);
        let pump = StreamPump {
            target,
            chat_id: body.chat_id.clone(),
            assistant_message_id,
            messages: self.messages.clone(),
            cache: self.cache.clone(),
            active: self.active.clone(),
        };
        let reader = tokio::spawn(pump.run(handle.stream));
        if let Some(active) = lock(&self.active).as_mut() {
            if active.target == target {
                active.reader = Some(reader);
            }
        }

        tracing::info!(
            kind,
            chat_id = %body.chat_id,
            model = %body.model,
            session = session_id.0,
            "provider stream started"
        );
        Ok(replaced)
    }

    async fn forget_replaced(&self, chat_id: &ChatId, replaced: &[MessageId]) {
        let Some(cache) = &self.cache else {
            return;
        };
        if replaced.is_empty() {
            return;
        }
        if let Err(error) = cache.forget_messages(chat_id, replaced).await {
            tracing::warn!(%chat_id, %error, "failed to drop replaced replies from the cache");
        }
    }
}

impl ChatTransport for ProviderTransport {
    fn dispatch<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            let chat_id = request.body().chat_id.clone();
            let replaced = self.start(request)?;
            self.forget_replaced(&chat_id, &replaced).await;
            Ok(())
        })
    }

    fn stop(&self) {
        let Some(active) = lock(&self.active).take() else {
            return;
        };

        // Aborting the reader drops the event stream, which cancels the provider worker.
        if let Some(reader) = active.reader {
            reader.abort();
        }
        self.messages.update(active.assistant_message_id, |message| {
            message.status = MessageStatus::Cancelled;
        });
        tracing::info!(
            chat_id = %active.chat_id,
            session = active.target.session_id.0,
            "provider stream cancelled"
        );
    }

    fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.subscribe()
    }
}

/// Reads one provider stream into its assistant message.
struct StreamPump {
    target: StreamTarget,
    chat_id: ChatId,
    assistant_message_id: MessageId,
    messages: MessageList,
    cache: Option<Arc<dyn MessageCache>>,
    active: ActiveSlot,
}

impl StreamPump {
    async fn run(self, mut stream: ProviderEventStream) {
        while let Some(event) = stream.recv().await {
            if event.target != self.target {
                continue;
            }
            if !self.is_current() {
                return;
            }

            match event.payload {
                StreamEventPayload::Delta(chunk) => {
                    self.messages.update(self.assistant_message_id, |message| {
                        message.content.push_str(&chunk);
                    });
                }
                StreamEventPayload::ReasoningDelta(chunk) => {
                    self.messages.update(self.assistant_message_id, |message| {
                        message.reasoning.push_str(&chunk);
                    });
                }
                StreamEventPayload::Done => {
                    self.finish(MessageStatus::Done).await;
                    return;
                }
                StreamEventPayload::Error(message) => {
                    self.finish(MessageStatus::Error(message)).await;
                    return;
                }
            }
        }

        self.finish(MessageStatus::Error(STREAM_ENDED_EARLY.to_string()))
            .await;
    }

    fn is_current(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|active| active.target == self.target)
    }

    async fn finish(&self, status: MessageStatus) {
        if !release_if_current(&self.active, self.target) {
            return;
        }

        let mut finished = None;
        self.messages.update(self.assistant_message_id, |message| {
            message.status = status;
            finished = Some(message.clone());
        });
        let Some(message) = finished else {
            return;
        };

        match &message.status {
            MessageStatus::Error(error) => {
                tracing::warn!(chat_id = %self.chat_id, %error, "provider stream failed");
            }
            _ => {
                tracing::debug!(
                    chat_id = %self.chat_id,
                    chars = message.content.chars().count(),
                    "provider stream finished"
                );
            }
        }

        if message.status != MessageStatus::Done {
            return;
        }
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.cache_and_add_message(&self.chat_id, &message).await {
                tracing::warn!(chat_id = %self.chat_id, %error, "failed to cache assistant reply");
            }
        }
    }
}

fn history_of(messages: &[ChatMessage]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|message| message.is_history())
        .map(|message| ProviderMessage::new(message.role.to_provider(), message.provider_content()))
        .collect()
}

fn lock(active: &Mutex<Option<ActiveStream>>) -> MutexGuard<'_, Option<ActiveStream>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the active slot when it still belongs to `target`.
fn release_if_current(active: &Mutex<Option<ActiveStream>>, target: StreamTarget) -> bool {
    let mut active = lock(active);
    if active.as_ref().is_some_and(|current| current.target == target) {
        *active = None;
        return true;
    }
    false
}
