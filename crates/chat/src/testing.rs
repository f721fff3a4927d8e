use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use deeplist_llm::{
    BoxFuture, LlmProvider, Model, ModelCatalog, ProviderError, ProviderResult,
    ProviderStreamHandle, StreamEventPayload, StreamRequest, make_event_stream,
};
use deeplist_storage::{
    CachedMessage, ChatId, ConversationRecord, ConversationStore, DraftKey, DraftStore,
    MessageCacheStore, MessageId, NewConversation, StorageError, StorageResult, UsageDay,
    UsageStore, UserId,
};
use tokio::sync::{Notify, watch};

use crate::blob::BlobRegistry;
use crate::collaborators::{
    ChatTransport, Collaborators, ConversationGuarantor, ConversationToucher, FileUploader,
    MessageCache, QuotaChecker,
};
use crate::composer::Composer;
use crate::context::UserIdentity;
use crate::coordinator::ChatSubmissionCoordinator;
use crate::error::{CollaboratorError, CollaboratorResult};
use crate::message::{Attachment, ChatMessage, PendingFile};
use crate::message_list::MessageList;
use crate::notice::{Notice, Notifier};
use crate::request::TransportRequest;

fn unavailable(service: &'static str) -> CollaboratorError {
    CollaboratorError::Unavailable {
        stage: "test",
        service,
        details: "scripted failure".to_string(),
    }
}

#[derive(Default)]
pub(crate) struct MemoryDrafts {
    drafts: Mutex<HashMap<String, String>>,
}

impl MemoryDrafts {
    pub(crate) fn get(&self, key: &DraftKey) -> Option<String> {
        self.drafts.lock().unwrap().get(&key.storage_key()).cloned()
    }
}

impl DraftStore for MemoryDrafts {
    fn set_draft(&self, key: &DraftKey, text: &str) -> StorageResult<()> {
        let mut drafts = self.drafts.lock().unwrap();
        if text.is_empty() {
            drafts.remove(&key.storage_key());
        } else {
            drafts.insert(key.storage_key(), text.to_string());
        }
        Ok(())
    }

    fn draft(&self, key: &DraftKey) -> StorageResult<Option<String>> {
        Ok(self.get(key))
    }

    fn clear_draft(&self, key: &DraftKey) -> StorageResult<()> {
        self.drafts.lock().unwrap().remove(&key.storage_key());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryUsage {
    counts: Mutex<HashMap<(UserId, UsageDay), u64>>,
}

impl MemoryUsage {
    pub(crate) fn count(&self, user_id: &UserId, day: UsageDay) -> u64 {
        self.usage(user_id, day).unwrap()
    }
}

impl UsageStore for MemoryUsage {
    fn usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64> {
        let counts = self.counts.lock().unwrap();
        Ok(counts.get(&(user_id.clone(), day)).copied().unwrap_or_default())
    }

    fn increment_usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry((user_id.clone(), day)).or_default();
        *count += 1;
        Ok(*count)
    }
}

#[derive(Default)]
pub(crate) struct MemoryConversations {
    records: Mutex<Vec<ConversationRecord>>,
    clock: AtomicU64,
}

impl ConversationStore for MemoryConversations {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let record = ConversationRecord {
            id: ChatId::new_v7(),
            user_id: input.user_id,
            title: input.title,
            model_id: input.model_id,
            created_at_unix_millis: stamp,
            updated_at_unix_millis: stamp,
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    fn get_conversation(&self, chat_id: &ChatId) -> StorageResult<Option<ConversationRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|record| &record.id == chat_id).cloned())
    }

    fn list_conversations(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>> {
        let mut records = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| &record.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| right.updated_at_unix_millis.cmp(&left.updated_at_unix_millis));
        Ok(records)
    }

    fn touch_conversation(&self, chat_id: &ChatId) -> StorageResult<ConversationRecord> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|record| &record.id == chat_id)
            .ok_or_else(|| StorageError::NotFound {
                stage: "touch-conversation",
                entity: "conversation",
                id: chat_id.to_string(),
            })?;
        record.updated_at_unix_millis = stamp;
        Ok(record.clone())
    }

    fn delete_conversation(&self, chat_id: &ChatId) -> StorageResult<bool> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|record| &record.id != chat_id);
        Ok(records.len() != before)
    }
}

#[derive(Default)]
pub(crate) struct MemoryMessageCache {
    messages: Mutex<Vec<CachedMessage>>,
}

impl MessageCacheStore for MemoryMessageCache {
    fn cache_message(&self, message: CachedMessage) -> StorageResult<()> {
        let mut messages = self.messages.lock().unwrap();
        messages.retain(|existing| existing.id != message.id);
        messages.push(message);
        Ok(())
    }

    fn cached_messages(&self, chat_id: &ChatId) -> StorageResult<Vec<CachedMessage>> {
        let mut messages = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| &message.chat_id == chat_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by_key(|message| (message.created_at_unix_millis, message.id));
        Ok(messages)
    }

    fn remove_cached_messages(&self, chat_id: &ChatId, ids: &[MessageId]) -> StorageResult<usize> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|message| &message.chat_id != chat_id || !ids.contains(&message.id));
        Ok(before - messages.len())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub(crate) fn titles(&self) -> Vec<String> {
        self.notices()
            .into_iter()
            .map(|notice| notice.title)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct FakeQuota {
    pub(crate) allowed: AtomicBool,
    pub(crate) fail: AtomicBool,
    pub(crate) calls: AtomicUsize,
    on_check: Mutex<Option<Hook>>,
}

impl Default for FakeQuota {
    fn default() -> Self {
        Self {
            allowed: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            on_check: Mutex::new(None),
        }
    }
}

impl FakeQuota {
    pub(crate) fn deny(&self) {
        self.allowed.store(false, Ordering::SeqCst);
    }

    /// Runs `hook` while the check is in flight.
    pub(crate) fn on_check(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_check.lock().unwrap() = Some(Box::new(hook));
    }
}

impl QuotaChecker for FakeQuota {
    fn check_limits_and_notify<'a>(
        &'a self,
        _user: &'a UserIdentity,
    ) -> BoxFuture<'a, CollaboratorResult<bool>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.on_check.lock().unwrap().as_ref() {
                hook();
            }
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(unavailable("quota"));
            }
            Ok(self.allowed.load(Ordering::SeqCst))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GuarantorReply {
    Create(ChatId),
    Refuse,
    Fail,
}

pub(crate) struct FakeGuarantor {
    reply: Mutex<GuarantorReply>,
    seeds: Mutex<Vec<String>>,
    discarded: Mutex<Vec<ChatId>>,
    on_create: Mutex<Option<Hook>>,
}

impl Default for FakeGuarantor {
    fn default() -> Self {
        Self {
            reply: Mutex::new(GuarantorReply::Create(ChatId::new("c1"))),
            seeds: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            on_create: Mutex::new(None),
        }
    }
}

impl FakeGuarantor {
    pub(crate) fn reply_with(&self, reply: GuarantorReply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub(crate) fn seeds(&self) -> Vec<String> {
        self.seeds.lock().unwrap().clone()
    }

    pub(crate) fn discarded(&self) -> Vec<ChatId> {
        self.discarded.lock().unwrap().clone()
    }

    /// Runs `hook` while the conversation is being created.
    pub(crate) fn on_create(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_create.lock().unwrap() = Some(Box::new(hook));
    }
}

impl ConversationGuarantor for FakeGuarantor {
    fn ensure_chat_exists<'a>(
        &'a self,
        _user: &'a UserIdentity,
        seed_text: &'a str,
        _model_id: &'a str,
    ) -> BoxFuture<'a, CollaboratorResult<Option<ChatId>>> {
        Box::pin(async move {
            self.seeds.lock().unwrap().push(seed_text.to_string());
            if let Some(hook) = self.on_create.lock().unwrap().as_ref() {
                hook();
            }
            tokio::task::yield_now().await;
            match self.reply.lock().unwrap().clone() {
                GuarantorReply::Create(chat_id) => Ok(Some(chat_id)),
                GuarantorReply::Refuse => Ok(None),
                GuarantorReply::Fail => Err(unavailable("conversations")),
            }
        })
    }

    fn discard_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            self.discarded.lock().unwrap().push(chat_id.clone());
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadReply {
    Succeed,
    Refuse,
    Fail,
}

pub(crate) struct FakeUploader {
    reply: Mutex<UploadReply>,
    batches: Mutex<Vec<(ChatId, usize)>>,
}

impl Default for FakeUploader {
    fn default() -> Self {
        Self {
            reply: Mutex::new(UploadReply::Succeed),
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl FakeUploader {
    pub(crate) fn reply_with(&self, reply: UploadReply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub(crate) fn batches(&self) -> Vec<(ChatId, usize)> {
        self.batches.lock().unwrap().clone()
    }
}

impl FileUploader for FakeUploader {
    fn handle_file_uploads<'a>(
        &'a self,
        _user: &'a UserIdentity,
        chat_id: &'a ChatId,
        files: &'a [PendingFile],
    ) -> BoxFuture<'a, CollaboratorResult<Option<Vec<Attachment>>>> {
        Box::pin(async move {
            self.batches
                .lock()
                .unwrap()
                .push((chat_id.clone(), files.len()));
            tokio::task::yield_now().await;
            let reply = *self.reply.lock().unwrap();
            match reply {
                UploadReply::Succeed => Ok(Some(
                    files
                        .iter()
                        .map(|file| {
                            Attachment::persisted(
                                file.name.clone(),
                                file.content_type.clone(),
                                format!("https://files.example/{chat_id}/{}", file.name),
                            )
                        })
                        .collect(),
                )),
                UploadReply::Refuse => Ok(None),
                UploadReply::Fail => Err(unavailable("uploads")),
            }
        })
    }
}

/// Records requests and the visible list at the moment of each handoff.
pub(crate) struct RecordingTransport {
    messages: MessageList,
    requests: Mutex<Vec<TransportRequest>>,
    visible_at_dispatch: Mutex<Vec<Vec<ChatMessage>>>,
    pub(crate) fail: AtomicBool,
    pub(crate) stops: AtomicUsize,
}

impl RecordingTransport {
    pub(crate) fn new(messages: MessageList) -> Self {
        Self {
            messages,
            requests: Mutex::new(Vec::new()),
            visible_at_dispatch: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn visible_at_dispatch(&self) -> Vec<Vec<ChatMessage>> {
        self.visible_at_dispatch.lock().unwrap().clone()
    }
}

impl ChatTransport for RecordingTransport {
    fn dispatch<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            self.visible_at_dispatch
                .lock()
                .unwrap()
                .push(self.messages.snapshot());
            self.requests.lock().unwrap().push(request);
            if self.fail.load(Ordering::SeqCst) {
                return Err(unavailable("transport"));
            }
            Ok(())
        })
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.subscribe()
    }
}

#[derive(Default)]
pub(crate) struct RecordingMessageCache {
    messages: Mutex<Vec<(ChatId, ChatMessage)>>,
}

impl RecordingMessageCache {
    pub(crate) fn messages(&self) -> Vec<(ChatId, ChatMessage)> {
        self.messages.lock().unwrap().clone()
    }
}

impl MessageCache for RecordingMessageCache {
    fn cache_and_add_message<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message: &'a ChatMessage,
    ) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            self.messages
                .lock()
                .unwrap()
                .push((chat_id.clone(), message.clone()));
            Ok(())
        })
    }

    fn forget_messages<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message_ids: &'a [MessageId],
    ) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            self.messages.lock().unwrap().retain(|(cached_chat, message)| {
                cached_chat != chat_id || !message_ids.contains(&message.id)
            });
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingToucher {
    touched: Mutex<Vec<ChatId>>,
}

impl RecordingToucher {
    pub(crate) fn touched(&self) -> Vec<ChatId> {
        self.touched.lock().unwrap().clone()
    }
}

impl ConversationToucher for RecordingToucher {
    fn touch<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(async move {
            self.touched.lock().unwrap().push(chat_id.clone());
            Ok(())
        })
    }
}

/// Coordinator wired to fakes, each reachable for inspection.
pub(crate) struct Harness {
    pub(crate) quota: Arc<FakeQuota>,
    pub(crate) conversations: Arc<FakeGuarantor>,
    pub(crate) uploader: Arc<FakeUploader>,
    pub(crate) transport: Arc<RecordingTransport>,
    pub(crate) cache: Arc<RecordingMessageCache>,
    pub(crate) drafts: Arc<MemoryDrafts>,
    pub(crate) toucher: Arc<RecordingToucher>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) placeholders: Arc<BlobRegistry>,
    pub(crate) messages: MessageList,
    pub(crate) composer: Composer,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let messages = MessageList::new();
        let drafts = Arc::new(MemoryDrafts::default());
        Self {
            quota: Arc::new(FakeQuota::default()),
            conversations: Arc::new(FakeGuarantor::default()),
            uploader: Arc::new(FakeUploader::default()),
            transport: Arc::new(RecordingTransport::new(messages.clone())),
            cache: Arc::new(RecordingMessageCache::default()),
            composer: Composer::new(drafts.clone()),
            drafts,
            toucher: Arc::new(RecordingToucher::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            placeholders: Arc::new(BlobRegistry::new()),
            messages,
        }
    }

    pub(crate) fn coordinator(&self, max_message_length: usize) -> ChatSubmissionCoordinator {
        self.coordinator_with(max_message_length, self.transport.clone(), self.cache.clone())
    }

    /// Same wiring with a real transport or cache in place of the recording fakes.
    pub(crate) fn coordinator_with(
        &self,
        max_message_length: usize,
        transport: Arc<dyn ChatTransport>,
        message_cache: Arc<dyn MessageCache>,
    ) -> ChatSubmissionCoordinator {
        let deps = Collaborators {
            quota: self.quota.clone(),
            conversations: self.conversations.clone(),
            uploader: self.uploader.clone(),
            transport,
            message_cache,
            drafts: self.drafts.clone(),
            toucher: self.toucher.clone(),
            notifier: self.notifier.clone(),
            placeholders: self.placeholders.clone(),
        };
        ChatSubmissionCoordinator::new(
            deps,
            self.composer.clone(),
            self.messages.clone(),
            max_message_length,
        )
    }
}

/// Replays a fixed script of stream events for every request.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    pub(crate) script: Vec<StreamEventPayload>,
    pub(crate) hold_open: bool,
    pub(crate) fail: bool,
    pub(crate) requests: Mutex<Vec<StreamRequest>>,
    pub(crate) cancelled: Arc<Notify>,
}

impl ScriptedProvider {
    pub(crate) fn replying(chunks: &[&str]) -> Self {
        let mut script = chunks
            .iter()
            .map(|chunk| StreamEventPayload::Delta(chunk.to_string()))
            .collect::<Vec<_>>();
        script.push(StreamEventPayload::Done);
        Self {
            script,
            ..Self::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "m1"
    }

    fn fallback_models(&self) -> &[Model] {
        &[]
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async { Ok(ModelCatalog::from_provider_api(Vec::new())) })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let target = request.target;
        self.requests.lock().unwrap().push(request);
        if self.fail {
            return Err(ProviderError::EmptyMessageSet {
                stage: "scripted",
                target,
            });
        }

        let (sender, stream, cancel_rx) = make_event_stream(target);
        let script = self.script.clone();
        let hold_open = self.hold_open;
        let cancelled = self.cancelled.clone();
        let worker = Box::pin(async move {
            for payload in script {
                sender.emit(payload);
            }
            if hold_open && cancel_rx.await.is_ok() {
                cancelled.notify_one();
            }
        });
        Ok(ProviderStreamHandle { stream, worker })
    }
}
