use std::sync::Arc;

use deeplist_llm::BoxFuture;
use deeplist_storage::{ChatId, DraftStore, MessageId, StorageResult};
use snafu::ResultExt;
use tokio::sync::watch;

use super::context::UserIdentity;
use super::error::{BlockingTaskSnafu, CollaboratorResult, StorageSnafu};
use super::message::{Attachment, ChatMessage, PendingFile};
use super::notice::Notifier;
use super::request::{AppendRequest, ReloadRequest, SubmitRequest, TransportRequest};

pub trait QuotaChecker: Send + Sync {
    /// Returns false when the user is over quota; the checker sends its own notice.
    fn check_limits_and_notify<'a>(
        &'a self,
        user: &'a UserIdentity,
    ) -> BoxFuture<'a, CollaboratorResult<bool>>;
}

pub trait ConversationGuarantor: Send + Sync {
    /// Creates a conversation seeded by the first message; `None` means creation was refused.
    fn ensure_chat_exists<'a>(
        &'a self,
        user: &'a UserIdentity,
        seed_text: &'a str,
        model_id: &'a str,
    ) -> BoxFuture<'a, CollaboratorResult<Option<ChatId>>>;

    /// Deletes a conversation created for a submission that was abandoned before use.
    fn discard_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>>;
}

pub trait FileUploader: Send + Sync {
    /// `None` means at least one file failed; the uploader sends its own notice.
    fn handle_file_uploads<'a>(
        &'a self,
        user: &'a UserIdentity,
        chat_id: &'a ChatId,
        files: &'a [PendingFile],
    ) -> BoxFuture<'a, CollaboratorResult<Option<Vec<Attachment>>>>;
}

/// Streaming backend that owns the request once it is handed off.
pub trait ChatTransport: Send + Sync {
    fn dispatch<'a>(&'a self, request: TransportRequest) -> BoxFuture<'a, CollaboratorResult<()>>;
    fn stop(&self);
    fn messages(&self) -> watch::Receiver<Vec<ChatMessage>>;

    fn submit(&self, request: SubmitRequest) -> BoxFuture<'_, CollaboratorResult<()>> {
        self.dispatch(TransportRequest::Submit(request))
    }

    fn append(&self, request: AppendRequest) -> BoxFuture<'_, CollaboratorResult<()>> {
        self.dispatch(TransportRequest::Append(request))
    }

    fn reload(&self, request: ReloadRequest) -> BoxFuture<'_, CollaboratorResult<()>> {
        self.dispatch(TransportRequest::Reload(request))
    }
}

pub trait MessageCache: Send + Sync {
    fn cache_and_add_message<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message: &'a ChatMessage,
    ) -> BoxFuture<'a, CollaboratorResult<()>>;

    /// Drops replies that were replaced, e.g. by a regenerated answer.
    fn forget_messages<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message_ids: &'a [MessageId],
    ) -> BoxFuture<'a, CollaboratorResult<()>>;
}

pub trait ConversationToucher: Send + Sync {
    fn touch<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>>;
}

/// Short-lived local URLs previewing files before upload.
pub trait PlaceholderUrls: Send + Sync {
    fn create(&self, file: &PendingFile) -> String;
    /// Revoking an unknown or already revoked URL is a no-op.
    fn revoke(&self, url: &str);
}

/// Services injected into the submission coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub quota: Arc<dyn QuotaChecker>,
    pub conversations: Arc<dyn ConversationGuarantor>,
    pub uploader: Arc<dyn FileUploader>,
    pub transport: Arc<dyn ChatTransport>,
    pub message_cache: Arc<dyn MessageCache>,
    pub drafts: Arc<dyn DraftStore>,
    pub toucher: Arc<dyn ConversationToucher>,
    pub notifier: Arc<dyn Notifier>,
    pub placeholders: Arc<dyn PlaceholderUrls>,
}

/// Runs a synchronous storage call off the async workers.
pub(crate) async fn run_blocking<T, F>(stage: &'static str, operation: F) -> CollaboratorResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .context(BlockingTaskSnafu { stage })?
        .context(StorageSnafu { stage })
}
