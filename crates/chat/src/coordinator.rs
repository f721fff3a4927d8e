use deeplist_storage::{ChatId, DraftKey, MessageId};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::watch;

use super::collaborators::{Collaborators, run_blocking};
use super::composer::Composer;
use super::context::{AgentProfile, SubmissionContext, UserIdentity};
use super::error::{
    CollaboratorSnafu, ConversationUnavailableSnafu, MessageTooLongSnafu, QuotaDeniedSnafu,
    SubmitError, SupersededSnafu, UploadFailedSnafu,
};
use super::message::{Attachment, ChatMessage, PendingFile};
use super::message_list::MessageList;
use super::notice::Notice;
use super::prompt::{DEFAULT_SYSTEM_PROMPT, resolve_system_prompt};
use super::request::{AppendRequest, ChatRequestBody, ReloadRequest, SubmitRequest};

pub const SIGN_IN_NOTICE: &str = "Please sign in to send messages";
pub const SEND_FAILED_NOTICE: &str = "Failed to send message";
pub const SUGGESTION_FAILED_NOTICE: &str = "Failed to send suggestion";
pub const RELOAD_FAILED_NOTICE: &str = "Failed to regenerate response";

/// Progress of one submission.
///
/// Every phase before `HandedOffToTransport` can fall back to `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionPhase {
    Idle,
    Validating,
    OptimisticallyInserted,
    QuotaChecked,
    ConversationEnsured,
    LengthRevalidated,
    FilesUploaded,
    HandedOffToTransport,
    Settled,
    RolledBack,
}

impl SubmissionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::OptimisticallyInserted => "optimistically-inserted",
            Self::QuotaChecked => "quota-checked",
            Self::ConversationEnsured => "conversation-ensured",
            Self::LengthRevalidated => "length-revalidated",
            Self::FilesUploaded => "files-uploaded",
            Self::HandedOffToTransport => "handed-off-to-transport",
            Self::Settled => "settled",
            Self::RolledBack => "rolled-back",
        }
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Blank input and no files.
    NothingToSend,
    SignInRequired,
    Sent {
        chat_id: ChatId,
        message_id: MessageId,
    },
    RolledBack {
        /// Last phase completed before the failure.
        reached: SubmissionPhase,
        error: SubmitError,
    },
}

impl SubmitOutcome {
    pub fn phase(&self) -> SubmissionPhase {
        match self {
            Self::NothingToSend => SubmissionPhase::Idle,
            Self::SignInRequired => SubmissionPhase::Validating,
            Self::Sent { .. } => SubmissionPhase::Settled,
            Self::RolledBack { .. } => SubmissionPhase::RolledBack,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Bookkeeping for one optimistic message until it settles or rolls back.
struct InFlight {
    temp_id: MessageId,
    created_at_unix_millis: u64,
    placeholder_urls: Vec<String>,
    epoch: u64,
    phase: SubmissionPhase,
}

impl InFlight {
    fn new(message: &ChatMessage, epoch: u64) -> Self {
        Self {
            temp_id: message.id,
            created_at_unix_millis: message.created_at_unix_millis,
            placeholder_urls: message
                .attachments
                .iter()
                .filter(|attachment| attachment.is_placeholder())
                .map(|attachment| attachment.url.clone())
                .collect(),
            epoch,
            phase: SubmissionPhase::OptimisticallyInserted,
        }
    }
}

struct Handoff {
    chat_id: ChatId,
    attachments: Vec<Attachment>,
    created_conversation: bool,
}

/// Drives a user message from the composer to the transport.
///
/// The optimistic message is visible from the first step; any failure before
/// handoff removes it again and releases its placeholder URLs.
pub struct ChatSubmissionCoordinator {
    deps: Collaborators,
    composer: Composer,
    messages: MessageList,
    max_message_length: usize,
}

impl ChatSubmissionCoordinator {
    pub fn new(
        deps: Collaborators,
        composer: Composer,
        messages: MessageList,
        max_message_length: usize,
    ) -> Self {
        Self {
            deps,
            composer,
            messages,
            max_message_length,
        }
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn messages(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.subscribe()
    }

    pub async fn submit(&self, context: &SubmissionContext) -> SubmitOutcome {
        let input = self.composer.input();
        let files = self.composer.pending_files();
        if input.trim().is_empty() && files.is_empty() {
            return SubmitOutcome::NothingToSend;
        }
        let Some(user) = context.user.as_ref() else {
            self.deps.notifier.notify(Notice::error(SIGN_IN_NOTICE));
            return SubmitOutcome::SignInRequired;
        };

        let epoch = self.composer.epoch();
        let active_chat = self.composer.chat_id();
        let had_prior_messages = !self.messages.is_empty();

        let placeholders = files
            .iter()
            .map(|file| Attachment::placeholder(file, self.deps.placeholders.create(file)))
            .collect::<Vec<_>>();
        let agent = context.agent.as_ref().map(AgentProfile::agent_ref);
        let optimistic = ChatMessage::optimistic_user(input.clone(), placeholders, agent.clone());
        let mut flight = InFlight::new(&optimistic, epoch);
        self.messages.push(optimistic);
        self.composer.clear_input();
        self.composer.clear_pending_files();

        let handoff = match self
            .run_submit(context, user, &input, &files, active_chat.as_ref(), &mut flight)
            .await
        {
            Ok(handoff) => handoff,
            Err(error) => return self.roll_back(flight, error, SEND_FAILED_NOTICE),
        };

        self.release(&flight);
        let message = ChatMessage {
            id: flight.temp_id,
            created_at_unix_millis: flight.created_at_unix_millis,
            ..ChatMessage::user(input, handoff.attachments).with_agent(agent)
        };
        if let Err(error) = self
            .deps
            .message_cache
            .cache_and_add_message(&handoff.chat_id, &message)
            .await
        {
            tracing::warn!(chat_id = %handoff.chat_id, %error, "failed to cache sent message");
        }
        self.clear_stored_drafts(&handoff.chat_id, handoff.created_conversation)
            .await;
        if had_prior_messages {
            if let Err(error) = self.deps.toucher.touch(&handoff.chat_id).await {
                tracing::warn!(chat_id = %handoff.chat_id, %error, "failed to touch conversation");
            }
        }

        tracing::debug!(
            chat_id = %handoff.chat_id,
            message_id = %flight.temp_id,
            phase = SubmissionPhase::Settled.as_str(),
            "submission settled"
        );
        SubmitOutcome::Sent {
            chat_id: handoff.chat_id,
            message_id: flight.temp_id,
        }
    }

    /// Sends a suggested prompt without files, using the default system prompt.
    pub async fn handle_suggestion(&self, text: &str, context: &SubmissionContext) -> SubmitOutcome {
        if text.trim().is_empty() {
            return SubmitOutcome::NothingToSend;
        }
        let Some(user) = context.user.as_ref() else {
            self.deps.notifier.notify(Notice::error(SIGN_IN_NOTICE));
            return SubmitOutcome::SignInRequired;
        };

        let epoch = self.composer.epoch();
        let active_chat = self.composer.chat_id();
        let agent = context.agent.as_ref().map(AgentProfile::agent_ref);
        let optimistic = ChatMessage::optimistic_user(text, Vec::new(), agent);
        let mut flight = InFlight::new(&optimistic, epoch);
        self.messages.push(optimistic);

        let (chat_id, created_conversation) = match self
            .run_suggestion(context, user, text, active_chat.as_ref(), &mut flight)
            .await
        {
            Ok(ensured) => ensured,
            Err(error) => return self.roll_back(flight, error, SUGGESTION_FAILED_NOTICE),
        };

        self.release(&flight);
        let message = ChatMessage {
            id: flight.temp_id,
            created_at_unix_millis: flight.created_at_unix_millis,
            ..ChatMessage::user(text, Vec::new())
        };
        if let Err(error) = self
            .deps
            .message_cache
            .cache_and_add_message(&chat_id, &message)
            .await
        {
            tracing::warn!(%chat_id, %error, "failed to cache suggested message");
        }
        self.clear_stored_drafts(&chat_id, created_conversation).await;
        tracing::debug!(%chat_id, phase = SubmissionPhase::Settled.as_str(), "suggestion settled");
        SubmitOutcome::Sent {
            chat_id,
            message_id: flight.temp_id,
        }
    }

    /// Regenerates the last assistant reply. Returns false when nothing was re-issued.
    pub async fn handle_reload(&self, context: &SubmissionContext) -> bool {
        let (Some(user), Some(chat_id)) = (context.user.as_ref(), self.composer.chat_id()) else {
            return false;
        };

        let body = self.request_body(context, user, &chat_id, self.system_prompt(context));
        match self.deps.transport.reload(ReloadRequest { body }).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%chat_id, %error, "reload failed");
                self.deps.notifier.notify(Notice::error(RELOAD_FAILED_NOTICE));
                false
            }
        }
    }

    pub fn stop(&self) {
        self.deps.transport.stop();
    }

    async fn run_submit(
        &self,
        context: &SubmissionContext,
        user: &UserIdentity,
        input: &str,
        files: &[PendingFile],
        active_chat: Option<&ChatId>,
        flight: &mut InFlight,
    ) -> Result<Handoff, SubmitError> {
        self.check_quota(user, flight).await?;
        let (chat_id, created_conversation) = self
            .ensure_conversation(user, input, &context.model_id, active_chat, flight)
            .await?;

        let length = input.chars().count();
        ensure!(
            length <= self.max_message_length,
            MessageTooLongSnafu {
                stage: "revalidate-length",
                length,
                max: self.max_message_length,
            }
        );
        flight.phase = SubmissionPhase::LengthRevalidated;

        let mut attachments = Vec::new();
        if !files.is_empty() {
            let uploaded = self
                .deps
                .uploader
                .handle_file_uploads(user, &chat_id, files)
                .await;
            self.ensure_current(flight, "upload-files")?;
            attachments = uploaded
                .context(CollaboratorSnafu {
                    stage: "upload-files",
                })?
                .context(UploadFailedSnafu {
                    stage: "upload-files",
                })?;
            flight.phase = SubmissionPhase::FilesUploaded;
        }

        self.ensure_current(flight, "handoff")?;
        let body = self.request_body(context, user, &chat_id, self.system_prompt(context));
        self.deps
            .transport
            .submit(SubmitRequest {
                input: input.to_string(),
                attachments: attachments.clone(),
                body,
            })
            .await
            .context(CollaboratorSnafu {
                stage: "transport-submit",
            })?;
        flight.phase = SubmissionPhase::HandedOffToTransport;

        Ok(Handoff {
            chat_id,
            attachments,
            created_conversation,
        })
    }

    async fn run_suggestion(
        &self,
        context: &SubmissionContext,
        user: &UserIdentity,
        text: &str,
        active_chat: Option<&ChatId>,
        flight: &mut InFlight,
    ) -> Result<(ChatId, bool), SubmitError> {
        self.check_quota(user, flight).await?;
        let (chat_id, created_conversation) = self
            .ensure_conversation(user, text, &context.model_id, active_chat, flight)
            .await?;

        self.ensure_current(flight, "handoff")?;
        let mut body =
            self.request_body(context, user, &chat_id, DEFAULT_SYSTEM_PROMPT.to_string());
        body.agent_id = None;
        self.deps
            .transport
            .append(AppendRequest {
                message: text.to_string(),
                body,
            })
            .await
            .context(CollaboratorSnafu {
                stage: "transport-append",
            })?;
        flight.phase = SubmissionPhase::HandedOffToTransport;
        Ok((chat_id, created_conversation))
    }

    async fn check_quota(
        &self,
        user: &UserIdentity,
        flight: &mut InFlight,
    ) -> Result<(), SubmitError> {
        let allowed = self.deps.quota.check_limits_and_notify(user).await;
        self.ensure_current(flight, "check-quota")?;
        let allowed = allowed.context(CollaboratorSnafu {
            stage: "check-quota",
        })?;
        ensure!(
            allowed,
            QuotaDeniedSnafu {
                stage: "check-quota"
            }
        );
        flight.phase = SubmissionPhase::QuotaChecked;
        Ok(())
    }

    /// Returns the conversation id and whether it was created for this message.
    async fn ensure_conversation(
        &self,
        user: &UserIdentity,
        seed_text: &str,
        model_id: &str,
        active_chat: Option<&ChatId>,
        flight: &mut InFlight,
    ) -> Result<(ChatId, bool), SubmitError> {
        const STAGE: &str = "ensure-conversation";

        let ensured = match active_chat {
            Some(chat_id) => (chat_id.clone(), false),
            None => {
                let created = self
                    .deps
                    .conversations
                    .ensure_chat_exists(user, seed_text, model_id)
                    .await;
                if let Ok(Some(chat_id)) = &created
                    && !self.composer.adopt_conversation(flight.epoch, chat_id.clone())
                {
                    self.discard_conversation(chat_id).await;
                }
                self.ensure_current(flight, STAGE)?;
                let chat_id = created
                    .context(CollaboratorSnafu { stage: STAGE })?
                    .context(ConversationUnavailableSnafu { stage: STAGE })?;
                (chat_id, true)
            }
        };
        flight.phase = SubmissionPhase::ConversationEnsured;
        Ok(ensured)
    }

    /// Deletes a conversation created for a submission the user switched away from.
    async fn discard_conversation(&self, chat_id: &ChatId) {
        match self.deps.conversations.discard_chat(chat_id).await {
            Ok(()) => tracing::debug!(%chat_id, "discarded unused conversation"),
            Err(error) => {
                tracing::warn!(%chat_id, %error, "failed to discard unused conversation");
            }
        }
    }

    fn ensure_current(&self, flight: &InFlight, stage: &'static str) -> Result<(), SubmitError> {
        ensure!(
            self.composer.epoch() == flight.epoch,
            SupersededSnafu { stage }
        );
        Ok(())
    }

    fn system_prompt(&self, context: &SubmissionContext) -> String {
        resolve_system_prompt(
            context
                .agent
                .as_ref()
                .and_then(|agent| agent.system_prompt.as_deref()),
            context.custom_system_prompt.as_deref(),
        )
    }

    fn request_body(
        &self,
        context: &SubmissionContext,
        user: &UserIdentity,
        chat_id: &ChatId,
        system_prompt: String,
    ) -> ChatRequestBody {
        ChatRequestBody {
            chat_id: chat_id.clone(),
            user_id: user.id.clone(),
            model: context.model_id.clone(),
            is_authenticated: user.is_authenticated,
            system_prompt,
            enable_search: context.enable_search,
            agent_id: context.agent.as_ref().map(|agent| agent.id.clone()),
        }
    }

    fn release(&self, flight: &InFlight) {
        self.messages.remove(flight.temp_id);
        for url in &flight.placeholder_urls {
            self.deps.placeholders.revoke(url);
        }
    }

    fn roll_back(&self, flight: InFlight, error: SubmitError, generic_title: &str) -> SubmitOutcome {
        self.release(&flight);
        let reached = flight.phase;
        match &error {
            SubmitError::Collaborator { .. } => {
                tracing::warn!(phase = reached.as_str(), %error, "submission rolled back");
            }
            _ => tracing::debug!(phase = reached.as_str(), %error, "submission rolled back"),
        }
        if let Some(notice) = error.notice(generic_title) {
            self.deps.notifier.notify(notice);
        }
        SubmitOutcome::RolledBack { reached, error }
    }

    /// Clears the conversation's stored draft, and the new-conversation slot the text was typed in.
    async fn clear_stored_drafts(&self, chat_id: &ChatId, created_conversation: bool) {
        let mut keys = vec![DraftKey::Conversation(chat_id.clone())];
        if created_conversation {
            keys.push(DraftKey::NewConversation);
        }

        let drafts = self.deps.drafts.clone();
        let cleared = run_blocking("clear-draft", move || {
            keys.iter().try_for_each(|key| drafts.clear_draft(key))
        })
        .await;
        if let Err(error) = cleared {
            tracing::warn!(%chat_id, %error, "failed to clear stored draft");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use deeplist_storage::{AgentId, DraftStore};
    use tokio::time::timeout;

    use super::*;
    use crate::conversations::LocalMessageCache;
    use crate::message::{MessageStatus, Role};
    use crate::request::TransportRequest;
    use crate::testing::{
        GuarantorReply, Harness, MemoryMessageCache, ScriptedProvider, UploadReply,
    };
    use crate::transport::ProviderTransport;

    const MAX: usize = 20;

    fn context() -> SubmissionContext {
        SubmissionContext::new("m1").with_user(UserIdentity::authenticated("u1"))
    }

    fn open_existing_conversation(harness: &Harness) -> Vec<ChatMessage> {
        harness
            .composer
            .switch_conversation(Some(ChatId::new("c9")))
            .unwrap();
        let history = vec![
            ChatMessage::user("earlier", Vec::new()),
            ChatMessage::new(Role::Assistant, "reply", MessageStatus::Done),
        ];
        harness.messages.replace(history.clone());
        history
    }

    fn attach_files(harness: &Harness, count: usize) {
        for index in 0..count {
            harness.composer.attach(PendingFile::new(
                format!("photo-{index}.png"),
                "image/png",
                vec![1_u8, 2, 3],
            ));
        }
    }

    fn submitted(harness: &Harness) -> SubmitRequest {
        let requests = harness.transport.requests();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            TransportRequest::Submit(request) => request.clone(),
            other => panic!("expected a submit request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_message_creates_the_conversation_and_hands_off() {
        let harness = Harness::new();
        harness.composer.set_input("Hello").unwrap();

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(
            matches!(&outcome, SubmitOutcome::Sent { chat_id, .. } if *chat_id == ChatId::new("c1"))
        );
        let request = submitted(&harness);
        assert_eq!(request.input, "Hello");
        assert!(request.attachments.is_empty());
        assert_eq!(
            serde_json::to_value(&request.body).unwrap(),
            serde_json::json!({
                "chatId": "c1",
                "userId": "u1",
                "model": "m1",
                "isAuthenticated": true,
                "systemPrompt": DEFAULT_SYSTEM_PROMPT,
                "enableSearch": false,
                "agentId": null,
            })
        );

        let visible = harness.transport.visible_at_dispatch();
        assert_eq!(visible[0].len(), 1);
        assert!(visible[0][0].is_optimistic());
        assert_eq!(visible[0][0].content, "Hello");
        assert!(harness.messages.is_empty());

        assert_eq!(harness.conversations.seeds(), vec!["Hello".to_string()]);
        assert_eq!(harness.composer.chat_id(), Some(ChatId::new("c1")));
        assert_eq!(
            harness.drafts.get(&DraftKey::Conversation(ChatId::new("c1"))),
            None
        );
        assert_eq!(harness.drafts.get(&DraftKey::NewConversation), None);

        let cached = harness.cache.messages();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].0, ChatId::new("c1"));
        assert_eq!(cached[0].1.content, "Hello");
        assert!(harness.toucher.touched().is_empty());
        assert!(harness.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn signed_out_users_get_a_notice_and_nothing_else() {
        let harness = Harness::new();
        harness.composer.set_input("Hello").unwrap();

        let outcome = harness
            .coordinator(MAX)
            .submit(&SubmissionContext::new("m1"))
            .await;

        assert!(matches!(outcome, SubmitOutcome::SignInRequired));
        assert_eq!(harness.notifier.titles(), vec![SIGN_IN_NOTICE.to_string()]);
        assert!(harness.messages.is_empty());
        assert_eq!(harness.composer.input(), "Hello");
        assert_eq!(harness.quota.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_input_without_files_is_ignored() {
        let harness = Harness::new();
        harness.composer.set_input("   ").unwrap();

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(matches!(outcome, SubmitOutcome::NothingToSend));
        assert_eq!(harness.quota.calls.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Failure {
        QuotaDenied,
        QuotaError,
        ConversationRefused,
        ConversationError,
        TooLong,
        UploadRefused,
        UploadError,
        TransportError,
    }

    #[tokio::test]
    async fn every_failure_restores_the_visible_list_and_keeps_the_draft() {
        let generic = Some(SEND_FAILED_NOTICE.to_string());
        let cases = [
            (Failure::QuotaDenied, None),
            (Failure::QuotaError, generic.clone()),
            (Failure::ConversationRefused, None),
            (Failure::ConversationError, generic.clone()),
            (
                Failure::TooLong,
                Some(format!("Message is too long. The maximum is {MAX} characters.")),
            ),
            (Failure::UploadRefused, None),
            (Failure::UploadError, generic.clone()),
            (Failure::TransportError, generic),
        ];

        for (failure, expected_notice) in cases {
            let harness = Harness::new();
            let before = match failure {
                Failure::ConversationRefused | Failure::ConversationError => {
                    let history = vec![ChatMessage::user("shown elsewhere", Vec::new())];
                    harness.messages.replace(history.clone());
                    history
                }
                _ => open_existing_conversation(&harness),
            };
            let input = match failure {
                Failure::TooLong => "x".repeat(MAX + 1),
                _ => "Hello".to_string(),
            };
            harness.composer.set_input(input.clone()).unwrap();
            let draft_key = harness.composer.draft_key();

            match failure {
                Failure::QuotaDenied => harness.quota.deny(),
                Failure::QuotaError => harness.quota.fail.store(true, Ordering::SeqCst),
                Failure::ConversationRefused => {
                    harness.conversations.reply_with(GuarantorReply::Refuse)
                }
                Failure::ConversationError => harness.conversations.reply_with(GuarantorReply::Fail),
                Failure::TooLong => {}
                Failure::UploadRefused => {
                    attach_files(&harness, 1);
                    harness.uploader.reply_with(UploadReply::Refuse);
                }
                Failure::UploadError => {
                    attach_files(&harness, 1);
                    harness.uploader.reply_with(UploadReply::Fail);
                }
                Failure::TransportError => harness.transport.fail.store(true, Ordering::SeqCst),
            }

            let outcome = harness.coordinator(MAX).submit(&context()).await;

            assert!(
                matches!(outcome, SubmitOutcome::RolledBack { .. }),
                "{failure:?}: {outcome:?}"
            );
            assert_eq!(harness.messages.snapshot(), before, "{failure:?}");
            assert_eq!(harness.placeholders.live_count(), 0, "{failure:?}");
            assert_eq!(harness.composer.input(), "", "{failure:?}");
            assert!(!harness.composer.has_pending_files(), "{failure:?}");
            assert_eq!(harness.drafts.get(&draft_key), Some(input), "{failure:?}");
            assert!(harness.cache.messages().is_empty(), "{failure:?}");
            assert_eq!(
                harness.notifier.titles(),
                expected_notice.into_iter().collect::<Vec<_>>(),
                "{failure:?}"
            );
        }
    }

    #[tokio::test]
    async fn exactly_the_maximum_length_is_accepted() {
        let harness = Harness::new();
        harness.composer.set_input("é".repeat(MAX)).unwrap();

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(outcome.is_sent());
        assert_eq!(submitted(&harness).input.chars().count(), MAX);
    }

    #[tokio::test]
    async fn one_over_the_maximum_rolls_back_after_the_conversation_exists() {
        let harness = Harness::new();
        harness.composer.set_input("x".repeat(MAX + 1)).unwrap();

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        match outcome {
            SubmitOutcome::RolledBack {
                reached,
                error: SubmitError::MessageTooLong { length, max, .. },
            } => {
                assert_eq!(reached, SubmissionPhase::ConversationEnsured);
                assert_eq!(length, MAX + 1);
                assert_eq!(max, MAX);
            }
            other => panic!("expected a length rollback, got {other:?}"),
        }
        assert_eq!(harness.conversations.seeds().len(), 1);
        assert!(harness.transport.requests().is_empty());
        assert!(harness.messages.is_empty());
    }

    #[tokio::test]
    async fn failed_upload_releases_every_placeholder() {
        let harness = Harness::new();
        let before = open_existing_conversation(&harness);
        harness.composer.set_input("three photos").unwrap();
        attach_files(&harness, 3);
        harness.uploader.reply_with(UploadReply::Refuse);

        let in_flight = Arc::new(Mutex::new(Vec::new()));
        let seen = in_flight.clone();
        let messages = harness.messages.clone();
        harness
            .quota
            .on_check(move || *seen.lock().unwrap() = messages.snapshot());

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(matches!(
            outcome,
            SubmitOutcome::RolledBack {
                reached: SubmissionPhase::LengthRevalidated,
                error: SubmitError::UploadFailed { .. },
            }
        ));
        let in_flight = in_flight.lock().unwrap().clone();
        let optimistic = in_flight.last().unwrap();
        assert!(optimistic.is_optimistic());
        assert_eq!(optimistic.attachments.len(), 3);
        assert!(optimistic.attachments.iter().all(Attachment::is_placeholder));

        assert_eq!(harness.placeholders.live_count(), 0);
        assert_eq!(harness.messages.snapshot(), before);
        assert!(
            harness
                .messages
                .snapshot()
                .iter()
                .all(|message| message.attachments.is_empty())
        );
        assert_eq!(harness.uploader.batches(), vec![(ChatId::new("c9"), 3)]);
    }

    #[tokio::test]
    async fn uploaded_attachments_reach_the_transport_and_the_cache() {
        let harness = Harness::new();
        open_existing_conversation(&harness);
        harness.composer.set_input("two photos").unwrap();
        attach_files(&harness, 2);

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(outcome.is_sent());
        let request = submitted(&harness);
        assert_eq!(request.attachments.len(), 2);
        assert!(
            request
                .attachments
                .iter()
                .all(|attachment| attachment.url.starts_with("https://files.example/c9/"))
        );
        let cached = harness.cache.messages();
        assert_eq!(cached[0].1.attachments, request.attachments);
        assert_eq!(harness.placeholders.live_count(), 0);
    }

    #[tokio::test]
    async fn suggestion_with_quota_denied_matches_submit() {
        let via_submit = Harness::new();
        let via_suggestion = Harness::new();
        for harness in [&via_submit, &via_suggestion] {
            open_existing_conversation(harness);
            harness.quota.deny();
        }
        via_submit.composer.set_input("Tell me more").unwrap();

        let submitted = via_submit.coordinator(MAX).submit(&context()).await;
        let suggested = via_suggestion
            .coordinator(MAX)
            .handle_suggestion("Tell me more", &context())
            .await;

        assert!(matches!(
            submitted,
            SubmitOutcome::RolledBack {
                error: SubmitError::QuotaDenied { .. },
                ..
            }
        ));
        assert!(matches!(
            suggested,
            SubmitOutcome::RolledBack {
                error: SubmitError::QuotaDenied { .. },
                ..
            }
        ));
        assert_eq!(
            via_submit.messages.snapshot(),
            via_suggestion.messages.snapshot()
        );
        assert_eq!(via_submit.notifier.titles(), via_suggestion.notifier.titles());
        assert!(via_suggestion.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn suggestion_appends_with_the_default_prompt() {
        let harness = Harness::new();
        let agent = AgentProfile::new("a1", "Researcher").with_system_prompt("Cite sources.");

        let outcome = harness
            .coordinator(MAX)
            .handle_suggestion("What is Rust?", &context().with_agent(agent))
            .await;

        assert!(outcome.is_sent());
        let requests = harness.transport.requests();
        let TransportRequest::Append(request) = &requests[0] else {
            panic!("expected an append request, got {:?}", requests[0]);
        };
        assert_eq!(request.message, "What is Rust?");
        assert_eq!(request.body.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(request.body.agent_id, None);
        assert!(harness.messages.is_empty());
    }

    #[tokio::test]
    async fn suggested_conversation_reopens_with_both_turns() {
        let harness = Harness::new();
        harness
            .drafts
            .set_draft(&DraftKey::NewConversation, "half typed")
            .unwrap();
        let cache = Arc::new(LocalMessageCache::new(Arc::new(MemoryMessageCache::default())));
        let provider = Arc::new(ScriptedProvider::replying(&["A systems language."]));
        let transport = Arc::new(
            ProviderTransport::new(provider, harness.messages.clone()).with_cache(cache.clone()),
        );
        let coordinator = harness.coordinator_with(MAX, transport, cache.clone());

        let outcome = coordinator
            .handle_suggestion("What is Rust?", &context())
            .await;
        assert!(outcome.is_sent());

        let chat_id = ChatId::new("c1");
        let reopened = timeout(Duration::from_secs(2), async {
            loop {
                let loaded = cache.load(&chat_id).await.unwrap();
                if loaded.len() == 2 {
                    return loaded;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            reopened
                .iter()
                .map(|message| (message.role, message.content.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (Role::User, "What is Rust?"),
                (Role::Assistant, "A systems language."),
            ]
        );
        assert_eq!(harness.drafts.get(&DraftKey::NewConversation), None);
    }

    #[tokio::test]
    async fn failed_suggestion_uses_its_own_notice() {
        let harness = Harness::new();
        harness.transport.fail.store(true, Ordering::SeqCst);

        harness
            .coordinator(MAX)
            .handle_suggestion("What is Rust?", &context())
            .await;

        assert_eq!(
            harness.notifier.titles(),
            vec![SUGGESTION_FAILED_NOTICE.to_string()]
        );
        assert!(harness.messages.is_empty());
    }

    #[tokio::test]
    async fn only_conversations_with_history_are_touched() {
        let harness = Harness::new();
        open_existing_conversation(&harness);
        harness.composer.set_input("second message").unwrap();

        harness.coordinator(MAX).submit(&context()).await;

        assert_eq!(harness.toucher.touched(), vec![ChatId::new("c9")]);
        assert_eq!(
            harness.drafts.get(&DraftKey::Conversation(ChatId::new("c9"))),
            None
        );
    }

    #[tokio::test]
    async fn switching_conversations_mid_flight_rolls_back_silently() {
        let harness = Harness::new();
        let before = open_existing_conversation(&harness);
        harness.composer.set_input("Hello").unwrap();
        let composer = harness.composer.clone();
        harness.quota.on_check(move || {
            composer
                .switch_conversation(Some(ChatId::new("c2")))
                .unwrap();
        });

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(matches!(
            outcome,
            SubmitOutcome::RolledBack {
                reached: SubmissionPhase::OptimisticallyInserted,
                error: SubmitError::Superseded { .. },
            }
        ));
        assert_eq!(harness.messages.snapshot(), before);
        assert!(harness.notifier.notices().is_empty());
        assert!(harness.transport.requests().is_empty());
        assert_eq!(
            harness.drafts.get(&DraftKey::Conversation(ChatId::new("c9"))),
            Some("Hello".to_string())
        );
    }

    #[tokio::test]
    async fn conversation_created_after_a_switch_is_discarded() {
        let harness = Harness::new();
        harness.composer.set_input("Hello").unwrap();
        let composer = harness.composer.clone();
        harness.conversations.on_create(move || {
            composer
                .switch_conversation(Some(ChatId::new("c2")))
                .unwrap();
        });

        let outcome = harness.coordinator(MAX).submit(&context()).await;

        assert!(matches!(
            outcome,
            SubmitOutcome::RolledBack {
                reached: SubmissionPhase::QuotaChecked,
                error: SubmitError::Superseded { .. },
            }
        ));
        assert_eq!(harness.conversations.discarded(), vec![ChatId::new("c1")]);
        assert_eq!(harness.composer.chat_id(), Some(ChatId::new("c2")));
        assert!(harness.transport.requests().is_empty());
        assert!(harness.notifier.notices().is_empty());
        assert_eq!(
            harness.drafts.get(&DraftKey::NewConversation),
            Some("Hello".to_string())
        );
    }

    #[tokio::test]
    async fn agent_prompt_takes_precedence_over_the_custom_prompt() {
        let harness = Harness::new();
        harness.composer.set_input("Hello").unwrap();
        let agent = AgentProfile::new("a1", "Researcher").with_system_prompt("Cite sources.");
        let context = context()
            .with_agent(agent)
            .with_custom_system_prompt("Be terse.")
            .with_search(true);

        harness.coordinator(MAX).submit(&context).await;

        let body = submitted(&harness).body;
        assert_eq!(body.system_prompt, "Cite sources.");
        assert_eq!(body.agent_id, Some(AgentId::new("a1")));
        assert!(body.enable_search);
    }

    #[tokio::test]
    async fn custom_prompt_applies_without_an_agent_prompt() {
        let harness = Harness::new();
        harness.composer.set_input("Hello").unwrap();

        harness
            .coordinator(MAX)
            .submit(&context().with_custom_system_prompt("Be terse."))
            .await;

        assert_eq!(submitted(&harness).body.system_prompt, "Be terse.");
    }

    #[tokio::test]
    async fn reload_needs_a_user_and_a_conversation() {
        let harness = Harness::new();
        let coordinator = harness.coordinator(MAX);

        assert!(!coordinator.handle_reload(&context()).await);
        open_existing_conversation(&harness);
        assert!(!coordinator.handle_reload(&SubmissionContext::new("m1")).await);
        assert!(harness.transport.requests().is_empty());

        let before = harness.messages.snapshot();
        assert!(coordinator.handle_reload(&context()).await);
        let requests = harness.transport.requests();
        let TransportRequest::Reload(request) = &requests[0] else {
            panic!("expected a reload request, got {:?}", requests[0]);
        };
        assert_eq!(request.body.chat_id, ChatId::new("c9"));
        assert_eq!(request.body.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(harness.messages.snapshot(), before);
    }

    #[tokio::test]
    async fn failed_reload_notifies() {
        let harness = Harness::new();
        open_existing_conversation(&harness);
        harness.transport.fail.store(true, Ordering::SeqCst);

        assert!(!harness.coordinator(MAX).handle_reload(&context()).await);
        assert_eq!(
            harness.notifier.titles(),
            vec![RELOAD_FAILED_NOTICE.to_string()]
        );
    }

    #[tokio::test]
    async fn stop_is_forwarded_to_the_transport() {
        let harness = Harness::new();
        harness.coordinator(MAX).stop();
        assert_eq!(harness.transport.stops.load(Ordering::SeqCst), 1);
    }
}
