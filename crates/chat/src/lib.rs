pub mod blob;
pub mod collaborators;
pub mod composer;
pub mod context;
pub mod conversations;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod message_list;
pub mod notice;
pub mod prompt;
pub mod quota;
pub mod request;
pub mod settings;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use blob::BlobRegistry;
pub use collaborators::{
    ChatTransport, Collaborators, ConversationGuarantor, ConversationToucher, FileUploader,
    MessageCache, PlaceholderUrls, QuotaChecker,
};
pub use composer::{Composer, ComposerState};
pub use context::{AgentProfile, SubmissionContext, UserIdentity};
pub use conversations::{LocalConversations, LocalMessageCache};
pub use coordinator::{ChatSubmissionCoordinator, SubmissionPhase, SubmitOutcome};
pub use error::{CollaboratorError, CollaboratorResult, SubmitError};
pub use message::{
    AgentRef, Attachment, AttachmentSource, ChatMessage, MessageStatus, PendingFile, Role,
};
pub use message_list::MessageList;
pub use notice::{LogNotifier, Notice, NoticeStatus, Notifier};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, resolve_system_prompt};
pub use quota::{DailyUsageLimiter, QuotaSettings};
pub use request::{AppendRequest, ChatRequestBody, ReloadRequest, SubmitRequest, TransportRequest};
pub use settings::{
    AppSettings, ChatSettings, ProviderSettings, SettingsError, SettingsStore, UserSettings,
};
pub use transport::ProviderTransport;
pub use upload::{DirectoryUploader, UploadError, UploadSettings, validate_file};
