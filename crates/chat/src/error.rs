use deeplist_llm::ProviderError;
use deeplist_storage::StorageError;
use snafu::Snafu;

use super::notice::Notice;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CollaboratorError {
    #[snafu(display("local storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("provider failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("blocking task failed on `{stage}`: {source}"))]
    BlockingTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("a response is already streaming for chat '{chat_id}'"))]
    StreamBusy {
        stage: &'static str,
        chat_id: String,
    },
    #[snafu(display("no user message to regenerate a reply for on `{stage}`"))]
    NothingToReload { stage: &'static str },
    #[snafu(display("{service} is unavailable on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        service: &'static str,
        details: String,
    },
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Why one submission was rolled back.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubmitError {
    #[snafu(display("message quota denied on `{stage}`"))]
    QuotaDenied { stage: &'static str },
    #[snafu(display("no conversation could be ensured on `{stage}`"))]
    ConversationUnavailable { stage: &'static str },
    #[snafu(display("message of {length} characters exceeds the maximum of {max}"))]
    MessageTooLong {
        stage: &'static str,
        length: usize,
        max: usize,
    },
    #[snafu(display("attachment upload failed on `{stage}`"))]
    UploadFailed { stage: &'static str },
    #[snafu(display("conversation changed while submitting, on `{stage}`"))]
    Superseded { stage: &'static str },
    #[snafu(display("collaborator failed on `{stage}`: {source}"))]
    Collaborator {
        stage: &'static str,
        source: CollaboratorError,
    },
}

impl SubmitError {
    /// Notice owed to the user, if the failing collaborator did not already send one.
    pub fn notice(&self, generic_title: &str) -> Option<Notice> {
        match self {
            Self::MessageTooLong { max, .. } => Some(Notice::error(format!(
                "Message is too long. The maximum is {max} characters."
            ))),
            Self::Collaborator { .. } => Some(Notice::error(generic_title)),
            Self::QuotaDenied { .. }
            | Self::ConversationUnavailable { .. }
            | Self::UploadFailed { .. }
            | Self::Superseded { .. } => None,
        }
    }
}
