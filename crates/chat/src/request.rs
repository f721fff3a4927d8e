use deeplist_storage::{AgentId, ChatId, UserId};
use serde::Serialize;

use super::message::Attachment;

/// JSON body sent with every transport request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub model: String,
    pub is_authenticated: bool,
    pub system_prompt: String,
    pub enable_search: bool,
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub input: String,
    /// Persisted attachments only.
    pub attachments: Vec<Attachment>,
    pub body: ChatRequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub message: String,
    pub body: ChatRequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub body: ChatRequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    Submit(SubmitRequest),
    Append(AppendRequest),
    Reload(ReloadRequest),
}

impl TransportRequest {
    pub fn body(&self) -> &ChatRequestBody {
        match self {
            Self::Submit(request) => &request.body,
            Self::Append(request) => &request.body,
            Self::Reload(request) => &request.body,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submit(_) => "submit",
            Self::Append(_) => "append",
            Self::Reload(_) => "reload",
        }
    }
}
