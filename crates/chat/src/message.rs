use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use deeplist_storage::{AgentId, CachedAttachment, CachedMessage, ChatId, MessageId, MessageRole};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub(crate) fn to_storage(self) -> MessageRole {
        match self {
            Self::System => MessageRole::System,
            Self::User => MessageRole::User,
            Self::Assistant => MessageRole::Assistant,
        }
    }

    pub(crate) fn to_provider(self) -> deeplist_llm::Role {
        match self {
            Self::System => deeplist_llm::Role::System,
            Self::User => deeplist_llm::Role::User,
            Self::Assistant => deeplist_llm::Role::Assistant,
        }
    }
}

/// Lifecycle status for one visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Shown before the submission is accepted; never sent as history.
    Optimistic,
    Pending,
    Streaming,
    Done,
    Error(String),
    Cancelled,
}

/// Where an attachment's URL points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentSource {
    /// Process-local `blob:` URL, valid until revoked.
    Placeholder,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
    pub source: AttachmentSource,
}

impl Attachment {
    pub fn placeholder(file: &PendingFile, url: impl Into<String>) -> Self {
        Self {
            name: file.name.clone(),
            content_type: file.content_type.clone(),
            url: url.into(),
            source: AttachmentSource::Placeholder,
        }
    }

    pub fn persisted(
        name: impl Into<String>,
        content_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            url: url.into(),
            source: AttachmentSource::Persisted,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.source == AttachmentSource::Placeholder
    }

    fn to_cached(&self) -> CachedAttachment {
        CachedAttachment {
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            url: self.url.clone(),
        }
    }
}

/// A file picked in the composer and not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Arc<[u8]>,
}

impl PendingFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub id: AgentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub reasoning: String,
    pub created_at_unix_millis: u64,
    pub attachments: Vec<Attachment>,
    pub agent: Option<AgentRef>,
    pub status: MessageStatus,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            reasoning: String::new(),
            created_at_unix_millis: unix_timestamp_millis(),
            attachments: Vec::new(),
            agent: None,
            status,
        }
    }

    /// User message shown immediately while a submission is in flight.
    pub fn optimistic_user(
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        agent: Option<AgentRef>,
    ) -> Self {
        Self {
            attachments,
            agent,
            ..Self::new(Role::User, content, MessageStatus::Optimistic)
        }
    }

    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            attachments,
            ..Self::new(Role::User, content, MessageStatus::Done)
        }
    }

    pub fn assistant_streaming() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Streaming)
    }

    pub fn with_agent(mut self, agent: Option<AgentRef>) -> Self {
        self.agent = agent;
        self
    }

    pub fn is_optimistic(&self) -> bool {
        self.status == MessageStatus::Optimistic
    }

    /// True when the message may be replayed to the provider as history.
    pub fn is_history(&self) -> bool {
        match self.status {
            MessageStatus::Done => !self.content.trim().is_empty(),
            MessageStatus::Pending => self.role == Role::User,
            MessageStatus::Optimistic
            | MessageStatus::Streaming
            | MessageStatus::Error(_)
            | MessageStatus::Cancelled => false,
        }
    }

    /// Text sent to the provider; persisted attachments are listed after the body.
    pub fn provider_content(&self) -> String {
        let persisted = self
            .attachments
            .iter()
            .filter(|attachment| !attachment.is_placeholder())
            .collect::<Vec<_>>();
        if persisted.is_empty() {
            return self.content.clone();
        }

        let mut content = self.content.clone();
        for attachment in persisted {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!(
                "[attachment: {} ({}) {}]",
                attachment.name, attachment.content_type, attachment.url
            ));
        }
        content
    }

    /// Local-history record; placeholder attachments never reach storage.
    pub fn to_cached(&self, chat_id: &ChatId) -> CachedMessage {
        CachedMessage {
            id: self.id,
            chat_id: chat_id.clone(),
            role: self.role.to_storage(),
            content: self.content.clone(),
            attachments: self
                .attachments
                .iter()
                .filter(|attachment| !attachment.is_placeholder())
                .map(Attachment::to_cached)
                .collect(),
            agent_id: self.agent.as_ref().map(|agent| agent.id.clone()),
            created_at_unix_millis: self.created_at_unix_millis,
        }
    }

    pub fn from_cached(message: CachedMessage) -> Self {
        let role = match message.role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        };
        Self {
            id: message.id,
            role,
            content: message.content,
            reasoning: String::new(),
            created_at_unix_millis: message.created_at_unix_millis,
            attachments: message
                .attachments
                .into_iter()
                .map(|attachment| {
                    Attachment::persisted(attachment.name, attachment.content_type, attachment.url)
                })
                .collect(),
            agent: None,
            status: MessageStatus::Done,
        }
    }
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}
