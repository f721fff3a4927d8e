use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ChatId, MessageId, UserId};

/// Title used when the seed text of a new conversation is blank.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

/// Upper bound for titles derived from the first message of a conversation.
pub const MAX_CONVERSATION_TITLE_CHARS: usize = 100;

const NEW_CONVERSATION_DRAFT_KEY: &str = "draft:new";

/// Message role as stored; the chat layer maps its own role onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Slot a draft is stored under.
///
/// Text typed before any conversation exists lives in the `NewConversation` slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DraftKey {
    NewConversation,
    Conversation(ChatId),
}

impl DraftKey {
    pub fn for_chat(chat_id: Option<&ChatId>) -> Self {
        match chat_id {
            Some(chat_id) => Self::Conversation(chat_id.clone()),
            None => Self::NewConversation,
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            Self::NewConversation => NEW_CONVERSATION_DRAFT_KEY.to_string(),
            Self::Conversation(chat_id) => format!("draft:chat:{chat_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ChatId,
    pub user_id: UserId,
    pub title: String,
    pub model_id: Option<String>,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub user_id: UserId,
    pub title: String,
    pub model_id: Option<String>,
}

impl NewConversation {
    /// Builds a conversation whose title is derived from the first message.
    pub fn seeded(user_id: UserId, seed_text: &str, model_id: Option<String>) -> Self {
        Self {
            user_id,
            title: title_from_seed(seed_text),
            model_id,
        }
    }
}

/// First non-blank line of the seed, capped at [`MAX_CONVERSATION_TITLE_CHARS`].
pub fn title_from_seed(seed_text: &str) -> String {
    let first_line = seed_text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    if first_line.is_empty() {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }

    first_line
        .chars()
        .take(MAX_CONVERSATION_TITLE_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAttachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: MessageRole,
    pub content: String,
    pub attachments: Vec<CachedAttachment>,
    pub agent_id: Option<AgentId>,
    pub created_at_unix_millis: u64,
}

/// Calendar day in UTC, counted from the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageDay(pub u64);

impl UsageDay {
    pub const fn from_unix_seconds(seconds: u64) -> Self {
        Self(seconds / 86_400)
    }
}
