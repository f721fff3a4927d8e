pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{AgentId, ChatId, MessageId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{
    CachedAttachment, CachedMessage, ConversationRecord, DEFAULT_CONVERSATION_TITLE, DraftKey,
    MAX_CONVERSATION_TITLE_CHARS, MessageRole, NewConversation, UsageDay, title_from_seed,
};

/// Per-conversation unsent input, written on every keystroke.
pub trait DraftStore: Send + Sync {
    /// Stores `text` for `key`; empty text removes the draft.
    fn set_draft(&self, key: &DraftKey, text: &str) -> StorageResult<()>;
    fn draft(&self, key: &DraftKey) -> StorageResult<Option<String>>;
    fn clear_draft(&self, key: &DraftKey) -> StorageResult<()>;
}

pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord>;
    fn get_conversation(&self, chat_id: &ChatId) -> StorageResult<Option<ConversationRecord>>;
    /// Most recently touched first.
    fn list_conversations(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>>;
    fn touch_conversation(&self, chat_id: &ChatId) -> StorageResult<ConversationRecord>;
    /// Removes the conversation with its cached messages and draft. Returns false when unknown.
    fn delete_conversation(&self, chat_id: &ChatId) -> StorageResult<bool>;
}

/// Durable local history kept independently of the transport's own message list.
pub trait MessageCacheStore: Send + Sync {
    /// Inserts or replaces the message with the same id.
    fn cache_message(&self, message: CachedMessage) -> StorageResult<()>;
    fn cached_messages(&self, chat_id: &ChatId) -> StorageResult<Vec<CachedMessage>>;
    /// Returns how many of `ids` were cached for `chat_id`.
    fn remove_cached_messages(&self, chat_id: &ChatId, ids: &[MessageId]) -> StorageResult<usize>;
}

pub trait UsageStore: Send + Sync {
    fn usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64>;
    /// Returns the count after incrementing.
    fn increment_usage(&self, user_id: &UserId, day: UsageDay) -> StorageResult<u64>;
}

pub trait Storage: DraftStore + ConversationStore + MessageCacheStore + UsageStore {}

impl<T> Storage for T where T: DraftStore + ConversationStore + MessageCacheStore + UsageStore {}
