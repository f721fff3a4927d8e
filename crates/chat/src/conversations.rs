use std::sync::Arc;

use deeplist_llm::BoxFuture;
use deeplist_storage::{
    ChatId, ConversationRecord, ConversationStore, MessageCacheStore, MessageId, NewConversation,
    UserId,
};

use super::collaborators::{ConversationGuarantor, ConversationToucher, MessageCache, run_blocking};
use super::context::UserIdentity;
use super::error::CollaboratorResult;
use super::message::ChatMessage;

/// Conversation registry backed by local storage.
#[derive(Clone)]
pub struct LocalConversations {
    store: Arc<dyn ConversationStore>,
}

impl LocalConversations {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, user_id: &UserId) -> CollaboratorResult<Vec<ConversationRecord>> {
        let store = self.store.clone();
        let user_id = user_id.clone();
        run_blocking("list-conversations", move || store.list_conversations(&user_id)).await
    }

    pub async fn get(&self, chat_id: &ChatId) -> CollaboratorResult<Option<ConversationRecord>> {
        let store = self.store.clone();
        let chat_id = chat_id.clone();
        run_blocking("get-conversation", move || store.get_conversation(&chat_id)).await
    }

    async fn create(
        &self,
        user: &UserIdentity,
        seed_text: &str,
        model_id: &str,
    ) -> CollaboratorResult<Option<ChatId>> {
        let store = self.store.clone();
        let model_id = Some(model_id.trim().to_string()).filter(|model| !model.is_empty());
        let input = NewConversation::seeded(user.id.clone(), seed_text, model_id);

        let record = run_blocking("create-conversation", move || {
            store.create_conversation(input)
        })
        .await?;
        tracing::info!(chat_id = %record.id, title = %record.title, "created conversation");
        Ok(Some(record.id))
    }

    async fn touch_existing(&self, chat_id: &ChatId) -> CollaboratorResult<()> {
        let store = self.store.clone();
        let chat_id = chat_id.clone();
        let record = run_blocking("touch-conversation", move || {
            store.touch_conversation(&chat_id)
        })
        .await?;
        tracing::debug!(chat_id = %record.id, updated_at = record.updated_at_unix_millis, "touched conversation");
        Ok(())
    }

    async fn delete(&self, chat_id: &ChatId) -> CollaboratorResult<()> {
        let store = self.store.clone();
        let target = chat_id.clone();
        let deleted = run_blocking("delete-conversation", move || {
            store.delete_conversation(&target)
        })
        .await?;
        tracing::info!(%chat_id, deleted, "discarded conversation");
        Ok(())
    }
}

impl ConversationGuarantor for LocalConversations {
    fn ensure_chat_exists<'a>(
        &'a self,
        user: &'a UserIdentity,
        seed_text: &'a str,
        model_id: &'a str,
    ) -> BoxFuture<'a, CollaboratorResult<Option<ChatId>>> {
        Box::pin(self.create(user, seed_text, model_id))
    }

    fn discard_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(self.delete(chat_id))
    }
}

impl ConversationToucher for LocalConversations {
    fn touch<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, CollaboratorResult<()>> {
        Box::pin(self.touch_existing(chat_id))
    }
}

/// Local history of sent and completed messages.
#[derive(Clone)]
pub struct LocalMessageCache {
    store: Arc<dyn MessageCacheStore>,
}

impl LocalMessageCache {
    pub fn new(store: Arc<dyn MessageCacheStore>) -> Self {
        Self { store }
    }

    /// Cached messages of `chat_id` in the order they were sent.
    pub async fn load(&self, chat_id: &ChatId) -> CollaboratorResult<Vec<ChatMessage>> {
        let store = self.store.clone();
        let chat_id = chat_id.clone();
        let cached = run_blocking("load-cached-messages", move || {
            store.cached_messages(&chat_id)
        })
        .await?;
        Ok(cached.into_iter().map(ChatMessage::from_cached).collect())
    }
}

impl MessageCache for LocalMessageCache {
    fn cache_and_add_message<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message: &'a ChatMessage,
    ) -> BoxFuture<'a, CollaboratorResult<()>> {
        let store = self.store.clone();
        let cached = message.to_cached(chat_id);
        Box::pin(run_blocking("cache-message", move || {
            store.cache_message(cached)
        }))
    }

    fn forget_messages<'a>(
        &'a self,
        chat_id: &'a ChatId,
        message_ids: &'a [MessageId],
    ) -> BoxFuture<'a, CollaboratorResult<()>> {
        let store = self.store.clone();
        let target = chat_id.clone();
        let message_ids = message_ids.to_vec();
        Box::pin(async move {
            let removed = run_blocking("forget-cached-messages", move || {
                store.remove_cached_messages(&target, &message_ids)
            })
            .await?;
            tracing::debug!(%chat_id, removed, "forgot cached messages");
            Ok(())
        })
    }
}
