use std::sync::Arc;

use deeplist_storage::MessageId;
use tokio::sync::watch;

use super::message::ChatMessage;

/// Ordered visible messages of the active conversation.
///
/// Cloning yields another handle to the same list; every mutation is published
/// to [`MessageList::subscribe`] receivers.
#[derive(Clone)]
pub struct MessageList {
    state: Arc<watch::Sender<Vec<ChatMessage>>>,
}

impl Default for MessageList {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageList {
    pub fn new() -> Self {
        Self::from_messages(Vec::new())
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let (state, _) = watch::channel(messages);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.state.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.state.borrow().iter().any(|message| message.id == id)
    }

    pub fn get(&self, id: MessageId) -> Option<ChatMessage> {
        self.state
            .borrow()
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    pub fn push(&self, message: ChatMessage) {
        self.state.send_modify(|messages| messages.push(message));
    }

    /// Returns false when no message had `id`.
    pub fn remove(&self, id: MessageId) -> bool {
        self.state.send_if_modified(|messages| {
            let before = messages.len();
            messages.retain(|message| message.id != id);
            messages.len() != before
        })
    }

    pub fn update(&self, id: MessageId, apply: impl FnOnce(&mut ChatMessage)) -> bool {
        self.state.send_if_modified(|messages| {
            match messages.iter_mut().find(|message| message.id == id) {
                Some(message) => {
                    apply(message);
                    true
                }
                None => false,
            }
        })
    }

    /// Drops every message after `id`, keeping `id` itself.
    pub fn truncate_after(&self, id: MessageId) -> bool {
        self.state.send_if_modified(|messages| {
            match messages.iter().position(|message| message.id == id) {
                Some(index) if index + 1 < messages.len() => {
                    messages.truncate(index + 1);
                    true
                }
                _ => false,
            }
        })
    }

    pub fn replace(&self, messages: Vec<ChatMessage>) {
        self.state.send_replace(messages);
    }
}
