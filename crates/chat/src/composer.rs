use std::sync::Arc;

use deeplist_storage::{ChatId, DraftKey, DraftStore, StorageResult};
use tokio::sync::watch;

use super::message::PendingFile;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerState {
    pub input: String,
    pub pending_files: Vec<PendingFile>,
    pub chat_id: Option<ChatId>,
    /// Bumped whenever the user moves to another conversation.
    pub epoch: u64,
}

/// Live input, pending files and the active conversation.
///
/// Typing writes through to the draft store; [`Composer::clear_input`] only
/// clears the live text so a failed submission keeps its stored draft.
#[derive(Clone)]
pub struct Composer {
    state: Arc<watch::Sender<ComposerState>>,
    drafts: Arc<dyn DraftStore>,
}

impl Composer {
    pub fn new(drafts: Arc<dyn DraftStore>) -> Self {
        let (state, _) = watch::channel(ComposerState::default());
        Self {
            state: Arc::new(state),
            drafts,
        }
    }

    /// Opens the composer on `chat_id`, restoring its draft.
    pub fn open(drafts: Arc<dyn DraftStore>, chat_id: Option<ChatId>) -> StorageResult<Self> {
        let composer = Self::new(drafts);
        composer.switch_conversation(chat_id)?;
        Ok(composer)
    }

    pub fn subscribe(&self) -> watch::Receiver<ComposerState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ComposerState {
        self.state.borrow().clone()
    }

    pub fn input(&self) -> String {
        self.state.borrow().input.clone()
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.state.borrow().chat_id.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    pub fn draft_key(&self) -> DraftKey {
        DraftKey::for_chat(self.state.borrow().chat_id.as_ref())
    }

    pub fn pending_files(&self) -> Vec<PendingFile> {
        self.state.borrow().pending_files.clone()
    }

    pub fn has_pending_files(&self) -> bool {
        !self.state.borrow().pending_files.is_empty()
    }

    pub fn set_input(&self, text: impl Into<String>) -> StorageResult<()> {
        let text = text.into();
        let key = self.draft_key();
        self.drafts.set_draft(&key, &text)?;
        self.state.send_modify(|state| state.input = text);
        Ok(())
    }

    pub fn clear_input(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.input.is_empty();
            state.input.clear();
            changed
        });
    }

    pub fn attach(&self, file: PendingFile) {
        self.state.send_modify(|state| state.pending_files.push(file));
    }

    pub fn clear_pending_files(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.pending_files.is_empty();
            state.pending_files.clear();
            changed
        });
    }

    /// Moves to another conversation (or the new-conversation slot) and loads its draft.
    pub fn switch_conversation(&self, chat_id: Option<ChatId>) -> StorageResult<()> {
        let draft = self
            .drafts
            .draft(&DraftKey::for_chat(chat_id.as_ref()))?
            .unwrap_or_default();
        self.state.send_modify(|state| {
            state.epoch += 1;
            state.chat_id = chat_id;
            state.input = draft;
            state.pending_files.clear();
        });
        Ok(())
    }

    /// Records a conversation created for an in-flight submission.
    ///
    /// Returns false when the user switched away since `epoch` was captured.
    pub fn adopt_conversation(&self, epoch: u64, chat_id: ChatId) -> bool {
        let mut adopted = false;
        self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            adopted = true;
            if state.chat_id.as_ref() == Some(&chat_id) {
                return false;
            }
            state.chat_id = Some(chat_id);
            true
        });
        adopted
    }
}
