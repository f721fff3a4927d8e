use deeplist_storage::{AgentId, UserId};

use super::message::AgentRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: UserId,
    pub is_authenticated: bool,
}

impl UserIdentity {
    pub fn authenticated(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            is_authenticated: true,
        }
    }

    pub fn guest(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            is_authenticated: false,
        }
    }
}

/// Persona selected for the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub system_prompt: Option<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn agent_ref(&self) -> AgentRef {
        AgentRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Everything a submission reads from outside the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionContext {
    pub user: Option<UserIdentity>,
    pub model_id: String,
    pub agent: Option<AgentProfile>,
    /// User-level custom prompt from preferences.
    pub custom_system_prompt: Option<String>,
    pub enable_search: bool,
}

impl SubmissionContext {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            user: None,
            model_id: model_id.into(),
            agent: None,
            custom_system_prompt: None,
            enable_search: false,
        }
    }

    pub fn with_user(mut self, user: UserIdentity) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_agent(mut self, agent: AgentProfile) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_custom_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_search(mut self, enable_search: bool) -> Self {
        self.enable_search = enable_search;
        self
    }
}
