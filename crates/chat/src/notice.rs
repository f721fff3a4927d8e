#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeStatus {
    Info,
    Success,
    Error,
}

/// User-facing toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: Option<String>,
    pub status: NoticeStatus,
}

impl Notice {
    pub fn new(title: impl Into<String>, status: NoticeStatus) -> Self {
        Self {
            title: title.into(),
            description: None,
            status,
        }
    }

    pub fn error(title: impl Into<String>) -> Self {
        Self::new(title, NoticeStatus::Error)
    }

    pub fn info(title: impl Into<String>) -> Self {
        Self::new(title, NoticeStatus::Info)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Routes notices into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        let description = notice.description.as_deref().unwrap_or_default();
        match notice.status {
            NoticeStatus::Error => tracing::warn!(title = %notice.title, description, "notice"),
            NoticeStatus::Info | NoticeStatus::Success => {
                tracing::info!(title = %notice.title, description, "notice")
            }
        }
    }
}
