// Toast surface: every user-action outcome ends up here as a Notice
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: Option<String>,
}

impl Notice {
    pub fn success(title: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Success, title: title.into(), description: None }
    }

    pub fn info(title: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, title: title.into(), description: None }
    }

    pub fn error(title: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Error, title: title.into(), description: None }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    /// Notices with nobody listening are dropped
    pub fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => tracing::warn!("{}: {}", notice.title, notice.description.as_deref().unwrap_or("")),
            _ => tracing::debug!("{}", notice.title),
        }
        let _ = self.sender.send(notice);
    }

    pub fn success(&self, title: impl Into<String>) {
        self.notify(Notice::success(title));
    }

    /// Convert a failed user action into an error notice
    pub fn failure(&self, title: impl Into<String>, err: &HubError) {
        self.notify(Notice::error(title).with_description(err.user_message()));
    }
}
