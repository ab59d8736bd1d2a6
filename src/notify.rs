use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Info,
    Error,
}

/// User-facing toast channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: Level, title: &str, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: Level,
    pub title: String,
    pub message: String,
}

/// Keeps every notice; used by tests and headless callers.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|notices| notices.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, level: Level, title: &str, message: &str) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(Notice {
                level,
                title: title.to_string(),
                message: message.to_string(),
            });
        }
    }
}

/// Routes notices to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: Level, title: &str, message: &str) {
        match level {
            Level::Success | Level::Info => tracing::info!(%title, %message, "notice"),
            Level::Error => tracing::error!(%title, %message, "notice"),
        }
    }
}
