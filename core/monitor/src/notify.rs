//! Human-facing notifications.
//!
//! Notifications are fire-and-forget and never drive control flow. The
//! default sink writes through `tracing` under the `notification` target so a
//! desktop shell can pick them up from the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, title: &str, message: &str);

    fn info(&self, title: &str, message: &str) {
        self.notify(NotificationLevel::Info, title, message);
    }

    fn warning(&self, title: &str, message: &str) {
        self.notify(NotificationLevel::Warning, title, message);
    }

    fn error(&self, title: &str, message: &str) {
        self.notify(NotificationLevel::Error, title, message);
    }
}

#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotificationLevel, title: &str, message: &str) {
        match level {
            NotificationLevel::Info => {
                tracing::info!(target: "notification", title, message, "Notification")
            }
            NotificationLevel::Warning => {
                tracing::warn!(target: "notification", title, message, "Notification")
            }
            NotificationLevel::Error => {
                tracing::error!(target: "notification", title, message, "Notification")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedNotification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

/// Keeps every notification in memory for hosts that render them themselves.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    entries: Mutex<Vec<RecordedNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RecordedNotification> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NotificationLevel, title: &str, message: &str) {
        let entry = RecordedNotification {
            level,
            title: title.to_string(),
            message: message.to_string(),
        };
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Suppresses repeat notifications for the same key inside a window.
///
/// Only notifications pass through here; state transitions never do.
#[derive(Debug)]
pub struct NotificationDebouncer {
    window: Duration,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NotificationDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records `now` when the key is outside its window.
    pub fn should_send(&self, key: &str, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let mut last_sent = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let allowed = last_sent
            .get(key)
            .map(|previous| now.signed_duration_since(*previous) > window)
            .unwrap_or(true);
        if allowed {
            last_sent.insert(key.to_string(), now);
        }
        allowed
    }
}
