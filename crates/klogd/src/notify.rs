//! Announcement sink for human-readable status lines.
//!
//! The daemon has no foreground user, so "serving on address:port" style
//! messages go to whatever sink the host provides. In the shipped binary
//! that is the tracing subscriber, whose output the bootstrap points at the
//! console.

use std::sync::Mutex;

use tracing::info;

/// Accepts formatted status messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Emits notifications as info-level log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(target: "klogd::notify", "{message}");
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the messages received so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
