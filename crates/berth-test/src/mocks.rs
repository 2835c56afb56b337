//! Mock implementations for testing.

use std::sync::{Arc, Mutex};

use berth_core::{Notice, NoticeLevel, Notifier};

/// A [`Notifier`] that keeps every notice for later assertions.
///
/// Clones share the same log, so one clone can be handed to the manager and
/// another kept by the test.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every notice received so far.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Notices of the given level.
    #[must_use]
    pub fn at_level(&self, level: NoticeLevel) -> Vec<Notice> {
        self.notices()
            .into_iter()
            .filter(|n| n.level == level)
            .collect()
    }

    /// Number of warnings received.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.at_level(NoticeLevel::Warning).len()
    }

    /// Forget everything received so far.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.notices.lock() {
            guard.clear();
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut guard) = self.notices.lock() {
            guard.push(notice);
        }
    }
}
