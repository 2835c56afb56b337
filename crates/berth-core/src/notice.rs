//! User-visible notices.
//!
//! The lifecycle manager never prints or renders anything itself. Conditions
//! the user must see (a crashed component, a restart loop that was given up
//! on, a version override waiting for a restart) are handed to a [`Notifier`]
//! supplied by whatever front end embeds the manager.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::component::ComponentId;

/// Severity of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational.
    Info,
    /// Something went wrong but was handled.
    Warning,
    /// Something went wrong and needs the user.
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A message meant for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Severity.
    pub level: NoticeLevel,
    /// The component the notice is about, if any.
    pub component: Option<ComponentId>,
    /// Short headline.
    pub title: String,
    /// Human-readable detail.
    pub message: String,
    /// When the notice was raised.
    pub raised_at: DateTime<Utc>,
}

impl Notice {
    /// Create a notice stamped with the current time.
    #[must_use]
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            component: None,
            title: title.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    /// A warning about `component`.
    #[must_use]
    pub fn warning(
        component: &ComponentId,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(NoticeLevel::Warning, title, message).with_component(component.clone())
    }

    /// Attach the component this notice concerns.
    #[must_use]
    pub fn with_component(mut self, component: ComponentId) -> Self {
        self.component = Some(component);
        self
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.title, self.message)
    }
}

/// Sink for user-visible notices.
pub trait Notifier: Send + Sync {
    /// Deliver a notice to the user. Must not block.
    fn notify(&self, notice: Notice);
}

/// A [`Notifier`] that only writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        let component = notice
            .component
            .as_ref()
            .map_or_else(String::new, ToString::to_string);
        match notice.level {
            NoticeLevel::Info => {
                tracing::info!(component_id = %component, title = %notice.title, "{}", notice.message);
            },
            NoticeLevel::Warning => {
                tracing::warn!(component_id = %component, title = %notice.title, "{}", notice.message);
            },
            NoticeLevel::Error => {
                tracing::error!(component_id = %component, title = %notice.title, "{}", notice.message);
            },
        }
    }
}
