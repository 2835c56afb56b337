//! Terminal notifier: prints user-visible notices to stderr.

use berth_core::{Notice, Notifier};

use crate::theme::Theme;

/// Writes every notice to stderr as it arrives.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        let title = match &notice.component {
            Some(component) => format!("{} ({component})", notice.title),
            None => notice.title.clone(),
        };
        eprintln!("{}", Theme::notice(notice.level, &title, &notice.message));
    }
}
