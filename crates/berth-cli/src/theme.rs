//! CLI theme and styling.

use berth_components::ComponentState;
use berth_core::NoticeLevel;
use colored::Colorize;

/// CLI theme configuration.
pub(crate) struct Theme;

impl Theme {
    /// Format a header.
    pub(crate) fn header(text: &str) -> String {
        format!("{}", text.bold().cyan())
    }

    /// Format a success message.
    pub(crate) fn success(text: &str) -> String {
        format!("{} {}", "✓".green(), text)
    }

    /// Format an error message.
    pub(crate) fn error(text: &str) -> String {
        format!("{} {}", "✗".red(), text.red())
    }

    /// Format a warning message.
    pub(crate) fn warning(text: &str) -> String {
        format!("{} {}", "!".yellow(), text.yellow())
    }

    /// Format an info message.
    pub(crate) fn info(text: &str) -> String {
        format!("{} {}", "i".blue(), text)
    }

    /// Format a dimmed message.
    pub(crate) fn dimmed(text: &str) -> String {
        format!("{}", text.dimmed())
    }

    /// Format a separator line.
    pub(crate) fn separator() -> String {
        "━".repeat(50).dimmed().to_string()
    }

    /// Format a key-value pair.
    pub(crate) fn kv(key: &str, value: &str) -> String {
        format!("  {:<12} {}", format!("{key}:").bold(), value)
    }

    /// Format an instance or content id (shortened).
    pub(crate) fn short_id(id: &str) -> String {
        let short = id.get(..8).unwrap_or(id);
        format!("{}", short.cyan())
    }

    /// Format a timestamp.
    pub(crate) fn timestamp(dt: &chrono::DateTime<chrono::Utc>) -> String {
        dt.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string()
    }

    /// Format a lifecycle state.
    pub(crate) fn state(state: ComponentState) -> String {
        let text = state.to_string();
        match state {
            ComponentState::Running => text.green().to_string(),
            ComponentState::Starting | ComponentState::Stopping => text.yellow().to_string(),
            ComponentState::Crashed => text.red().bold().to_string(),
            ComponentState::NotRunning => text.dimmed().to_string(),
        }
    }

    /// Format a notice for the terminal.
    pub(crate) fn notice(level: NoticeLevel, title: &str, message: &str) -> String {
        let line = format!("{title}: {message}");
        match level {
            NoticeLevel::Info => Self::info(&line),
            NoticeLevel::Warning => Self::warning(&line),
            NoticeLevel::Error => Self::error(&line),
        }
    }

    /// Format a byte count.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn bytes(size: u64) -> String {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
        let mut value = size as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len().saturating_sub(1) {
            value /= 1024.0;
            unit = unit.saturating_add(1);
        }
        if unit == 0 {
            format!("{size} B")
        } else {
            format!("{value:.1} {}", UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_counts_are_humanized() {
        assert_eq!(Theme::bytes(512), "512 B");
        assert_eq!(Theme::bytes(1536), "1.5 KiB");
        assert_eq!(Theme::bytes(500 * 1024 * 1024), "500.0 MiB");
    }

    #[test]
    fn short_ids_survive_short_input() {
        colored::control::set_override(false);
        assert_eq!(Theme::short_id("abc"), "abc");
        assert_eq!(Theme::short_id("0123456789abcdef"), "01234567");
    }
}
