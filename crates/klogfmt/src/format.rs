//! Single line rendering.

use std::fmt::Display;

use chrono::{DateTime, TimeZone};
use crossterm::style::Stylize;
use klog_core::Priority;

use crate::level::Level;

/// Timestamp layout: `2024-05-01 10:02:03,117`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Renders kernel log lines for the console.
#[derive(Debug, Clone, Copy)]
pub struct LineFormatter {
    color: bool,
    min_level: Level,
}

impl Default for LineFormatter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LineFormatter {
    pub fn new(color: bool) -> Self {
        Self {
            color,
            min_level: Level::Debug,
        }
    }

    /// Hides lines below `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Formats one line received at `at`.
    ///
    /// Returns `None` for blank lines and for lines below the minimum level.
    pub fn format_line<Tz>(&self, line: &str, at: &DateTime<Tz>) -> Option<String>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        if line.trim().is_empty() {
            return None;
        }

        let (priority, message) = Priority::parse_line(line);
        let level = Level::from_severity(priority.severity());
        if level < self.min_level {
            return None;
        }

        let text = format!("[{}] {}", at.format(TIMESTAMP_FORMAT), message.trim());
        if !self.color {
            return Some(text);
        }

        let styled = text.with(level.color());
        let styled = if level.is_bold() { styled.bold() } else { styled };
        Some(styled.to_string())
    }
}
