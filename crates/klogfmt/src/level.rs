//! Display levels and their colors.

use crossterm::style::Color;
use klog_core::Severity;

/// Display level a kernel severity is shown at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Maps a syslog severity onto a display level.
    ///
    /// Emergency, alert and critical collapse into `Critical`; notice and
    /// informational both show as `Info`.
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Emergency | Severity::Alert | Severity::Critical => Self::Critical,
            Severity::Error => Self::Error,
            Severity::Warning => Self::Warning,
            Severity::Notice | Severity::Informational => Self::Info,
            Severity::Debug => Self::Debug,
        }
    }

    pub fn color(self) -> Color {
        match self {
            Self::Debug | Self::Info => Color::Grey,
            Self::Warning => Color::Yellow,
            Self::Error | Self::Critical => Color::Red,
        }
    }

    /// Critical lines are additionally rendered bold.
    pub fn is_bold(self) -> bool {
        self == Self::Critical
    }
}
