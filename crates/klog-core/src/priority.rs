//! Syslog priority prefix carried by kernel log lines.
//!
//! Kernel messages read from the log device start with `<N>`, where `N`
//! packs the facility and the severity: `facility = N >> 3`,
//! `severity = N & 7`. Lines without a prefix are treated as
//! `user.info`-ish default traffic (priority 118).

use std::fmt;
use std::str::FromStr;

use crate::error::PriorityError;

/// Syslog severity (the low three bits of a priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Informational = 6,
    Debug = 7,
}

impl Severity {
    /// Returns the numeric severity code.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Severity {
    type Error = PriorityError;

    fn try_from(value: u8) -> Result<Self, PriorityError> {
        match value {
            0 => Ok(Self::Emergency),
            1 => Ok(Self::Alert),
            2 => Ok(Self::Critical),
            3 => Ok(Self::Error),
            4 => Ok(Self::Warning),
            5 => Ok(Self::Notice),
            6 => Ok(Self::Informational),
            7 => Ok(Self::Debug),
            other => Err(PriorityError::SeverityOutOfRange(other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Emergency => "emerg",
            Self::Alert => "alert",
            Self::Critical => "crit",
            Self::Error => "err",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Informational => "info",
            Self::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// A decoded `<N>` priority value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority(u32);

impl Priority {
    /// Priority assumed for lines that carry no prefix.
    pub const DEFAULT: Priority = Priority(118);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn facility(self) -> u32 {
        self.0 >> 3
    }

    pub fn severity(self) -> Severity {
        // Masked to three bits, so the conversion cannot fail.
        Severity::try_from((self.0 & 7) as u8).unwrap_or(Severity::Debug)
    }

    /// Splits a log line into its priority and the remaining text.
    ///
    /// A well-formed `<N>` prefix is stripped from the returned text. When the
    /// prefix is absent or malformed the line is returned untouched together
    /// with [`Priority::DEFAULT`].
    pub fn parse_line(line: &str) -> (Priority, &str) {
        let Some(rest) = line.strip_prefix('<') else {
            return (Self::DEFAULT, line);
        };
        let Some(end) = rest.find('>') else {
            return (Self::DEFAULT, line);
        };

        match rest.get(..end).map(str::parse::<Priority>) {
            Some(Ok(priority)) => (priority, rest.get(end + 1..).unwrap_or("")),
            _ => (Self::DEFAULT, line),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for Priority {
    type Err = PriorityError;

    /// Parses the digits of a priority, with or without the angle brackets.
    ///
    /// Any run of decimal digits is accepted. Values too large for a `u32`
    /// keep their low 32 bits, so the severity bits are never lost.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('<')
            .and_then(|inner| inner.strip_suffix('>'))
            .unwrap_or(s);

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PriorityError::InvalidPrefix(s.to_string()));
        }

        let value = digits.bytes().fold(0u32, |acc, b| {
            acc.wrapping_mul(10).wrapping_add(u32::from(b - b'0'))
        });
        Ok(Priority(value))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}
