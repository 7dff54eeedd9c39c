//! klog Core - Shared types for the kernel log broadcaster
//!
//! This crate provides the compiled-in defaults shared between
//! the daemon (klogd) and the console formatter (klogfmt), plus the
//! syslog priority prefix that kernel log lines carry.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod priority;

use std::time::Duration;

pub use error::PriorityError;
pub use priority::{Priority, Severity};

/// TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 3232;

/// Kernel log device that is tailed by default.
pub const DEFAULT_SOURCE_PATH: &str = "/dev/klog";

/// Process name used to find (and replace) stale daemon instances.
pub const PROCESS_NAME: &str = "klogsrv";

/// Upper bound on how long the broadcast loop waits for readiness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause between supervisor attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(3);
