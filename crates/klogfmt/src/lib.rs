//! klog-fmt - console formatter for the klog broadcast stream
//!
//! Turns raw kernel log lines (`<N>message`) into timestamped lines
//! colored by severity:
//!
//! ```text
//! <3>usb 1-1: device not accepting address   →   [2024-05-01 10:02:03,117] usb 1-1: ...  (red)
//! ```
//!
//! - `level` - Severity to display level mapping and colors
//! - `format` - Single line rendering
//! - `stream` - Async line pump from a reader to a writer

pub mod format;
pub mod level;
pub mod stream;

pub use format::LineFormatter;
pub use level::Level;
pub use stream::{format_stream, StreamError};
