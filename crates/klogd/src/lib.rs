//! klog Daemon - kernel log tail and broadcast server
//!
//! This crate provides the core infrastructure for the klog daemon:
//! - `source` - Follows the watched log source, one chunk at a time
//! - `server` - TCP listener and the broadcast session event loop
//! - `discovery` - Finds the local addresses worth announcing
//! - `supervisor` - Retries sessions forever with a fixed backoff
//! - `guard` - Replaces stale instances of the daemon
//! - `notify` - Announcement sink
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    klogsrv daemon                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   Supervisor    │────▶│     BroadcastSession        │   │
//! │  │ (retry/backoff) │     │  (select! accept / read)    │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ bind                        │ bytes             │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  TcpListener    │     │   ClientSet                 │   │
//! │  │ (SO_REUSEADDR)  │     │   (fan-out, prune on fail)  │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Client write failures are contained to the failing client

pub mod discovery;
pub mod guard;
pub mod notify;
pub mod server;
pub mod source;
pub mod supervisor;

#[cfg(test)]
mod test_support;
