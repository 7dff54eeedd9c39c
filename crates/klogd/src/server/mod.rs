//! TCP broadcast server for the klog daemon.
//!
//! The server:
//! - Binds a listening socket with address reuse enabled
//! - Runs one broadcast session at a time over that listener
//! - Fans every chunk read from the source out to all live clients
//! - Prunes clients whose writes fail, without disturbing the others
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ BroadcastSession│
//! │                 │
//! │  select! {      │◀──── TcpListener::accept()
//! │    accept,      │
//! │    read_chunk,  │◀──── SourceReader
//! │    tick,        │
//! │  }              │
//! └───────┬─────────┘
//!         │ broadcast
//!         ▼
//! ┌─────────────────┐
//! │    ClientSet    │
//! │ (prune on fail) │
//! └─────────────────┘
//! ```
//!
//! Everything runs on the one task that drives the session, so the source
//! handle and the client set are never shared.

mod clients;

pub use clients::{ClientId, ClientSet, ClientWriteError};

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use klog_core::{DEFAULT_PORT, DEFAULT_SOURCE_PATH, POLL_INTERVAL, RETRY_DELAY};

use crate::source::{SourceError, SourceReader, READ_CHUNK_SIZE};

/// Pending-connection queue length for the listening socket.
pub const LISTEN_BACKLOG: u32 = 5;

/// Maximum number of concurrently connected clients.
pub const MAX_CLIENTS: usize = 1000;

/// Settings shared by the supervisor and the broadcast sessions.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the log file or device to follow.
    pub source_path: PathBuf,

    /// Address the listening socket binds to.
    pub bind_addr: SocketAddr,

    /// Upper bound on a single wait in the session loop.
    pub poll_interval: Duration,

    /// Pause between supervisor attempts.
    pub retry_delay: Duration,

    /// Client connections beyond this count are refused.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from(DEFAULT_SOURCE_PATH),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            poll_interval: POLL_INTERVAL,
            retry_delay: RETRY_DELAY,
            max_clients: MAX_CLIENTS,
        }
    }
}

/// Binds the listening endpoint with `SO_REUSEADDR` set.
///
/// Address reuse lets a restarted daemon rebind right away instead of
/// waiting out `TIME_WAIT` from the previous instance.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_error = |e: io::Error| ServerError::Bind { addr, source: e };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;

    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ServerError::Listen { addr, source: e })
}

/// How a broadcast session finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every client disconnected.
    Drained,
    /// The shutdown token fired.
    Shutdown,
}

/// One broadcast session: from opening the source until the last client
/// leaves or an I/O error ends it.
pub struct BroadcastSession<'a> {
    listener: &'a TcpListener,
    config: &'a ServerConfig,
    cancel_token: CancellationToken,
}

impl<'a> BroadcastSession<'a> {
    pub fn new(
        listener: &'a TcpListener,
        config: &'a ServerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            listener,
            config,
            cancel_token,
        }
    }

    /// Runs the session, starting with the connection that woke it up.
    ///
    /// Opens the source, then multiplexes new connections and new source
    /// bytes until the client set is empty again. Accept and source errors
    /// end the session with an error; the source handle and every client
    /// are closed on return either way.
    pub async fn run(
        self,
        first_client: (TcpStream, SocketAddr),
    ) -> Result<SessionEnd, ServerError> {
        let mut source =
            SourceReader::open(&self.config.source_path, self.config.poll_interval).await?;
        let mut clients = ClientSet::new(self.config.max_clients);

        let (stream, peer) = first_client;
        self.admit(&mut clients, stream, peer);

        info!(
            source = %source.path().display(),
            follow = source.is_following(),
            "Broadcast session started"
        );

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut tick = interval(self.config.poll_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if clients.is_empty() {
                info!("All clients disconnected, ending session");
                return Ok(SessionEnd::Drained);
            }

            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!(clients = clients.len(), "Session shutdown requested");
                    return Ok(SessionEnd::Shutdown);
                }

                result = self.listener.accept() => {
                    let (stream, peer) = result.map_err(ServerError::Accept)?;
                    self.admit(&mut clients, stream, peer);
                }

                result = source.read_chunk(&mut buf) => {
                    let n = result?;
                    let chunk = buf.get(..n).unwrap_or_default();
                    let dropped = clients.broadcast(chunk);
                    if !dropped.is_empty() {
                        info!(
                            dropped = dropped.len(),
                            remaining = clients.len(),
                            "Dropped disconnected clients"
                        );
                    }
                }

                _ = tick.tick() => {}
            }
        }
    }

    fn admit(&self, clients: &mut ClientSet, stream: TcpStream, peer: SocketAddr) {
        match clients.admit(stream, peer) {
            Ok(id) => {
                info!(client_id = id, peer = %peer, clients = clients.len(), "Client connected");
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Refused client connection");
            }
        }
    }
}

impl std::fmt::Debug for BroadcastSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSession")
            .field("listener", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

/// Errors that can occur in server operations.
///
/// All of them end the current session except `TooManyClients` and
/// `ClientSetup`, which only refuse one connection.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Failed to enumerate network interfaces: {0}")]
    Discovery(#[source] io::Error),

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Failed to set up client connection: {0}")]
    ClientSetup(#[source] io::Error),
}
