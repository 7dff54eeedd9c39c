//! Supervisor - keeps the broadcast server alive forever.
//!
//! Each attempt checks that there is a reachable address, that the source
//! can be opened and that the listener can be bound, then serves sessions
//! back to back until something fails. Whatever the outcome, the
//! supervisor waits `retry_delay` and starts over. A missing log device or
//! a network that is not up yet only ever costs one retry delay.
//!
//! ```text
//!        ┌──────────┐  attempt   ┌────────────────┐
//!   ────▶│   Idle   │───────────▶│ SessionRunning │
//!        └──────────┘            └───────┬────────┘
//!             ▲                          │ ended / failed / no address
//!             │ delay elapsed    ┌───────▼────────┐
//!             └──────────────────│    Backoff     │
//!                                └────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{announcement, servable_addresses, InterfaceSource};
use crate::notify::Notifier;
use crate::server::{bind_listener, BroadcastSession, ServerConfig, ServerError, SessionEnd};
use crate::source::SourceReader;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    SessionRunning,
    Backoff,
}

/// Inputs that move the supervisor between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    AttemptStarted,
    AttemptEnded,
    BackoffElapsed,
}

impl SupervisorState {
    /// Returns the state that follows `event`.
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn next(self, event: SupervisorEvent) -> Self {
        match (self, event) {
            (Self::Idle, SupervisorEvent::AttemptStarted) => Self::SessionRunning,
            (Self::SessionRunning, SupervisorEvent::AttemptEnded) => Self::Backoff,
            (Self::Backoff, SupervisorEvent::BackoffElapsed) => Self::Idle,
            (state, _) => state,
        }
    }
}

/// Non-error results of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// No address a client could reach; try again later.
    NoServableAddress,
    /// The shutdown token fired while serving.
    Shutdown,
}

/// Counters describing what the supervisor has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub attempts: u64,
    pub failed_attempts: u64,
    pub sessions_started: u64,
    pub sessions_drained: u64,
}

/// Runs broadcast sessions in a retry loop.
pub struct Supervisor {
    config: ServerConfig,
    interfaces: Arc<dyn InterfaceSource>,
    notifier: Arc<dyn Notifier>,
    cancel_token: CancellationToken,
    listening: watch::Sender<Option<SocketAddr>>,
    attempts: AtomicU64,
    failed_attempts: AtomicU64,
    sessions_started: AtomicU64,
    sessions_drained: AtomicU64,
}

impl Supervisor {
    /// Creates a supervisor.
    ///
    /// # Arguments
    ///
    /// * `config` - Source path, bind address and timing
    /// * `interfaces` - Where to look for servable addresses
    /// * `notifier` - Sink for "serving on" announcements
    /// * `cancel_token` - Token for process shutdown
    pub fn new(
        config: ServerConfig,
        interfaces: Arc<dyn InterfaceSource>,
        notifier: Arc<dyn Notifier>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (listening, _) = watch::channel(None);
        Self {
            config,
            interfaces,
            notifier,
            cancel_token,
            listening,
            attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_drained: AtomicU64::new(0),
        }
    }

    /// Watches the address the listener is currently bound to.
    ///
    /// `None` whenever no listening endpoint exists.
    pub fn listening(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.listening.subscribe()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_drained: self.sessions_drained.load(Ordering::Relaxed),
        }
    }

    /// Runs until the cancellation token is triggered.
    pub async fn run(&self) {
        let mut state = SupervisorState::Idle;

        info!(
            source = %self.config.source_path.display(),
            addr = %self.config.bind_addr,
            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
            "Supervisor starting"
        );

        loop {
            match state {
                SupervisorState::Idle => {
                    if self.cancel_token.is_cancelled() {
                        break;
                    }
                    state = self.transition(state, SupervisorEvent::AttemptStarted);
                }

                SupervisorState::SessionRunning => {
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                    let result = self.run_attempt().await;
                    self.listening.send_replace(None);

                    match result {
                        Ok(AttemptOutcome::Shutdown) => break,
                        Ok(AttemptOutcome::NoServableAddress) => {
                            debug!("No servable address, skipping attempt");
                        }
                        Err(ServerError::Source(e)) if e.is_open_error() => {
                            self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                error = %e,
                                retry_in_ms = self.config.retry_delay.as_millis() as u64,
                                "Source not available"
                            );
                        }
                        Err(e) => {
                            self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                            error!(
                                error = %e,
                                retry_in_ms = self.config.retry_delay.as_millis() as u64,
                                "Broadcast attempt failed"
                            );
                        }
                    }
                    state = self.transition(state, SupervisorEvent::AttemptEnded);
                }

                SupervisorState::Backoff => {
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => break,
                        _ = sleep(self.config.retry_delay) => {}
                    }
                    state = self.transition(state, SupervisorEvent::BackoffElapsed);
                }
            }
        }

        info!("Supervisor stopped");
    }

    fn transition(&self, state: SupervisorState, event: SupervisorEvent) -> SupervisorState {
        let next = state.next(event);
        debug!(from = ?state, to = ?next, event = ?event, "Supervisor transition");
        next
    }

    /// One pass: discovery gate, source probe, bind, then sessions until error.
    async fn run_attempt(&self) -> Result<AttemptOutcome, ServerError> {
        let interfaces = self
            .interfaces
            .interfaces()
            .map_err(ServerError::Discovery)?;
        let servable = servable_addresses(&interfaces);
        if servable.is_empty() {
            return Ok(AttemptOutcome::NoServableAddress);
        }

        // A missing source must not leave a listening endpoint behind.
        SourceReader::probe(&self.config.source_path).await?;

        let listener = bind_listener(self.config.bind_addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Listen {
                addr: self.config.bind_addr,
                source: e,
            })?;
        self.listening.send_replace(Some(local_addr));

        for iface in &servable {
            self.notifier.notify(&announcement(
                &self.config.source_path,
                iface,
                local_addr.port(),
            ));
        }

        loop {
            let first_client = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => return Ok(AttemptOutcome::Shutdown),

                result = listener.accept() => result.map_err(ServerError::Accept)?,
            };

            self.sessions_started.fetch_add(1, Ordering::Relaxed);
            let session = BroadcastSession::new(&listener, &self.config, self.cancel_token.clone());

            match session.run(first_client).await? {
                SessionEnd::Drained => {
                    self.sessions_drained.fetch_add(1, Ordering::Relaxed);
                }
                SessionEnd::Shutdown => return Ok(AttemptOutcome::Shutdown),
            }
        }
    }
}
