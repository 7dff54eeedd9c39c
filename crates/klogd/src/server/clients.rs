//! Active client set for a broadcast session.
//!
//! Membership is liveness: a client is in the set until a write to it
//! fails. The only two operations that change membership are
//! [`ClientSet::admit`] and the pruning inside [`ClientSet::broadcast`].
//!
//! Client sockets are taken out of the tokio reactor and written with
//! plain non-blocking writes. A write that cannot complete immediately is
//! a failed write: slow clients are dropped rather than buffered for, and
//! one stuck client never stalls delivery to the others.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use tracing::debug;

use super::ServerError;

/// Identifier assigned to each accepted connection within a session.
pub type ClientId = u64;

/// One accepted connection.
#[derive(Debug)]
struct ClientConnection {
    peer: SocketAddr,
    stream: TcpStream,
}

impl ClientConnection {
    /// Writes the whole chunk without blocking.
    fn send(&mut self, data: &[u8]) -> Result<(), ClientWriteError> {
        loop {
            match self.stream.write(data) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    return Err(ClientWriteError::Short {
                        written: n,
                        expected: data.len(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(ClientWriteError::WouldBlock)
                }
                Err(e) => return Err(ClientWriteError::Io(e)),
            }
        }
    }

    fn close(self) {
        // Peer may already be gone; nothing left to report.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// The set of clients that still receive broadcast bytes.
#[derive(Debug)]
pub struct ClientSet {
    clients: HashMap<ClientId, ClientConnection>,
    next_id: ClientId,
    max_clients: usize,
}

impl ClientSet {
    /// Creates an empty set that holds at most `max_clients` connections.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 0,
            max_clients,
        }
    }

    /// Adds a freshly accepted connection.
    ///
    /// The connection is closed and rejected when the set is full. A new
    /// member only receives bytes broadcast after this call.
    pub fn admit(
        &mut self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<ClientId, ServerError> {
        if self.clients.len() >= self.max_clients {
            drop(stream);
            return Err(ServerError::TooManyClients {
                max: self.max_clients,
            });
        }

        // into_std keeps the socket in non-blocking mode.
        let stream = stream.into_std().map_err(ServerError::ClientSetup)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.clients.insert(id, ClientConnection { peer, stream });

        debug!(client_id = id, peer = %peer, clients = self.clients.len(), "Client admitted");
        Ok(id)
    }

    /// Writes `data` to every client, dropping each one whose write fails.
    ///
    /// Returns the ids of the clients that were dropped.
    pub fn broadcast(&mut self, data: &[u8]) -> Vec<ClientId> {
        let mut failed_clients = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            if let Err(e) = client.send(data) {
                debug!(
                    client_id = id,
                    peer = %client.peer,
                    error = %e,
                    "Failed to write to client"
                );
                failed_clients.push(*id);
            }
        }

        for id in &failed_clients {
            if let Some(client) = self.clients.remove(id) {
                debug!(client_id = id, peer = %client.peer, "Removed failed client");
                client.close();
            }
        }

        failed_clients
    }

    /// Closes every remaining connection.
    pub fn close_all(&mut self) {
        for (_, client) in self.clients.drain() {
            client.close();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

impl Drop for ClientSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Why a write to a single client failed. Never fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    #[error("Short write: {written} of {expected} bytes")]
    Short { written: usize, expected: usize },

    #[error("Client is not accepting data")]
    WouldBlock,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
