//! Server-side session registry.
//!
//! Accepts streams, gives each a fresh id, and turns the traffic of every
//! live connection into [`SessionEvent`]s on a single channel. The consumer
//! of that channel sees `ClientConnected` for an id before any message from
//! it, and at most one `ClientDisconnected`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{
    CloseReason, Connection, ConnectionConfig, ConnectionError, ConnectionId, ConnectionObserver,
};

#[derive(Debug)]
pub enum SessionEvent {
    ClientConnected {
        id: ConnectionId,
        peer: Option<SocketAddr>,
    },
    MessageReceived {
        id: ConnectionId,
        payload: Bytes,
    },
    ClientDisconnected {
        id: ConnectionId,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no live connection with id {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Send(#[from] ConnectionError),
}

struct RegistryShared {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: ConnectionConfig,
    tasks: TaskTracker,
}

impl ConnectionObserver for RegistryShared {
    fn on_message(&self, id: ConnectionId, payload: Bytes) {
        let _ = self.events.send(SessionEvent::MessageReceived { id, payload });
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        if self.connections.remove(&id).is_some() {
            tracing::info!(conn_id = id, %reason, "Client disconnected");
            let _ = self.events.send(SessionEvent::ClientDisconnected { id, reason });
        }
    }
}

/// Cloneable handle to the set of live connections.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            shared: Arc::new(RegistryShared {
                connections: DashMap::new(),
                next_id: AtomicU64::new(0),
                events,
                config,
                tasks: TaskTracker::new(),
            }),
        };
        (registry, rx)
    }

    /// Adopt an accepted stream and start its tasks.
    ///
    /// The connection is in the map and `ClientConnected` is queued before
    /// its reader can deliver anything.
    pub fn register<S>(&self, stream: S, peer: Option<SocketAddr>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let observer: Arc<dyn ConnectionObserver> = shared.clone();
        let pending = Connection::new(id, peer, shared.config.clone(), observer);

        shared.connections.insert(id, pending.handle());
        let _ = shared.events.send(SessionEvent::ClientConnected { id, peer });
        pending.start(stream, &shared.tasks);

        tracing::info!(conn_id = id, ?peer, "Client connected");
        id
    }

    /// Accept loop. Runs until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        self.register(stream, Some(peer));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::debug!("Acceptor stopped");
    }

    fn get(&self, id: ConnectionId) -> Option<Connection> {
        // Clone out of the map: closing re-enters it through on_close.
        self.shared.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn send_to(&self, id: ConnectionId, payload: Bytes) -> Result<(), RegistryError> {
        let connection = self.get(id).ok_or(RegistryError::UnknownConnection(id))?;
        connection.send(payload)?;
        Ok(())
    }

    /// Close one connection. The resulting `ClientDisconnected` carries `reason`.
    pub fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.get(id) {
            Some(connection) => connection.close_with(reason),
            None => false,
        }
    }

    pub fn close_all(&self) {
        let connections: Vec<Connection> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Close everything and wait (bounded) for writers to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.close_all();
        self.shared.tasks.close();
        if tokio::time::timeout(grace, self.shared.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.shared.tasks.len(),
                "Connection tasks still running after grace period"
            );
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.shared.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.connections.is_empty()
    }
}
