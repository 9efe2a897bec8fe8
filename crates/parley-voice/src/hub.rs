//! Connection hub — who is connected right now, and how to reach them.
//!
//! Every live voice connection owns one unbounded FIFO queue drained by its
//! socket writer. Because each connection's inbound signals are handled one
//! at a time, anything participant A sends to participant B lands in B's
//! queue in A's send order. That is the only ordering guarantee the relay
//! needs (ICE candidates after their offer/answer).
//!
//! A participant has at most one live connection. A newer connection replaces
//! the older one; the older one's cleanup must then not tear down voice state
//! that now belongs to the newer one, hence the session id check in
//! [`ConnectionHub::unregister`].

use parley_common::signal::ServerSignal;
use parley_common::{ParleyError, ParleyResult, ParticipantId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Outbound queue of one connection.
pub type SignalSender = mpsc::UnboundedSender<ServerSignal>;

struct Connection {
    session_id: String,
    tx: SignalSender,
}

/// Tracks the live connection of every identified participant.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<ParticipantId, Connection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the session id it replaced, if any.
    pub async fn register(
        &self,
        participant: ParticipantId,
        session_id: String,
        tx: SignalSender,
    ) -> Option<String> {
        self.connections
            .write()
            .await
            .insert(participant, Connection { session_id, tx })
            .map(|old| old.session_id)
    }

    /// Remove a connection, but only if `session_id` is still the current one.
    ///
    /// Returns `true` when the participant is now disconnected.
    pub async fn unregister(&self, participant: &ParticipantId, session_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(participant) {
            Some(conn) if conn.session_id == session_id => {
                connections.remove(participant);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.connections
            .read()
            .await
            .get(participant)
            .is_some_and(|conn| !conn.tx.is_closed())
    }

    /// Whether `session_id` is still the live connection of `participant`.
    pub async fn is_current(&self, participant: &ParticipantId, session_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(participant)
            .is_some_and(|conn| conn.session_id == session_id)
    }

    /// Queue a signal for one participant.
    pub async fn send(&self, participant: &ParticipantId, signal: ServerSignal) -> ParleyResult<()> {
        let connections = self.connections.read().await;
        let sent = connections
            .get(participant)
            .is_some_and(|conn| conn.tx.send(signal).is_ok());

        if sent {
            Ok(())
        } else {
            Err(ParleyError::NotConnected {
                participant: participant.clone(),
            })
        }
    }

    /// Queue a signal for every participant in `targets`. Best effort:
    /// participants that went away are skipped.
    pub async fn send_many<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ParticipantId>,
        signal: &ServerSignal,
    ) -> usize {
        let connections = self.connections.read().await;
        targets
            .into_iter()
            .filter_map(|p| connections.get(p))
            .filter(|conn| conn.tx.send(signal.clone()).is_ok())
            .count()
    }

    /// Get total connected participant count.
    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
