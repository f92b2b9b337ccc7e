//! Broadcast Dispatcher
//!
//! Fan-out of server messages to the members of one room.
//!
//! Delivery is fire-and-forget: messages go into each member's bounded
//! outbound queue with `try_send`, so a broadcast never waits while the room
//! lock is held. A full or closed queue drops that message for that member
//! only.

use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::network::protocol::ServerMessage;
use crate::race::room::ConnectionId;

/// Outbound queue of one connection.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Push a message to one connection without waiting.
///
/// Returns `true` if the message was queued.
pub fn deliver(outbox: &Outbox, message: ServerMessage) -> bool {
    match outbox.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Outbound queue closed, dropping message");
            false
        }
    }
}

/// Outbound channels of a room's members.
#[derive(Debug, Default)]
pub struct Dispatcher {
    members: BTreeMap<ConnectionId, Outbox>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member's outbound queue.
    pub fn add(&mut self, connection_id: ConnectionId, outbox: Outbox) {
        self.members.insert(connection_id, outbox);
    }

    /// Unregister a member.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<Outbox> {
        self.members.remove(connection_id)
    }

    /// Drop every member.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Number of registered members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// No members registered.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send to every member. Returns how many queues accepted the message.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        self.members
            .values()
            .filter(|outbox| deliver(outbox, message.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let mut dispatcher = Dispatcher::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        dispatcher.add(ConnectionId::from_u128(1), tx1);
        dispatcher.add(ConnectionId::from_u128(2), tx2);

        assert_eq!(dispatcher.broadcast(&ServerMessage::GameStarted), 2);
        assert!(matches!(rx1.recv().await, Some(ServerMessage::GameStarted)));
        assert!(matches!(rx2.recv().await, Some(ServerMessage::GameStarted)));
    }

    #[tokio::test]
    async fn test_removed_member_gets_nothing() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = ConnectionId::from_u128(1);
        dispatcher.add(id, tx);
        dispatcher.remove(&id);

        assert_eq!(dispatcher.broadcast(&ServerMessage::GameStarted), 0);
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let mut dispatcher = Dispatcher::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        dispatcher.add(ConnectionId::from_u128(1), slow_tx);
        dispatcher.add(ConnectionId::from_u128(2), fast_tx);

        assert_eq!(dispatcher.broadcast(&ServerMessage::GameStarted), 2);
        // Slow member's single slot is taken now
        assert_eq!(dispatcher.broadcast(&ServerMessage::GameStarted), 1);

        assert!(fast_rx.recv().await.is_some());
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_queue_reports_failure() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!deliver(&tx, ServerMessage::GameStarted));
    }
}
