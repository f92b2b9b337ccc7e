//! Event Handler
//!
//! Routes each client event to the room it names and applies the matching
//! protocol step. Independent of the transport: a connection is just a
//! `ConnectionId` plus its outbound queue.
//!
//! Error policy:
//! - `InvalidInput` is answered with an `error` frame to the sender only.
//! - `RoomFull` is answered with `roomFull` to the sender only.
//! - `NotFound` (room or player already gone) is dropped silently.

use std::sync::Arc;
use tracing::debug;

use crate::network::dispatch::{deliver, Outbox};
use crate::network::protocol::{
    ClientMessage, ErrorCode, JoinRoomRequest, RoomStateInfo, ServerMessage,
};
use crate::network::session::RoomRegistry;
use crate::race::room::{ConnectionId, FinishOutcome, Player, RaceError, RoomId};

/// Applies client events to the room registry.
pub struct RaceService {
    registry: Arc<RoomRegistry>,
    default_room: RoomId,
}

impl RaceService {
    /// Create a service over `registry`; joins without a room id go to `default_room`.
    pub fn new(registry: Arc<RoomRegistry>, default_room: impl Into<RoomId>) -> Self {
        Self {
            registry,
            default_room: default_room.into(),
        }
    }

    /// Room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Resolve a client-supplied room id, falling back to the default.
    pub fn resolve_room_id(&self, requested: Option<&str>) -> RoomId {
        match requested.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.default_room.clone(),
        }
    }

    /// Handle one client event.
    pub async fn handle(&self, connection_id: ConnectionId, message: ClientMessage, outbox: &Outbox) {
        let result = match message {
            ClientMessage::JoinRoom(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                match self.join(connection_id, &req, outbox).await {
                    Err(RaceError::RoomFull) => {
                        deliver(outbox, ServerMessage::RoomFull { room_id });
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            ClientMessage::StartGame(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                self.start(connection_id, &room_id).await;
                Ok(())
            }
            ClientMessage::PlayerAction(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                self.tap(connection_id, &room_id).await.map(|_| ())
            }
            ClientMessage::SyncPosition(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                self.sync_position(connection_id, &room_id, req.position).await.map(|_| ())
            }
            ClientMessage::CheckFinish(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                self.finish(connection_id, &room_id, req.finish_time).await.map(|_| ())
            }
            ClientMessage::ResetRoom(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                self.reset(&room_id).await;
                Ok(())
            }
            ClientMessage::GetRoom(req) => {
                let room_id = self.resolve_room_id(req.room_id.as_deref());
                match self.room_state(&room_id).await {
                    Some(info) => {
                        deliver(outbox, ServerMessage::RoomState(info));
                        Ok(())
                    }
                    None => Err(RaceError::NotFound),
                }
            }
            ClientMessage::Ping { timestamp } => {
                deliver(outbox, ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis(),
                });
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(RaceError::InvalidInput(reason)) => {
                debug!("Rejected event from {}: {}", connection_id.short(), reason);
                deliver(outbox, ServerMessage::error(ErrorCode::InvalidInput, reason));
            }
            Err(RaceError::RoomFull) => {}
            Err(RaceError::NotFound) => {
                debug!("Dropped event from {} for a room or player that is gone", connection_id.short());
            }
        }
    }

    /// Join protocol.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        req: &JoinRoomRequest,
        outbox: &Outbox,
    ) -> Result<Player, RaceError> {
        // Validate before touching the registry so a bad request never creates a room
        if req.player_name.trim().is_empty() {
            return Err(RaceError::InvalidInput("player name must not be empty".to_string()));
        }

        let room_id = self.resolve_room_id(req.room_id.as_deref());

        loop {
            let session = self.registry.get_or_create(&room_id).await;
            let mut guard = session.write().await;

            // Collected between lookup and lock: retry against the fresh instance
            if guard.room().is_closed() {
                continue;
            }

            let result = guard.join(connection_id, &req.player_name, outbox.clone());
            if result.is_ok() {
                self.registry.record_membership(connection_id, &room_id).await;
            }
            let empty = guard.room().is_empty();
            drop(guard);

            if empty {
                self.registry.collect_if_empty(&room_id, &session).await;
            }
            return result;
        }
    }

    /// Start protocol. Returns `true` if the race started.
    pub async fn start(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        match self.registry.get(room_id).await {
            Some(session) => session.write().await.start(&connection_id),
            None => false,
        }
    }

    /// Tap protocol. Returns the new speed.
    pub async fn tap(&self, connection_id: ConnectionId, room_id: &str) -> Result<f64, RaceError> {
        let session = self.registry.get(room_id).await.ok_or(RaceError::NotFound)?;
        let mut guard = session.write().await;
        guard.tap(&connection_id)
    }

    /// Position sync. Returns the mirrored position.
    pub async fn sync_position(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        position: f64,
    ) -> Result<f64, RaceError> {
        let session = self.registry.get(room_id).await.ok_or(RaceError::NotFound)?;
        let mut guard = session.write().await;
        guard.sync_position(&connection_id, position)
    }

    /// Finish protocol.
    pub async fn finish(
        &self,
        connection_id: ConnectionId,
        room_id: &str,
        finish_time: f64,
    ) -> Result<FinishOutcome, RaceError> {
        let session = self.registry.get(room_id).await.ok_or(RaceError::NotFound)?;
        let mut guard = session.write().await;
        guard.report_finish(&connection_id, finish_time)
    }

    /// Reset protocol. Returns `false` when the room did not exist.
    pub async fn reset(&self, room_id: &str) -> bool {
        self.registry.remove(room_id).await.is_some()
    }

    /// Current state of a room.
    pub async fn room_state(&self, room_id: &str) -> Option<RoomStateInfo> {
        let session = self.registry.get(room_id).await?;
        let guard = session.read().await;
        Some(guard.state_info())
    }

    /// Leave protocol, run on connection teardown.
    ///
    /// Removes the connection from every room it joined and collects rooms
    /// left empty. Only those rooms are locked. Returns how many rooms it left.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> usize {
        let mut left = 0;

        for room_id in self.registry.take_memberships(&connection_id).await {
            // Reset or collected since the join
            let Some(session) = self.registry.get(&room_id).await else {
                continue;
            };

            let now_empty = {
                let mut guard = session.write().await;
                match guard.leave(&connection_id) {
                    Some(outcome) => outcome.now_empty,
                    None => continue,
                }
            };
            left += 1;

            if now_empty {
                self.registry.collect_if_empty(&room_id, &session).await;
            }
        }

        left
    }
}
