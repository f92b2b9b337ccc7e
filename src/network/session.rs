//! Room Session Management
//!
//! Binds each room's authoritative state to its members' outbound queues and
//! keeps the process-wide registry of live rooms.
//!
//! Lock order is always registry first, then room, then the membership
//! index. No code path takes the registry lock while holding a room lock,
//! and the membership index is never held across another lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::network::dispatch::{deliver, Dispatcher, Outbox};
use crate::network::protocol::{
    JoinedRoomInfo, RaceResults, RoomSnapshot, RoomStateInfo, ServerMessage,
};
use crate::race::room::{
    ConnectionId, FinishOutcome, LeaveOutcome, Player, RaceError, Room, RoomConfig, RoomId,
};

/// Shared handle to a room session.
pub type SessionHandle = Arc<RwLock<RoomSession>>;

/// A room plus the channels of everyone seated in it.
///
/// Each method is one protocol step: mutate the room, then notify members.
#[derive(Debug)]
pub struct RoomSession {
    room: Room,
    dispatcher: Dispatcher,
}

impl RoomSession {
    /// Create a session around an empty room.
    pub fn new(id: RoomId, config: RoomConfig) -> Self {
        Self {
            room: Room::new(id, config),
            dispatcher: Dispatcher::new(),
        }
    }

    /// Room state.
    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot::from_room(&self.room)
    }

    /// Seat a player, confirm to them, then tell the room.
    pub fn join(
        &mut self,
        connection_id: ConnectionId,
        display_name: &str,
        outbox: Outbox,
    ) -> Result<Player, RaceError> {
        let player = self.room.join(connection_id, display_name)?;

        deliver(&outbox, ServerMessage::JoinedRoom(JoinedRoomInfo {
            room_id: self.room.id.clone(),
            connection_id,
            slot_number: player.slot_number,
        }));

        self.dispatcher.add(connection_id, outbox);
        self.dispatcher.broadcast(&ServerMessage::PlayerJoined(self.snapshot()));

        info!(
            "Player {} '{}' joined room {} in slot {}",
            connection_id.short(), player.display_name, self.room.id, player.slot_number
        );
        Ok(player)
    }

    /// Remove a connection and tell whoever is left.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<LeaveOutcome> {
        let outcome = self.room.leave(connection_id)?;
        self.dispatcher.remove(connection_id);

        self.dispatcher.broadcast(&ServerMessage::PlayerLeft(self.snapshot()));

        if let Some(results) = &outcome.race_results {
            info!("Race in room {} finished after a departure", self.room.id);
            self.dispatcher.broadcast(&ServerMessage::EndRace(RaceResults {
                finish_times: results.clone(),
            }));
        }

        debug!("Player {} left room {}", connection_id.short(), self.room.id);
        Some(outcome)
    }

    /// Start the race if the room allows it.
    pub fn start(&mut self, requested_by: &ConnectionId) -> bool {
        if !self.room.start() {
            debug!(
                "Start of room {} by {} ignored ({:?}, {} players)",
                self.room.id, requested_by.short(), self.room.phase(), self.room.player_count()
            );
            return false;
        }

        self.dispatcher.broadcast(&ServerMessage::GameStarted);
        info!(
            "Race started in room {} with {} players",
            self.room.id, self.room.player_count()
        );
        true
    }

    /// Apply a tap and send the new kinematics to the room.
    pub fn tap(&mut self, connection_id: &ConnectionId) -> Result<f64, RaceError> {
        let speed = self.room.tap(connection_id)?;
        self.dispatcher.broadcast(&ServerMessage::UpdateState(self.snapshot()));
        Ok(speed)
    }

    /// Mirror a client position and send the new kinematics to the room.
    pub fn sync_position(&mut self, connection_id: &ConnectionId, position: f64) -> Result<f64, RaceError> {
        let position = self.room.sync_position(connection_id, position)?;
        self.dispatcher.broadcast(&ServerMessage::UpdateState(self.snapshot()));
        Ok(position)
    }

    /// Record a finish report; announce the results when the race completes.
    pub fn report_finish(
        &mut self,
        connection_id: &ConnectionId,
        finish_time: f64,
    ) -> Result<FinishOutcome, RaceError> {
        let outcome = self.room.report_finish(connection_id, finish_time)?;

        if let FinishOutcome::RaceComplete(results) = &outcome {
            info!(
                "Race in room {} finished ({} finishers, {:.1}s server-side)",
                self.room.id,
                results.len(),
                self.room.race_elapsed_secs().unwrap_or_default()
            );
            self.dispatcher.broadcast(&ServerMessage::EndRace(RaceResults {
                finish_times: results.clone(),
            }));
        }

        Ok(outcome)
    }

    /// Empty the room and send the empty snapshot to the former members.
    pub fn reset(&mut self) -> Vec<ConnectionId> {
        let former = self.room.reset();
        self.dispatcher.broadcast(&ServerMessage::RoomReset(self.snapshot()));
        self.dispatcher.clear();
        former
    }

    /// Reply with the room state.
    pub fn state_info(&self) -> RoomStateInfo {
        RoomStateInfo {
            room_id: self.room.id.clone(),
            phase: self.room.phase(),
            snapshot: self.snapshot(),
        }
    }
}

// =============================================================================
// ROOM REGISTRY
// =============================================================================

/// Process-wide map of live rooms.
pub struct RoomRegistry {
    /// Live rooms.
    rooms: RwLock<BTreeMap<RoomId, SessionHandle>>,
    /// Rooms each connection has joined. May hold stale ids, never misses one.
    memberships: RwLock<BTreeMap<ConnectionId, BTreeSet<RoomId>>>,
    /// Rules stamped on every room created here.
    config: RoomConfig,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            memberships: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    /// Return the room under `id`, creating it in the lobby if absent.
    ///
    /// Concurrent callers for the same id all get the same instance.
    pub async fn get_or_create(&self, id: &str) -> SessionHandle {
        if let Some(session) = self.rooms.read().await.get(id) {
            return session.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Another caller may have won the race between the two locks
        if let Some(session) = rooms.get(id) {
            return session.clone();
        }

        let session = Arc::new(RwLock::new(RoomSession::new(id.to_string(), self.config.clone())));
        rooms.insert(id.to_string(), session.clone());
        info!("Room {} created", id);
        session
    }

    /// Get a room by id.
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Delete a room.
    ///
    /// Members still seated get the empty snapshot. The instance is closed so
    /// anyone still holding it sees it is gone. No-op when absent.
    pub async fn remove(&self, id: &str) -> Option<Vec<ConnectionId>> {
        let mut rooms = self.rooms.write().await;
        let session = rooms.remove(id)?;

        let mut session = session.write().await;
        let former = session.reset();
        session.room.close();
        self.forget_memberships(id, &former).await;

        info!("Room {} removed ({} members dropped)", id, former.len());
        Some(former)
    }

    /// Collect `session` if it is still registered under `id` and has nobody in it.
    ///
    /// Returns `true` when the room was collected.
    pub async fn collect_if_empty(&self, id: &str, session: &SessionHandle) -> bool {
        let mut rooms = self.rooms.write().await;

        match rooms.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }

        let mut guard = session.write().await;
        if !guard.room.is_empty() {
            return false;
        }

        guard.room.close();
        rooms.remove(id);
        info!("Room {} collected (empty)", id);
        true
    }

    /// Note that `connection_id` sits in room `id`.
    ///
    /// Call while holding that room's lock so the index and the room agree.
    pub async fn record_membership(&self, connection_id: ConnectionId, id: &str) {
        self.memberships
            .write()
            .await
            .entry(connection_id)
            .or_default()
            .insert(id.to_string());
    }

    /// Drop room `id` from the index entries of `members`.
    async fn forget_memberships(&self, id: &str, members: &[ConnectionId]) {
        let mut memberships = self.memberships.write().await;
        for member in members {
            if let Some(rooms) = memberships.get_mut(member) {
                rooms.remove(id);
                if rooms.is_empty() {
                    memberships.remove(member);
                }
            }
        }
    }

    /// Remove and return every room id recorded for `connection_id`.
    pub async fn take_memberships(&self, connection_id: &ConnectionId) -> BTreeSet<RoomId> {
        self.memberships
            .write()
            .await
            .remove(connection_id)
            .unwrap_or_default()
    }

    /// Room ids recorded for `connection_id`.
    pub async fn memberships_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .read()
            .await
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of every live room.
    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}
