//! Room Session
//!
//! Authoritative state of one race: who joined, their kinematic mirror,
//! finish times and the lifecycle phase.
//!
//! Everything here is synchronous and free of I/O. Callers are expected to
//! hold the room's lock for the duration of one call so every protocol step
//! is a single linearized read-modify-write.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::race::kinematics::{KinematicState, TAP_IMPULSE, SPEED_CAP, TRACK_START};

/// Maximum players in a single room.
pub const MAX_PLAYERS: usize = 4;

/// Players required before a race can start.
pub const MIN_PLAYERS_TO_START: usize = 2;

/// Room identifier, chosen by the client.
pub type RoomId = String;

/// Finish times keyed by connection.
pub type FinishTimes = BTreeMap<ConnectionId, f64>;

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Identifier of one client connection, stable for the connection's lifetime.
///
/// Implements Ord so room maps iterate in a stable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from a fixed value.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// PLAYER / PHASE / CONFIG
// =============================================================================

/// A player seated in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Connection owning this player.
    pub connection_id: ConnectionId,
    /// Name shown to other players. Never empty.
    pub display_name: String,
    /// Join-order slot, used for lane and colour.
    pub slot_number: u8,
}

/// Lifecycle phase of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    /// Players joining, race not started.
    Lobby,
    /// Race running, collecting taps and finish reports.
    Racing,
    /// Everyone present has finished.
    Finished,
    /// Room was collected from the registry. Never reopened.
    Closed,
}

/// Rules a room is created with.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Seats in the room.
    pub max_players: usize,
    /// Players needed to start.
    pub min_players_to_start: usize,
    /// Speed added per tap.
    pub tap_impulse: f64,
    /// Speed ceiling.
    pub speed_cap: f64,
    /// Start line position.
    pub track_start: f64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            min_players_to_start: MIN_PLAYERS_TO_START,
            tap_impulse: TAP_IMPULSE,
            speed_cap: SPEED_CAP,
            track_start: TRACK_START,
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of a player leaving.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    /// The removed player.
    pub player: Player,
    /// Set when the departure completed the race for everyone still present.
    pub race_results: Option<FinishTimes>,
    /// Room has no players left.
    pub now_empty: bool,
}

/// Result of a finish report.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    /// Time stored, others still racing.
    Recorded,
    /// Player already had a finish time. Nothing changed.
    Duplicate,
    /// Room is not racing. Report dropped.
    NotRacing,
    /// This report completed the race.
    RaceComplete(FinishTimes),
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RaceError {
    /// Malformed or empty input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Every seat is taken.
    #[error("Room is full")]
    RoomFull,

    /// Room or player no longer present.
    #[error("Room or player not found")]
    NotFound,
}

// =============================================================================
// ROOM
// =============================================================================

/// One race session.
#[derive(Debug)]
pub struct Room {
    /// Room identifier.
    pub id: RoomId,
    /// Rules for this room.
    pub config: RoomConfig,
    phase: RoomPhase,
    players: BTreeMap<ConnectionId, Player>,
    kinematics: BTreeMap<ConnectionId, KinematicState>,
    next_slot: u8,
    race_started_at: Option<DateTime<Utc>>,
    race_started_instant: Option<Instant>,
}

impl Room {
    /// Create an empty room in the lobby.
    pub fn new(id: RoomId, config: RoomConfig) -> Self {
        Self {
            id,
            config,
            phase: RoomPhase::Lobby,
            players: BTreeMap::new(),
            kinematics: BTreeMap::new(),
            next_slot: 1,
            race_started_at: None,
            race_started_instant: None,
        }
    }

    /// Seat a player.
    ///
    /// Slots come from a counter that only moves forward, so a slot is never
    /// handed to a second player while this room instance lives.
    pub fn join(&mut self, connection_id: ConnectionId, display_name: &str) -> Result<Player, RaceError> {
        if self.is_closed() {
            return Err(RaceError::NotFound);
        }

        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RaceError::InvalidInput("player name must not be empty".to_string()));
        }

        if self.players.contains_key(&connection_id) {
            return Err(RaceError::InvalidInput("already joined this room".to_string()));
        }

        if self.is_full() {
            return Err(RaceError::RoomFull);
        }

        let player = Player {
            connection_id,
            display_name: display_name.to_string(),
            slot_number: self.next_slot,
        };
        self.next_slot = self.next_slot.saturating_add(1);

        self.players.insert(connection_id, player.clone());
        self.kinematics.insert(connection_id, KinematicState::at_start(self.config.track_start));

        Ok(player)
    }

    /// Remove a player and their kinematics.
    ///
    /// Returns `None` when the connection was not in this room.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<LeaveOutcome> {
        let player = self.players.remove(connection_id)?;
        self.kinematics.remove(connection_id);

        // The finish denominator is the live player count
        let race_results = self.check_completion();

        Some(LeaveOutcome {
            player,
            race_results,
            now_empty: self.players.is_empty(),
        })
    }

    /// Start the race.
    ///
    /// Returns `false` (and changes nothing) unless the room is in the lobby
    /// with enough players.
    pub fn start(&mut self) -> bool {
        if self.phase != RoomPhase::Lobby || self.players.len() < self.config.min_players_to_start {
            return false;
        }

        self.phase = RoomPhase::Racing;
        self.race_started_at = Some(Utc::now());
        self.race_started_instant = Some(Instant::now());
        true
    }

    /// Apply a tap from a player. Returns the new speed.
    pub fn tap(&mut self, connection_id: &ConnectionId) -> Result<f64, RaceError> {
        let (impulse, cap) = (self.config.tap_impulse, self.config.speed_cap);
        let state = self.kinematics.get_mut(connection_id).ok_or(RaceError::NotFound)?;
        Ok(state.apply_tap(impulse, cap))
    }

    /// Mirror a client-reported position. Returns the mirrored position.
    pub fn sync_position(&mut self, connection_id: &ConnectionId, position: f64) -> Result<f64, RaceError> {
        if !position.is_finite() {
            return Err(RaceError::InvalidInput("position must be a finite number".to_string()));
        }
        let state = self.kinematics.get_mut(connection_id).ok_or(RaceError::NotFound)?;
        Ok(state.sync_position(position))
    }

    /// Record a client-asserted finish time.
    pub fn report_finish(&mut self, connection_id: &ConnectionId, finish_time: f64) -> Result<FinishOutcome, RaceError> {
        if !finish_time.is_finite() {
            return Err(RaceError::InvalidInput("finish time must be a finite number".to_string()));
        }

        let state = self.kinematics.get_mut(connection_id).ok_or(RaceError::NotFound)?;

        if self.phase != RoomPhase::Racing {
            return Ok(FinishOutcome::NotRacing);
        }

        if !state.record_finish(finish_time) {
            return Ok(FinishOutcome::Duplicate);
        }

        Ok(match self.check_completion() {
            Some(results) => FinishOutcome::RaceComplete(results),
            None => FinishOutcome::Recorded,
        })
    }

    /// Empty the room and return it to the lobby.
    ///
    /// Returns the connections that were seated before the reset.
    pub fn reset(&mut self) -> Vec<ConnectionId> {
        let former: Vec<ConnectionId> = self.players.keys().copied().collect();

        self.players.clear();
        self.kinematics.clear();
        self.next_slot = 1;
        self.race_started_at = None;
        self.race_started_instant = None;
        if self.phase != RoomPhase::Closed {
            self.phase = RoomPhase::Lobby;
        }

        former
    }

    /// Mark the room as collected.
    pub fn close(&mut self) {
        self.phase = RoomPhase::Closed;
    }

    /// `Racing -> Finished` once everyone present has a finish time.
    fn check_completion(&mut self) -> Option<FinishTimes> {
        if self.phase != RoomPhase::Racing || self.players.is_empty() {
            return None;
        }

        if !self.kinematics.values().all(KinematicState::has_finished) {
            return None;
        }

        self.phase = RoomPhase::Finished;
        Some(self.finish_times())
    }

    /// Recorded finish times.
    pub fn finish_times(&self) -> FinishTimes {
        self.kinematics
            .iter()
            .filter_map(|(id, k)| k.finish_time.map(|t| (*id, t)))
            .collect()
    }

    /// Current phase.
    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    /// Has the room been collected.
    pub fn is_closed(&self) -> bool {
        self.phase == RoomPhase::Closed
    }

    /// Player count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// No players seated.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Every seat taken.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.config.max_players
    }

    /// Is this connection seated here.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.players.contains_key(connection_id)
    }

    /// Get a player.
    pub fn get_player(&self, connection_id: &ConnectionId) -> Option<&Player> {
        self.players.get(connection_id)
    }

    /// Get a player's kinematics.
    pub fn get_kinematics(&self, connection_id: &ConnectionId) -> Option<&KinematicState> {
        self.kinematics.get(connection_id)
    }

    /// Seated players in connection order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Kinematics in connection order.
    pub fn kinematics(&self) -> impl Iterator<Item = (&ConnectionId, &KinematicState)> {
        self.kinematics.iter()
    }

    /// Connections seated in the room.
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.players.keys().copied().collect()
    }

    /// Wall-clock time the current race started.
    pub fn race_started_at(&self) -> Option<DateTime<Utc>> {
        self.race_started_at
    }

    /// Seconds since the race started, if racing or finished.
    pub fn race_elapsed_secs(&self) -> Option<f64> {
        self.race_started_instant.map(|t| t.elapsed().as_secs_f64())
    }

    #[cfg(test)]
    fn maps_consistent(&self) -> bool {
        self.players.len() <= self.config.max_players
            && self.players.keys().eq(self.kinematics.keys())
    }
}
