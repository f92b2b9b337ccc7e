//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object tagged by `type`; names are camelCase so the
//! browser client can use them without translation.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::race::room::{ConnectionId, FinishTimes, Room, RoomId, RoomPhase};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
///
/// Every event acts on the sending connection. Extra fields some clients send
/// (`playerId`, `playerNum`) are accepted and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join (and lazily create) a room.
    JoinRoom(JoinRoomRequest),

    /// Start the race in a room.
    StartGame(RoomRequest),

    /// One tap.
    PlayerAction(RoomRequest),

    /// Mirror the client's locally simulated position.
    SyncPosition(SyncPositionRequest),

    /// Client crossed the finish line.
    CheckFinish(CheckFinishRequest),

    /// Empty the room and return it to the lobby.
    ResetRoom(RoomRequest),

    /// Ask for the room's current state.
    GetRoom(RoomRequest),

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    /// Room to join. Absent or empty means the server's default room.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    /// Display name.
    pub player_name: String,
}

/// Request addressed to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    /// Target room. Absent or empty means the server's default room.
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

/// Position mirror update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPositionRequest {
    /// Target room. Absent or empty means the server's default room.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    /// Client-side position along the track.
    pub position: f64,
}

/// Finish report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFinishRequest {
    /// Target room. Absent or empty means the server's default room.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    /// Client-measured race time in seconds.
    pub finish_time: f64,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join accepted (unicast).
    JoinedRoom(JoinedRoomInfo),

    /// Join refused, room has no free seat (unicast).
    #[serde(rename_all = "camelCase")]
    RoomFull { room_id: RoomId },

    /// A player joined (room-cast).
    PlayerJoined(RoomSnapshot),

    /// Race started (room-cast).
    GameStarted,

    /// Speeds or positions changed (room-cast).
    UpdateState(RoomSnapshot),

    /// Everyone present finished (room-cast, once per race).
    EndRace(RaceResults),

    /// A player disconnected (room-cast).
    PlayerLeft(RoomSnapshot),

    /// Room was reset (sent to the members seated before the reset).
    RoomReset(RoomSnapshot),

    /// Room state on request (unicast).
    RoomState(RoomStateInfo),

    /// Pong response.
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: u64, server_time: i64 },

    /// Error message (unicast).
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Join confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoomInfo {
    /// Room actually joined (resolves the default).
    pub room_id: RoomId,
    /// The joining connection's id, the key used in every snapshot map.
    pub connection_id: ConnectionId,
    /// Assigned slot.
    pub slot_number: u8,
}

/// Player entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    /// Display name.
    pub name: String,
    /// Slot number.
    pub player_num: u8,
}

/// Full room snapshot: four independent maps keyed by connection id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    /// Seated players.
    pub players: BTreeMap<ConnectionId, PlayerInfo>,
    /// Mirrored positions.
    pub positions: BTreeMap<ConnectionId, f64>,
    /// Current speeds.
    pub speeds: BTreeMap<ConnectionId, f64>,
    /// Recorded finish times.
    pub finish_times: BTreeMap<ConnectionId, f64>,
}

impl RoomSnapshot {
    /// Build a snapshot from room state.
    pub fn from_room(room: &Room) -> Self {
        let mut snapshot = Self::default();

        for player in room.players() {
            snapshot.players.insert(player.connection_id, PlayerInfo {
                name: player.display_name.clone(),
                player_num: player.slot_number,
            });
        }

        for (id, k) in room.kinematics() {
            snapshot.positions.insert(*id, k.position);
            snapshot.speeds.insert(*id, k.speed);
            if let Some(t) = k.finish_time {
                snapshot.finish_times.insert(*id, t);
            }
        }

        snapshot
    }
}

/// Race results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceResults {
    /// Finish time of every player present at completion.
    pub finish_times: FinishTimes,
}

/// Room state reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateInfo {
    /// Room identifier.
    pub room_id: RoomId,
    /// Lifecycle phase.
    pub phase: RoomPhase,
    /// Current snapshot.
    pub snapshot: RoomSnapshot,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid input.
    InvalidInput,
    /// Connection limit reached.
    ServerOverloaded,
}

impl ServerMessage {
    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
