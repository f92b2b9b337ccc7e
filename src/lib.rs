//! # Tap Race Server
//!
//! Authoritative room and race sessions for the Tap Race minigame: up to four
//! browser clients join a named room, tap to accelerate, and the server
//! decides the finishing order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TAP RACE SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  race/             - Room state (synchronous, no I/O)        │
//! │  ├── kinematics.rs - Speed/position mirror, finish stamp     │
//! │  └── room.rs       - Join/leave/start/tap/finish/reset       │
//! │                                                              │
//! │  network/          - Networking (async)                      │
//! │  ├── protocol.rs   - Message types                           │
//! │  ├── dispatch.rs   - Per-room broadcast fan-out              │
//! │  ├── session.rs    - Room sessions and registry              │
//! │  ├── handler.rs    - Event routing                           │
//! │  └── server.rs     - WebSocket server                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! - Every mutation of a room happens under that room's lock, so events on
//!   one room are linearized while different rooms proceed in parallel.
//! - Movement is simulated by the clients. The server accumulates taps,
//!   mirrors reported positions and records client-asserted finish times.
//! - `endRace` is sent exactly once per race, when everyone still in the
//!   room has finished.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod race;
pub mod network;

// Re-export commonly used types
pub use race::kinematics::{TAP_IMPULSE, SPEED_CAP, TRACK_START};
pub use race::room::{MAX_PLAYERS, MIN_PLAYERS_TO_START};
pub use race::{ConnectionId, Room, RoomConfig, RoomPhase, RaceError};
pub use network::{GameServer, ServerConfig, RaceService, RoomRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Room joined when a client names none.
pub const DEFAULT_ROOM_ID: &str = "default";
