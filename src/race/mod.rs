//! Race Logic Module
//!
//! Room and race state. Synchronous, no I/O.
//!
//! ## Module Structure
//!
//! - `kinematics`: Per-player speed/position mirror and finish stamp
//! - `room`: Room session, join/leave/start/tap/finish/reset, lifecycle

pub mod kinematics;
pub mod room;

// Re-export key types
pub use kinematics::KinematicState;
pub use room::{
    ConnectionId, FinishOutcome, FinishTimes, LeaveOutcome, Player, RaceError, Room,
    RoomConfig, RoomId, RoomPhase,
};
