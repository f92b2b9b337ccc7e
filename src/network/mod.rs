//! Network Layer
//!
//! WebSocket server, wire protocol, room registry and event routing.
//! All room mutations go through `race/`; this layer only locks, routes and
//! delivers.

pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod server;

pub use dispatch::{Dispatcher, Outbox};
pub use handler::RaceService;
pub use protocol::{
    ClientMessage, ServerMessage, RoomSnapshot, RaceResults, ErrorCode,
};
pub use session::{RoomSession, RoomRegistry, SessionHandle};
pub use server::{GameServer, ServerConfig, GameServerError};
