//! Player Kinematics
//!
//! Per-player movement mirror kept by the server.
//!
//! The server never integrates movement itself: clients run their own
//! per-tick simulation and the server only accumulates discrete tap impulses,
//! mirrors the last position a client reported, and stamps finish times.

use serde::{Serialize, Deserialize};

/// Speed added by a single tap.
pub const TAP_IMPULSE: f64 = 2.0;

/// Maximum speed a player can reach through taps.
pub const SPEED_CAP: f64 = 15.0;

/// Position every player starts the race at.
pub const TRACK_START: f64 = 0.0;

/// Movement state of one player in one room.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KinematicState {
    /// Distance along the track. Never below the track start, never decreases.
    pub position: f64,
    /// Current speed. Always `>= 0`.
    pub speed: f64,
    /// Client-reported finish time, set at most once per race.
    pub finish_time: Option<f64>,
}

impl KinematicState {
    /// Fresh state for a player standing on the start line.
    pub fn at_start(track_start: f64) -> Self {
        Self {
            position: track_start,
            speed: 0.0,
            finish_time: None,
        }
    }

    /// Apply one tap impulse, saturating at `cap`.
    ///
    /// Returns the new speed.
    pub fn apply_tap(&mut self, impulse: f64, cap: f64) -> f64 {
        self.speed = (self.speed + impulse).min(cap).max(0.0);
        self.speed
    }

    /// Mirror a client-reported position.
    ///
    /// The mirror only moves forward: a stale report behind the current
    /// value is absorbed without moving the player back.
    pub fn sync_position(&mut self, reported: f64) -> f64 {
        if reported > self.position {
            self.position = reported;
        }
        self.position
    }

    /// Record the finish time if none is recorded yet.
    ///
    /// Returns `true` when this call stamped the time, `false` for a duplicate.
    pub fn record_finish(&mut self, time: f64) -> bool {
        if self.finish_time.is_some() {
            return false;
        }
        self.finish_time = Some(time);
        true
    }

    /// Has this player crossed the line.
    #[inline]
    pub fn has_finished(&self) -> bool {
        self.finish_time.is_some()
    }
}

impl Default for KinematicState {
    fn default() -> Self {
        Self::at_start(TRACK_START)
    }
}
