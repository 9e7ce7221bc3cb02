mod room_state;
mod session;
mod song;

pub use room_state::RoomState;
pub use session::{BlockRecord, DeviceInfo, ParticipantKey, Session};
pub use song::{MediaRef, Song, VocalAssist};

use serde::{Deserialize, Serialize};

/// Observed state of the external media player (spec §3 PlayerState).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub is_playing: bool,
    pub position_sec: f64,
    pub duration_sec: f64,
    pub volume: u8,
    pub bgm_active: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            is_playing: false,
            position_sec: 0.0,
            duration_sec: 0.0,
            volume: 100,
            bgm_active: false,
        }
    }
}

/// Snapshot of the ordered queue plus cursor, as handed out by the Queue
/// Engine to callers that need a consistent read (spec §3 QueueState).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct QueueSnapshot {
    pub songs: Vec<Song>,
    pub position: usize,
    pub autoplay: bool,
    pub fair_rotation: bool,
}

impl QueueSnapshot {
    pub fn current(&self) -> Option<&Song> {
        self.songs.get(self.position)
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty() || self.position >= self.songs.len()
    }
}

/// At most one of these is ever active (spec §3 CountdownState, invariant 2).
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct CountdownState {
    pub active: bool,
    pub seconds_remaining: u32,
    pub next_song_id: Option<String>,
    pub next_singer_key: Option<ParticipantKey>,
    pub requires_approval: bool,
}

/// Epoch seconds; used throughout the data model instead of a formatting
/// crate, since nothing here needs to render a calendar date.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
