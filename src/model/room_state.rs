use super::session::Session;
use super::song::Song;
use super::{CountdownState, PlayerState, QueueSnapshot};
use serde::Serialize;

/// The derived snapshot broadcast by the Hub (spec §3 RoomState). Built once
/// per broadcast under the canonical lock order (Queue, Session,
/// Coordinator; spec §5) and then fanned out to every connection.
#[derive(Clone, Debug, Serialize)]
pub struct RoomState {
    pub player: PlayerState,
    pub current_song: Option<Song>,
    pub queue: QueueSnapshot,
    pub sessions: Vec<Session>,
    pub countdown: CountdownState,
}
