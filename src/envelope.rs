use crate::error::AppError;
use crate::model::{RoomState, Session, Song, VocalAssist};
use serde::{Deserialize, Serialize};

/// Every inbound message is `{ "type": ..., "payload": ... }` (spec §4.5
/// "Message envelope", §6). `serde`'s adjacently-tagged representation maps
/// directly onto that wire shape; unit variants simply omit `payload`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    Handshake {
        key: String,
        #[serde(default)]
        proposed_name: String,
    },
    Search {
        query: String,
    },
    QueueAdd {
        song_id: String,
        #[serde(default)]
        vocal_assist: VocalAssist,
    },
    QueueRemove {
        song_id: String,
    },
    QueueMove {
        from: usize,
        to: usize,
    },
    QueueClear,
    QueueShuffle,
    QueueRequeue {
        song_id: String,
        /// Who the requeued entry is attributed to. Absent means "requeue to
        /// myself"; an admin may set this to a different participant's key
        /// (spec §4.2 `requeue(songId, newAddedBy)`).
        #[serde(default)]
        new_added_by: Option<String>,
    },
    Play,
    Pause,
    Skip,
    Seek {
        seconds: f64,
    },
    SetVocalAssist {
        vocal_assist: VocalAssist,
    },
    SetVolume {
        volume: u8,
    },
    SetDisplayName {
        name: String,
    },
    SetAutoplay {
        on: bool,
    },
    SetAfk {
        afk: bool,
    },
    AdminSetAdmin {
        key: String,
        is_admin: bool,
    },
    AdminKick {
        key: String,
    },
    AdminBlock {
        key: String,
        #[serde(default)]
        duration_secs: u64,
        reason: String,
    },
    AdminUnblock {
        key: String,
    },
    AdminSetAfk {
        key: String,
        afk: bool,
    },
    AdminPlayNext,
    AdminStop,
    AdminSetName {
        key: String,
        name: String,
    },
    AdminSetNameLock {
        key: String,
        locked: bool,
    },
}

impl InboundMessage {
    /// Whether this tag is admin-only (spec §4.5 "Admin gating"). Checked by
    /// the Hub before dispatch; never by the message type itself.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            InboundMessage::AdminSetAdmin { .. }
                | InboundMessage::AdminKick { .. }
                | InboundMessage::AdminBlock { .. }
                | InboundMessage::AdminUnblock { .. }
                | InboundMessage::AdminSetAfk { .. }
                | InboundMessage::AdminPlayNext
                | InboundMessage::AdminStop
                | InboundMessage::AdminSetName { .. }
                | InboundMessage::AdminSetNameLock { .. }
        )
    }
}

/// Outbound counterpart (spec §4.5 "Message envelope", outbound tags).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    Welcome {
        session: Session,
        state: RoomState,
    },
    StateUpdate(RoomState),
    ClientList {
        sessions: Vec<Session>,
    },
    SearchResult {
        song: Option<Song>,
    },
    Kicked {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error { message: message.into() }
    }
}

/// Per spec §10.2: any `AppError` turns into an `error { message }` envelope
/// without closing the connection.
impl From<AppError> for OutboundMessage {
    fn from(err: AppError) -> Self {
        OutboundMessage::error(err.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips_from_wire_shape() {
        let json = r#"{"type":"handshake","payload":{"key":"abc123","proposed_name":"A"}}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        match msg {
            InboundMessage::Handshake { key, proposed_name } => {
                assert_eq!(key, "abc123");
                assert_eq!(proposed_name, "A");
            }
            _ => panic!("expected handshake"),
        }
    }

    #[test]
    fn unit_variants_tolerate_missing_payload() {
        let json = r#"{"type":"skip"}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, InboundMessage::Skip));
    }

    #[test]
    fn admin_tags_are_flagged() {
        let admin = InboundMessage::AdminStop;
        let user = InboundMessage::Skip;
        assert!(admin.requires_admin());
        assert!(!user.requires_admin());
    }

    #[test]
    fn error_serializes_with_adjacent_tag() {
        let msg = OutboundMessage::error("nope");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"nope""#));
    }
}
