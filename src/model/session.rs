use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-chosen opaque identity string (16+ bytes recommended). Stable
/// across reconnects and device restarts; the server never mints keys
/// (spec §3, Design Notes "Identity model").
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantKey(pub String);

impl ParticipantKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub friendly_name: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub key: ParticipantKey,
    pub display_name: String,
    /// Opaque avatar blob, base64-encoded for wire/storage transport.
    pub avatar: Option<String>,
    pub is_admin: bool,
    pub is_afk: bool,
    pub name_locked: bool,
    pub is_online: bool,
    pub last_seen: u64,
    pub device: DeviceInfo,
    /// Non-goal note (blocked users stay listed-with-flag per Design Notes);
    /// derived at read time from the block list, not stored on the session
    /// itself, but surfaced here for client-list fan-out convenience.
    #[serde(default)]
    pub is_blocked: bool,
}

impl Session {
    pub fn new(key: ParticipantKey, display_name: String, now: u64) -> Self {
        Self {
            key,
            display_name,
            avatar: None,
            is_admin: false,
            is_afk: false,
            name_locked: false,
            is_online: false,
            last_seen: now,
            device: DeviceInfo::default(),
            is_blocked: false,
        }
    }
}

/// A record in the block list (spec §3 BlockRecord). `until = None` means
/// permanent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub key: ParticipantKey,
    pub reason: String,
    pub until: Option<u64>,
}

impl BlockRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.until, Some(until) if until <= now)
    }
}
