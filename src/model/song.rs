use super::session::ParticipantKey;
use serde::{Deserialize, Serialize};

/// How a queue entry's media should be rendered by the Media Adapter
/// (spec §3 Song.mediaRef).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaRef {
    FileRef { path: String },
    StemsRef { instrumental: String, vocal: String },
    CdgRef { cdg: String, audio: String },
    UrlRef { url: String },
}

/// Vocal-assist level; maps to a vocal mix gain in the Media Adapter
/// (spec §4.3 "Vocal gain mapping").
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VocalAssist {
    Off,
    Low,
    Med,
    High,
}

impl Default for VocalAssist {
    fn default() -> Self {
        VocalAssist::Off
    }
}

impl VocalAssist {
    /// OFF -> 0.0; LOW -> ~0.25; MED -> ~0.55; HIGH -> ~0.85.
    pub fn gain(self) -> f32 {
        match self {
            VocalAssist::Off => 0.0,
            VocalAssist::Low => 0.25,
            VocalAssist::Med => 0.55,
            VocalAssist::High => 0.85,
        }
    }
}

/// One entry in the queue. `id` is unique per entry, not per media item: a
/// requeued history entry mints a fresh id (spec §3 Song).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Song {
    pub id: String,
    pub media_ref: MediaRef,
    pub title: String,
    pub artist: String,
    pub duration_sec: f64,
    pub thumbnail: Option<String>,
    pub vocal_assist: VocalAssist,
    pub added_by: ParticipantKey,
    pub added_at: u64,
}
