use crate::model::Song;

/// External, out-of-core collaborator: pure lookup over the song library.
/// The core never scans the filesystem itself (spec §6 "Library").
pub trait Library: Send + Sync {
    fn get_song(&self, id: &str) -> Option<Song>;
}

/// External, out-of-core collaborator: renders the holding-screen image
/// from a connect URL and optional "next up" info (spec §6 "Holding Screen
/// Generator"). A pure function over its arguments; failure is tolerated
/// (spec §4.4 "Suppressed if the collaborator is unavailable").
pub trait HoldingScreenGenerator: Send + Sync {
    fn generate(&self, connect_url: &str, next_up: Option<&str>) -> anyhow::Result<String>;
}

/// A `Library` that always misses. Useful as a safe default before the real
/// indexing/search collaborator is wired in.
pub struct NullLibrary;

impl Library for NullLibrary {
    fn get_song(&self, _id: &str) -> Option<Song> {
        None
    }
}

/// A `HoldingScreenGenerator` that always fails, exercising the "generator
/// unavailable" path without crashing the Coordinator.
pub struct NullHoldingScreenGenerator;

impl HoldingScreenGenerator for NullHoldingScreenGenerator {
    fn generate(&self, _connect_url: &str, _next_up: Option<&str>) -> anyhow::Result<String> {
        anyhow::bail!("holding screen generator not configured")
    }
}
