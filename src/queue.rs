use crate::model::{now_secs, ParticipantKey, QueueSnapshot, Song};
use crate::storage::{log_persistence_err, Storage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

struct QueueInner {
    songs: Vec<Song>,
    position: usize,
    autoplay: bool,
    fair_rotation: bool,
}

impl QueueInner {
    fn clamp_position(&mut self) {
        if self.position > self.songs.len() {
            self.position = if self.songs.is_empty() {
                0
            } else {
                self.songs.len() - 1
            };
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            songs: self.songs.clone(),
            position: self.position,
            autoplay: self.autoplay,
            fair_rotation: self.fair_rotation,
        }
    }
}

/// Treats the upcoming slice as a round-robin: the k-th song a singer has
/// upcoming is that singer's "round k". A new song from `added_by` is their
/// round `existing_count + 1`; it is inserted right before the first
/// existing song whose own round is strictly greater, so it always lands
/// after every already-queued song (of any singer) from an earlier or equal
/// round, and before the next round boundary (spec §4.2 `add`). A singer's
/// own earlier songs are always an earlier round than their new one, so
/// this can never let a new song cut in front of that same singer's
/// still-upcoming songs. If `added_by` already has the largest count among
/// upcoming singers, no existing round exceeds the new one and the song is
/// appended at the end.
fn fair_insert_index(songs: &[Song], position: usize, added_by: &str) -> usize {
    let upcoming = &songs[position..];
    if upcoming.is_empty() {
        return position;
    }

    let new_round = upcoming.iter().filter(|s| s.added_by.as_str() == added_by).count() + 1;

    let mut rounds: HashMap<&str, usize> = HashMap::new();
    for (offset, song) in upcoming.iter().enumerate() {
        let round = rounds.entry(song.added_by.as_str()).or_insert(0);
        *round += 1;
        if *round > new_round {
            return position + offset;
        }
    }
    position + upcoming.len()
}

/// Ordered song list plus playback cursor (spec §4.2). Guarded by a single
/// `parking_lot::Mutex`, never held across an `.await`; the registered
/// `on_change` callback is always invoked after the lock (and the
/// persistence write it triggers) has been released, per spec §4.2 "Change
/// notification" and the re-entrancy rule in §5/§9.
pub struct QueueEngine {
    inner: Mutex<QueueInner>,
    storage: Arc<Storage>,
    on_change: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    requeue_suffix: AtomicU64,
}

impl QueueEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        let loaded = storage.load_queue().unwrap_or(None);
        let (songs, position, _autoplay_ignored, fair_rotation) = loaded.unwrap_or_default();

        Self {
            inner: Mutex::new(QueueInner {
                songs,
                position,
                // Autoplay is a process-wide toggle that always starts OFF,
                // regardless of what was persisted (spec §3, invariant 7).
                autoplay: false,
                fair_rotation,
            }),
            storage,
            on_change: Mutex::new(None),
            requeue_suffix: AtomicU64::new(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            ),
        }
    }

    /// Registers the single change-notification callback. Replaces any
    /// previously registered callback.
    pub fn set_on_change(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_change.lock() = Some(Box::new(f));
    }

    fn persist_and_notify(&self) {
        {
            let inner = self.inner.lock();
            log_persistence_err(
                self.storage
                    .save_queue(&inner.songs, inner.position, inner.autoplay, inner.fair_rotation),
                "save_queue",
            );
        }
        if let Some(cb) = self.on_change.lock().as_ref() {
            cb();
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn current(&self) -> Option<Song> {
        let inner = self.inner.lock();
        inner.songs.get(inner.position).cloned()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.songs.is_empty() || inner.position >= inner.songs.len()
    }

    pub fn get_autoplay(&self) -> bool {
        self.inner.lock().autoplay
    }

    pub fn set_autoplay(&self, on: bool) {
        self.inner.lock().autoplay = on;
        self.persist_and_notify();
    }

    pub fn set_fair_rotation(&self, on: bool) {
        self.inner.lock().fair_rotation = on;
        self.persist_and_notify();
    }

    pub fn add(&self, song: Song) {
        {
            let mut inner = self.inner.lock();
            let idx = if inner.fair_rotation {
                fair_insert_index(&inner.songs, inner.position, song.added_by.as_str())
            } else {
                inner.songs.len()
            };
            inner.songs.insert(idx, song);
            inner.clamp_position();
        }
        debug!("queue: song added");
        self.persist_and_notify();
    }

    /// Returns `(removed, current_removed)`. `removed` is false if `song_id`
    /// was not present.
    pub fn remove(&self, song_id: &str) -> (bool, bool) {
        let result = {
            let mut inner = self.inner.lock();
            let outcome = Self::remove_at_id(&mut inner, song_id);
            inner.clamp_position();
            outcome
        };
        if result.0 {
            self.persist_and_notify();
        }
        result
    }

    fn remove_at_id(inner: &mut QueueInner, song_id: &str) -> (bool, bool) {
        let Some(idx) = inner.songs.iter().position(|s| s.id == song_id) else {
            return (false, false);
        };
        let current_removed = idx == inner.position;
        inner.songs.remove(idx);
        if idx < inner.position {
            inner.position -= 1;
        }
        (true, current_removed)
    }

    /// Applies `remove` for every song owned by `key`. Returns true if any
    /// of the removed songs was the current one.
    pub fn remove_by_user(&self, key: &ParticipantKey) -> bool {
        let mut current_removed = false;
        let mut any_removed = false;
        {
            let mut inner = self.inner.lock();
            loop {
                let Some(idx) = inner.songs.iter().position(|s| s.added_by.as_str() == key.as_str()) else {
                    break;
                };
                let id = inner.songs[idx].id.clone();
                let (removed, cr) = Self::remove_at_id(&mut inner, &id);
                any_removed |= removed;
                current_removed |= cr;
            }
            inner.clamp_position();
        }
        if any_removed {
            self.persist_and_notify();
        }
        current_removed
    }

    /// Reorders upcoming songs; both `from` and `to` must be strictly after
    /// the cursor. Out-of-bounds indices are a no-op (spec §4.5 dispatch
    /// table for `queue_move`).
    pub fn move_song(&self, from: usize, to: usize) -> bool {
        let moved = {
            let mut inner = self.inner.lock();
            let len = inner.songs.len();
            if from <= inner.position || to <= inner.position || from >= len || to >= len {
                false
            } else {
                let song = inner.songs.remove(from);
                inner.songs.insert(to, song);
                true
            }
        };
        if moved {
            self.persist_and_notify();
        }
        moved
    }

    /// Advances the cursor by one iff it is not already on the last song.
    /// Never lands past the last index; only `skip` can exhaust the queue.
    pub fn next(&self) -> Option<Song> {
        let result = {
            let mut inner = self.inner.lock();
            if !inner.songs.is_empty() && inner.position < inner.songs.len() - 1 {
                inner.position += 1;
            }
            inner.songs.get(inner.position).cloned()
        };
        self.persist_and_notify();
        result
    }

    /// Advances the cursor by one iff it is not already exhausted; may land
    /// on `len` (exhausted).
    pub fn skip(&self) -> Option<Song> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.position < inner.songs.len() {
                inner.position += 1;
            }
            inner.songs.get(inner.position).cloned()
        };
        self.persist_and_notify();
        result
    }

    /// Symmetric to `next`: steps the cursor back by one iff it is not
    /// already at the front.
    pub fn previous(&self) -> Option<Song> {
        let result = {
            let mut inner = self.inner.lock();
            if inner.position > 0 {
                inner.position -= 1;
            }
            inner.songs.get(inner.position).cloned()
        };
        self.persist_and_notify();
        result
    }

    /// Fisher-Yates over the upcoming slice only; current and history are
    /// untouched.
    pub fn shuffle(&self) {
        {
            let mut inner = self.inner.lock();
            let position = inner.position;
            let upcoming = &mut inner.songs[position..];
            for i in (1..upcoming.len()).rev() {
                let j = fastrand::usize(..=i);
                upcoming.swap(i, j);
            }
        }
        self.persist_and_notify();
    }

    /// Copies a past entry under a freshly minted id, appended at the end
    /// and attributed to `new_added_by`. If the queue was exhausted, the
    /// new entry immediately becomes current (spec §4.2 `requeue`).
    pub fn requeue(&self, song_id: &str, new_added_by: ParticipantKey) -> Option<Song> {
        let result = {
            let mut inner = self.inner.lock();
            let Some(original) = inner.songs.iter().find(|s| s.id == song_id).cloned() else {
                return None;
            };
            let suffix = self.requeue_suffix.fetch_add(1, Ordering::Relaxed);
            let was_exhausted = inner.position >= inner.songs.len();
            let new_song = Song {
                id: format!("{}_{}", original.id, suffix),
                added_by: new_added_by,
                added_at: now_secs(),
                ..original
            };
            inner.songs.push(new_song.clone());
            if was_exhausted {
                inner.position = inner.songs.len() - 1;
            }
            Some(new_song)
        };
        if result.is_some() {
            self.persist_and_notify();
        }
        result
    }

    /// Drops every upcoming song, leaving history and the current song (if
    /// any) untouched.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.position < inner.songs.len() {
                inner.songs.truncate(inner.position + 1);
            }
        }
        self.persist_and_notify();
    }

    /// Updates the vocal-assist level stored on a queue entry in place,
    /// without moving the cursor. Returns false if `song_id` is not present.
    pub fn set_vocal_assist(&self, song_id: &str, level: crate::model::VocalAssist) -> bool {
        let found = {
            let mut inner = self.inner.lock();
            match inner.songs.iter_mut().find(|s| s.id == song_id) {
                Some(song) => {
                    song.vocal_assist = level;
                    true
                }
                None => false,
            }
        };
        if found {
            self.persist_and_notify();
        }
        found
    }

    /// Stable partition: every upcoming song owned by `key` moves to the
    /// end of the upcoming slice, preserving relative order within both the
    /// moved and the untouched group (spec §4.2 `bumpUserToEnd`).
    pub fn bump_user_to_end(&self, key: &ParticipantKey) {
        {
            let mut inner = self.inner.lock();
            let position = inner.position;
            let upcoming: Vec<Song> = inner.songs.split_off(position);
            let (others, owned): (Vec<Song>, Vec<Song>) =
                upcoming.into_iter().partition(|s| s.added_by.as_str() != key.as_str());
            inner.songs.extend(others);
            inner.songs.extend(owned);
        }
        self.persist_and_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaRef, VocalAssist};

    fn song(id: &str, added_by: &str) -> Song {
        Song {
            id: id.to_string(),
            media_ref: MediaRef::UrlRef { url: "http://x".into() },
            title: id.to_string(),
            artist: "artist".to_string(),
            duration_sec: 180.0,
            thumbnail: None,
            vocal_assist: VocalAssist::Off,
            added_by: ParticipantKey::from(added_by),
            added_at: 0,
        }
    }

    fn engine() -> QueueEngine {
        QueueEngine::new(Arc::new(Storage::open_in_memory().unwrap()))
    }

    #[test]
    fn add_fifo_when_not_fair() {
        let q = engine();
        q.add(song("s1", "a"));
        q.add(song("s2", "b"));
        let snap = q.snapshot();
        assert_eq!(snap.songs.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["s1", "s2"]);
    }

    #[test]
    fn remove_current_advances_without_changing_position_value() {
        let q = engine();
        q.add(song("s1", "a"));
        q.add(song("s2", "b"));
        let (removed, current_removed) = q.remove("s1");
        assert!(removed);
        assert!(current_removed);
        let snap = q.snapshot();
        assert_eq!(snap.position, 0);
        assert_eq!(snap.current().unwrap().id, "s2");
    }

    #[test]
    fn remove_last_current_exhausts_queue() {
        let q = engine();
        q.add(song("s1", "a"));
        q.next(); // no-op, only 1 song so position stays, but test remove-last directly
        let (removed, current_removed) = q.remove("s1");
        assert!(removed);
        assert!(current_removed);
        let snap = q.snapshot();
        assert_eq!(snap.position, 0);
        assert_eq!(snap.songs.len(), 0);
        assert!(snap.is_empty());
    }

    #[test]
    fn skip_when_exhausted_is_noop() {
        let q = engine();
        q.add(song("s1", "a"));
        q.skip();
        let before = q.snapshot().position;
        q.skip();
        assert_eq!(q.snapshot().position, before);
    }

    #[test]
    fn add_then_remove_same_id_restores_state() {
        let q = engine();
        q.add(song("s1", "a"));
        let before = q.snapshot();
        q.add(song("s2", "b"));
        q.remove("s2");
        let after = q.snapshot();
        assert_eq!(before.songs, after.songs);
        assert_eq!(before.position, after.position);
    }

    #[test]
    fn requeue_mints_new_id_and_preserves_original() {
        let q = engine();
        q.add(song("h1", "a"));
        q.add(song("h2", "a"));
        q.add(song("c", "a"));
        q.next();
        q.next(); // position = 2, c is current
        let requeued = q.requeue("h1", ParticipantKey::from("b")).unwrap();
        assert_ne!(requeued.id, "h1");
        assert!(requeued.id.starts_with("h1_"));
        assert_eq!(requeued.added_by.as_str(), "b");
        let snap = q.snapshot();
        assert_eq!(snap.songs[0].id, "h1");
        assert_eq!(snap.position, 2);
    }

    #[test]
    fn bump_user_to_end_preserves_relative_order() {
        let q = engine();
        q.add(song("x", "a"));
        q.add(song("y", "c"));
        q.add(song("z", "a"));
        q.add(song("w", "b"));
        q.bump_user_to_end(&ParticipantKey::from("a"));
        let snap = q.snapshot();
        let ids: Vec<&str> = snap.songs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "w", "x", "z"]);
    }

    #[test]
    fn fair_rotation_gives_new_singer_second_slot() {
        let q = engine();
        q.set_fair_rotation(true);
        q.add(song("a1", "a"));
        q.add(song("a2", "a"));
        q.add(song("b1", "b"));
        let snap = q.snapshot();
        let ids: Vec<&str> = snap.songs.iter().map(|s| s.id.as_str()).collect();
        // b1 should not have jumped ahead of a1 (already up next), but should
        // cut ahead of a2.
        assert_eq!(ids, vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn fair_rotation_new_song_never_jumps_own_earlier_songs() {
        let q = engine();
        q.set_fair_rotation(true);
        q.add(song("a1", "a"));
        q.add(song("a2", "a"));
        q.add(song("b1", "b"));
        q.add(song("b2", "b"));
        // b already has two upcoming songs (b1, b2); a third from b must not
        // cut in front of either of them.
        q.add(song("b3", "b"));
        let snap = q.snapshot();
        let ids: Vec<&str> = snap.songs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b1", "a2", "b2", "b3"]);
    }

    #[test]
    fn move_out_of_bounds_is_noop() {
        let q = engine();
        q.add(song("s1", "a"));
        assert!(!q.move_song(5, 0));
    }
}
