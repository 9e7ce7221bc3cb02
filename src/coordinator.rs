use crate::collaborators::HoldingScreenGenerator;
use crate::media::MediaAdapter;
use crate::model::{CountdownState, MediaRef, ParticipantKey, Song};
use crate::queue::QueueEngine;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    CountdownAuto,
    CountdownApproval,
    CountdownAdmin,
    Bgm,
}

impl Default for PlaybackState {
    fn default() -> Self {
        PlaybackState::Idle
    }
}

struct CoordinatorData {
    state: PlaybackState,
    countdown: CountdownState,
    generation: u64,
}

/// Orchestrates transitions between songs (spec §4.4). Owns the
/// CountdownState and the single 1 Hz ticker; a countdown "generation"
/// counter stands in for the ticker's cancellation channel — starting a new
/// countdown, or cancelling the active one, bumps the generation, and the
/// running ticker task notices the mismatch and exits on its next tick
/// instead of racing a fresh one.
pub struct PlaybackCoordinator {
    data: SyncMutex<CoordinatorData>,
    queue: Arc<QueueEngine>,
    media: Arc<MediaAdapter>,
    holding_screen: Arc<dyn HoldingScreenGenerator>,
    connect_url: String,
    countdown_secs: u32,
    admin_countdown_secs: u32,
    bgm_url: Option<String>,
    on_broadcast: SyncMutex<Option<Box<dyn Fn() + Send + Sync>>>,
    bgm_active: AtomicBool,
}

impl PlaybackCoordinator {
    pub fn new(
        queue: Arc<QueueEngine>,
        media: Arc<MediaAdapter>,
        holding_screen: Arc<dyn HoldingScreenGenerator>,
        connect_url: String,
        countdown_secs: u32,
        admin_countdown_secs: u32,
        bgm_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data: SyncMutex::new(CoordinatorData {
                state: PlaybackState::Idle,
                countdown: CountdownState::default(),
                generation: 0,
            }),
            queue,
            media,
            holding_screen,
            connect_url,
            countdown_secs,
            admin_countdown_secs,
            bgm_url,
            on_broadcast: SyncMutex::new(None),
            bgm_active: AtomicBool::new(false),
        })
    }

    /// Registers the single change-notification callback (spec §4.4
    /// "Broadcasts are emitted AFTER releasing the lock").
    pub fn set_on_broadcast(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_broadcast.lock() = Some(Box::new(f));
    }

    fn notify_broadcast(&self) {
        if let Some(cb) = self.on_broadcast.lock().as_ref() {
            cb();
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.data.lock().state
    }

    pub fn countdown(&self) -> CountdownState {
        self.data.lock().countdown.clone()
    }

    fn set_state(&self, to: PlaybackState) {
        let from = {
            let mut data = self.data.lock();
            let from = data.state;
            data.state = to;
            from
        };
        info!(from = ?from, to = ?to, "coordinator: state transition");
    }

    fn is_bgm_active(&self) -> bool {
        self.bgm_active.load(Ordering::Relaxed)
    }

    /// Idle -> Playing: `playCurrent` when the queue has a current song.
    pub async fn play_current(self: &Arc<Self>) {
        let Some(song) = self.queue.current() else {
            return;
        };
        self.cancel_countdown();
        let _ = self.load_song(&song).await;
        self.set_state(PlaybackState::Playing);
        self.notify_broadcast();
    }

    /// Media Adapter event callback: natural end-of-file on the current
    /// track (spec §4.4 "onTrackEnd" rows).
    pub async fn on_track_end(self: &Arc<Self>) {
        if !self.queue.get_autoplay() {
            self.queue.skip();
            self.set_state(PlaybackState::Idle);
            self.show_holding_screen(None).await;
            self.notify_broadcast();
            return;
        }

        let snapshot = self.queue.snapshot();
        let had_next = snapshot.position + 1 < snapshot.songs.len();
        let finished_singer = snapshot.current().map(|s| s.added_by.clone());

        if had_next {
            let peek = snapshot.songs[snapshot.position + 1].clone();
            let requires_approval = finished_singer.as_ref() != Some(&peek.added_by);
            self.queue.next();
            self.begin_countdown(peek, requires_approval).await;
            return;
        }

        self.queue.skip();
        if let Some(bgm_url) = self.bgm_url.clone() {
            self.bgm_active.store(true, Ordering::Relaxed);
            self.media.set_bgm_active(true);
            let _ = self.media.load_file(&bgm_url).await;
            let _ = self.media.play().await;
            self.set_state(PlaybackState::Bgm);
        } else {
            self.set_state(PlaybackState::Idle);
            self.show_holding_screen(None).await;
        }
        self.notify_broadcast();
    }

    /// Hub `skip` command: capture the current singer, stop media, advance
    /// the cursor (which may exhaust the queue), and either start a
    /// countdown for whatever comes next or fall back to the holding
    /// screen.
    pub async fn user_skip(self: &Arc<Self>) {
        self.cancel_countdown();
        let prev_singer = self.queue.current().map(|s| s.added_by.clone());
        let _ = self.media.stop_playback().await;
        match self.queue.skip() {
            Some(next_song) => {
                let requires_approval = prev_singer.as_ref() != Some(&next_song.added_by);
                self.begin_countdown(next_song, requires_approval).await;
            }
            None => {
                self.set_state(PlaybackState::Idle);
                self.show_holding_screen(None).await;
                self.notify_broadcast();
            }
        }
    }

    /// Hub `queue_remove`/`admin_kick`-driven removal of the current song:
    /// `prev_singer` must be captured by the caller BEFORE the removal is
    /// applied to the Queue Engine.
    pub async fn on_current_removed(self: &Arc<Self>, prev_singer: Option<ParticipantKey>) {
        self.cancel_countdown();
        let _ = self.media.stop_playback().await;
        match self.queue.current() {
            Some(next_song) => {
                let requires_approval = prev_singer.as_ref() != Some(&next_song.added_by);
                self.begin_countdown(next_song, requires_approval).await;
            }
            None => {
                self.set_state(PlaybackState::Idle);
                self.show_holding_screen(None).await;
                self.notify_broadcast();
            }
        }
    }

    /// Any Countdown -> Playing: admin "play now".
    pub async fn admin_play_now(self: &Arc<Self>) {
        self.cancel_countdown();
        if let Some(song) = self.queue.current() {
            let _ = self.load_song(&song).await;
            self.set_state(PlaybackState::Playing);
        }
        self.notify_broadcast();
    }

    /// Any Countdown/Playing -> Idle: admin "stop". Advances the cursor past
    /// the current song into history and shows the holding screen.
    pub async fn admin_stop(self: &Arc<Self>) {
        self.cancel_countdown();
        let _ = self.media.stop_playback().await;
        self.bgm_active.store(false, Ordering::Relaxed);
        self.media.set_bgm_active(false);
        self.queue.skip();
        self.set_state(PlaybackState::Idle);
        self.show_holding_screen(None).await;
        self.notify_broadcast();
    }

    /// Idle/Playing -> CountdownAdmin: admin "play next".
    pub async fn admin_play_next(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(song) = self.queue.current() else {
            anyhow::bail!("queue has no current song to play next");
        };
        if !self.media.is_running() {
            self.media.restart().await?;
        }
        let generation = {
            let mut data = self.data.lock();
            data.generation += 1;
            data.state = PlaybackState::CountdownAdmin;
            data.countdown = CountdownState {
                active: true,
                seconds_remaining: self.admin_countdown_secs,
                next_song_id: Some(song.id.clone()),
                next_singer_key: Some(song.added_by.clone()),
                requires_approval: false,
            };
            data.generation
        };
        self.notify_broadcast();
        self.show_holding_screen(Some(song.title.clone())).await;
        self.spawn_ticker(generation);
        Ok(())
    }

    /// When a participant changes their vocal-assist level and owns the
    /// current song, re-issue `setStemsMix` with the new gain (spec §4.4
    /// "Vocal mix updates"). Does nothing if the current song has no stems.
    pub async fn on_vocal_assist_changed(self: &Arc<Self>, key: &ParticipantKey) {
        let Some(song) = self.queue.current() else {
            return;
        };
        if song.added_by.as_str() != key.as_str() {
            return;
        }
        if let MediaRef::StemsRef { instrumental, vocal } = &song.media_ref {
            let _ = self
                .media
                .set_stems_mix(instrumental, vocal, song.vocal_assist)
                .await;
        }
    }

    /// BGM -> Playing: a song was added to a previously-empty queue while
    /// autoplay is ON. Waits a brief "next up" delay, showing the holding
    /// screen in the meantime (suppressed while BGM is still active, per
    /// §4.4's holding-screen rule), then loads the new song.
    pub async fn on_song_added_to_empty_queue(self: &Arc<Self>) {
        if !self.queue.get_autoplay() {
            return;
        }
        let next_title = self.queue.current().map(|s| s.title.clone());
        self.show_holding_screen(next_title).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Some(song) = self.queue.current() {
            self.bgm_active.store(false, Ordering::Relaxed);
            let _ = self.load_song(&song).await;
            self.set_state(PlaybackState::Playing);
            self.notify_broadcast();
        }
    }

    async fn begin_countdown(self: &Arc<Self>, next_song: Song, requires_approval: bool) {
        let to_state = if requires_approval {
            PlaybackState::CountdownApproval
        } else {
            PlaybackState::CountdownAuto
        };
        let generation = {
            let mut data = self.data.lock();
            data.generation += 1;
            data.state = to_state;
            data.countdown = CountdownState {
                active: true,
                seconds_remaining: self.countdown_secs,
                next_song_id: Some(next_song.id.clone()),
                next_singer_key: Some(next_song.added_by.clone()),
                requires_approval,
            };
            data.generation
        };
        self.notify_broadcast();
        self.show_holding_screen(Some(next_song.title)).await;
        self.spawn_ticker(generation);
    }

    /// Invalidates any running ticker by bumping the generation counter and
    /// clearing the countdown state, without touching the queue or media.
    fn cancel_countdown(&self) {
        let mut data = self.data.lock();
        data.generation += 1;
        data.countdown = CountdownState::default();
    }

    fn spawn_ticker(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_ticker(generation).await;
        });
    }

    /// The single 1 Hz ticker (spec §4.4 "Countdown implementation"). Reads
    /// and mutates state only under the Coordinator's lock, never across an
    /// `.await`; broadcasts are emitted after the lock is released.
    async fn run_ticker(self: Arc<Self>, generation: u64) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            let (current, exhausted, requires_approval) = {
                let mut data = self.data.lock();
                if data.generation != generation || !data.countdown.active {
                    return;
                }
                if data.countdown.seconds_remaining > 0 {
                    data.countdown.seconds_remaining -= 1;
                }
                (
                    data.generation == generation,
                    data.countdown.seconds_remaining == 0,
                    data.countdown.requires_approval,
                )
            };
            if !current {
                return;
            }
            self.notify_broadcast();

            if exhausted {
                if requires_approval {
                    // Freeze at 0 and wait for an admin "play now"/"stop".
                    return;
                }
                self.complete_countdown(generation).await;
                return;
            }
        }
    }

    /// Any Countdown -> Playing: countdown reached 0 and did not require
    /// approval.
    async fn complete_countdown(self: &Arc<Self>, generation: u64) {
        {
            let mut data = self.data.lock();
            if data.generation != generation {
                return;
            }
            data.countdown = CountdownState::default();
            data.state = PlaybackState::Playing;
        }
        self.notify_broadcast();
        if let Some(song) = self.queue.current() {
            let _ = self.load_song(&song).await;
        }
    }

    async fn load_song(&self, song: &Song) -> anyhow::Result<()> {
        match &song.media_ref {
            MediaRef::FileRef { path } => self.media.load_file(path).await?,
            MediaRef::UrlRef { url } => self.media.load_file(url).await?,
            MediaRef::CdgRef { cdg, audio } => self.media.load_cdg(cdg, audio).await?,
            MediaRef::StemsRef { instrumental, vocal } => {
                self.media
                    .set_stems_mix(instrumental, vocal, song.vocal_assist)
                    .await?
            }
        }
        self.media.play().await?;
        Ok(())
    }

    async fn show_holding_screen(&self, next_up: Option<String>) {
        if self.is_bgm_active() {
            return;
        }
        match self
            .holding_screen
            .generate(&self.connect_url, next_up.as_deref())
        {
            Ok(path) => {
                let _ = self.media.load_image(&path).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "holding screen generator unavailable, suppressing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullHoldingScreenGenerator;
    use crate::config::Config;
    use crate::model::VocalAssist;
    use crate::storage::Storage;

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

    fn test_config() -> Config {
        Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: std::env::temp_dir(),
            admin_pin: None,
            admin_token: None,
            bgm_url: None,
            mpv_socket_name: "karahub-test".to_string(),
            countdown_secs: 15,
            admin_countdown_secs: 10,
        }
    }

    fn coordinator() -> (Arc<PlaybackCoordinator>, Arc<QueueEngine>) {
        let queue = Arc::new(QueueEngine::new(Arc::new(Storage::open_in_memory().unwrap())));
        let media = MediaAdapter::new(test_config());
        let coord = PlaybackCoordinator::new(
            Arc::clone(&queue),
            media,
            Arc::new(NullHoldingScreenGenerator),
            "ws://localhost:7300".to_string(),
            15,
            10,
            None,
        );
        (coord, queue)
    }

    #[test]
    fn starts_idle() {
        let (coord, _queue) = coordinator();
        assert_eq!(coord.state(), PlaybackState::Idle);
        assert!(!coord.countdown().active);
    }

    #[tokio::test]
    async fn play_current_with_empty_queue_is_noop() {
        let (coord, _queue) = coordinator();
        coord.play_current().await;
        assert_eq!(coord.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn track_end_same_singer_starts_auto_countdown() {
        let (coord, queue) = coordinator();
        queue.set_autoplay(true);
        queue.add(song("s1", "a"));
        queue.add(song("s2", "a"));
        coord.on_track_end().await;
        assert_eq!(coord.state(), PlaybackState::CountdownAuto);
        let cd = coord.countdown();
        assert!(cd.active);
        assert!(!cd.requires_approval);
        assert_eq!(cd.next_song_id.as_deref(), Some("s2"));
        assert_eq!(queue.snapshot().position, 1);
    }

    #[tokio::test]
    async fn track_end_different_singer_requires_approval() {
        let (coord, queue) = coordinator();
        queue.set_autoplay(true);
        queue.add(song("s1", "a"));
        queue.add(song("s2", "b"));
        coord.on_track_end().await;
        assert_eq!(coord.state(), PlaybackState::CountdownApproval);
        assert!(coord.countdown().requires_approval);
    }

    #[tokio::test]
    async fn track_end_autoplay_off_goes_idle_without_advancing_to_countdown() {
        let (coord, queue) = coordinator();
        queue.add(song("s1", "a"));
        queue.add(song("s2", "b"));
        coord.on_track_end().await;
        assert_eq!(coord.state(), PlaybackState::Idle);
        assert!(!coord.countdown().active);
    }

    #[tokio::test]
    async fn track_end_exhausted_queue_goes_idle_without_bgm() {
        let (coord, queue) = coordinator();
        queue.set_autoplay(true);
        queue.add(song("s1", "a"));
        coord.on_track_end().await;
        assert_eq!(coord.state(), PlaybackState::Idle);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn admin_stop_cancels_countdown_and_advances_past_current() {
        let (coord, queue) = coordinator();
        queue.set_autoplay(true);
        queue.add(song("s1", "a"));
        queue.add(song("s2", "a"));
        coord.on_track_end().await;
        assert_eq!(coord.state(), PlaybackState::CountdownAuto);
        coord.admin_stop().await;
        assert_eq!(coord.state(), PlaybackState::Idle);
        assert!(!coord.countdown().active);
        assert!(queue.is_empty());
    }
}
