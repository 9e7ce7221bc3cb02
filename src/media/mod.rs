mod ipc;
mod process;

use crate::config::Config;
use crate::model::{PlayerState, VocalAssist};
use ipc::IpcClient;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

type TrackEndCallback = Arc<dyn Fn() + Send + Sync>;
type StateChangeCallback = Arc<dyn Fn(PlayerState) + Send + Sync>;

/// Supervises one external media player process over a JSON IPC channel
/// (spec §4.3). The adapter's own lock is a leaf: it is never held while
/// acquiring the Queue, Session or Coordinator lock (spec §5).
pub struct MediaAdapter {
    config: Config,
    endpoint: String,
    child: AsyncMutex<Option<tokio::process::Child>>,
    ipc: AsyncMutex<Option<Arc<IpcClient>>>,
    player_state: SyncMutex<PlayerState>,
    on_track_end: SyncMutex<Option<TrackEndCallback>>,
    on_state_change: SyncMutex<Option<StateChangeCallback>>,
}

impl MediaAdapter {
    pub fn new(config: Config) -> Arc<Self> {
        let endpoint = config.ipc_endpoint();
        Arc::new(Self {
            config,
            endpoint,
            child: AsyncMutex::new(None),
            ipc: AsyncMutex::new(None),
            player_state: SyncMutex::new(PlayerState::default()),
            on_track_end: SyncMutex::new(None),
            on_state_change: SyncMutex::new(None),
        })
    }

    pub fn on_track_end(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_track_end.lock() = Some(Arc::new(f));
    }

    pub fn on_state_change(&self, f: impl Fn(PlayerState) + Send + Sync + 'static) {
        *self.on_state_change.lock() = Some(Arc::new(f));
    }

    /// Runs the full adoption/cleanup/spawn sequence (spec §4.3
    /// "Supervision", steps 1-4). Startup failure is reported but never
    /// crashes the host (spec §4.3 "Failure semantics", §7).
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.try_start().await {
            warn!(error = %e, "media adapter failed to start; playback controls will error until restarted");
        }
    }

    async fn try_start(self: &Arc<Self>) -> anyhow::Result<()> {
        // Step 1: adopt an existing process if one is already listening.
        if process::probe_endpoint(&self.endpoint).await {
            info!(endpoint = %self.endpoint, "adopting existing player process");
            self.connect_ipc().await?;
            return Ok(());
        }

        // Step 2: clean up anything stale before spawning fresh.
        process::cleanup_previous_instance(&self.config, &self.endpoint).await;

        // Step 3: spawn a fresh process.
        let child = process::spawn_fresh(&self.config, &self.endpoint)?;
        *self.child.lock().await = Some(child);

        // Step 4: poll for the endpoint to come up.
        if !process::wait_for_endpoint(&self.endpoint, Duration::from_secs(5)).await {
            if let Some(mut child) = self.child.lock().await.take() {
                let _ = child.kill().await;
            }
            anyhow::bail!("player did not expose its IPC endpoint within 5s");
        }

        self.connect_ipc().await
    }

    async fn connect_ipc(self: &Arc<Self>) -> anyhow::Result<()> {
        let adapter = Arc::clone(self);
        let stream = Self::open_transport(&self.endpoint).await?;
        let client = IpcClient::new(stream, move |event| adapter.handle_event(event));
        *self.ipc.lock().await = Some(Arc::new(client));
        Ok(())
    }

    #[cfg(unix)]
    async fn open_transport(endpoint: &str) -> anyhow::Result<tokio::net::UnixStream> {
        Ok(tokio::net::UnixStream::connect(endpoint).await?)
    }

    #[cfg(windows)]
    async fn open_transport(
        endpoint: &str,
    ) -> anyhow::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        Ok(tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?)
    }

    fn handle_event(&self, event: Value) {
        let Some(kind) = event.get("event").and_then(Value::as_str) else {
            return;
        };
        match kind {
            "end-file" => {
                // onTrackEnd fires only for natural end-of-file; stop/error/
                // redirect reasons are suppressed (spec §4.3 "Event stream").
                if event.get("reason").and_then(Value::as_str) == Some("eof") {
                    if let Some(cb) = self.on_track_end.lock().clone() {
                        cb();
                    }
                }
            }
            "property-change" => {
                let name = event.get("name").and_then(Value::as_str).unwrap_or("");
                let mut state = self.player_state.lock();
                match name {
                    "pause" => {
                        if let Some(paused) = event.get("data").and_then(Value::as_bool) {
                            state.is_playing = !paused;
                        }
                    }
                    "time-pos" => {
                        if let Some(pos) = event.get("data").and_then(Value::as_f64) {
                            state.position_sec = pos;
                        }
                    }
                    "duration" => {
                        if let Some(dur) = event.get("data").and_then(Value::as_f64) {
                            state.duration_sec = dur;
                        }
                    }
                    "volume" => {
                        if let Some(vol) = event.get("data").and_then(Value::as_f64) {
                            state.volume = vol.round().clamp(0.0, 100.0) as u8;
                        }
                    }
                    _ => {}
                }
                let snapshot = state.clone();
                drop(state);
                if let Some(cb) = self.on_state_change.lock().clone() {
                    cb(snapshot);
                }
            }
            _ => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.ipc.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }

    async fn client(&self) -> anyhow::Result<Arc<IpcClient>> {
        self.ipc
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("media player is not connected"))
    }

    pub async fn restart(self: &Arc<Self>) -> anyhow::Result<()> {
        self.stop().await;
        self.try_start().await
    }

    /// Stops the process gracefully (IPC quit, then best-effort kill) and
    /// drops the IPC connection. Used on `restart` and on graceful shutdown.
    pub async fn stop(&self) {
        if let Ok(client) = self.client().await {
            let _ = client.command(vec![json!("quit")]).await;
        }
        *self.ipc.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            let _ = child.kill().await;
        }
    }

    pub async fn load_file(&self, path: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .command(vec![json!("loadfile"), json!(path), json!("replace")])
            .await?;
        Ok(())
    }

    /// Loads a still image; mpv never emits a natural end-of-file event for
    /// an image, so no `onTrackEnd` follows (spec §4.3).
    pub async fn load_image(&self, path: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .command(vec![json!("loadfile"), json!(path), json!("replace")])
            .await?;
        client.set_property("loop-file", json!("inf")).await?;
        Ok(())
    }

    pub async fn load_cdg(&self, cdg_path: &str, audio_path: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .command(vec![
                json!("loadfile"),
                json!(cdg_path),
                json!("replace"),
                json!(format!("audio-file={audio_path}")),
            ])
            .await?;
        Ok(())
    }

    /// Mixes an instrumental and a vocal track at the gain implied by a
    /// vocal-assist level (spec §4.3 "Vocal gain mapping"). When the gain is
    /// zero, only the instrumental is loaded — no mix filter.
    pub async fn set_stems_mix(
        &self,
        instrumental_path: &str,
        vocal_path: &str,
        vocal_assist: VocalAssist,
    ) -> anyhow::Result<()> {
        let gain = vocal_assist.gain();
        let client = self.client().await?;
        if gain == 0.0 {
            client
                .command(vec![json!("loadfile"), json!(instrumental_path), json!("replace")])
                .await?;
        } else {
            let filter = format!(
                "lavfi=[amix=inputs=2:weights='1 {gain}']",
                gain = gain
            );
            client
                .command(vec![
                    json!("loadfile"),
                    json!(instrumental_path),
                    json!("replace"),
                    json!(format!("external-file={vocal_path},af={filter}")),
                ])
                .await?;
        }
        Ok(())
    }

    pub async fn play(&self) -> anyhow::Result<()> {
        self.client().await?.set_property("pause", json!(false)).await
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.client().await?.set_property("pause", json!(true)).await
    }

    /// Clears the playlist but keeps the process running.
    pub async fn stop_playback(&self) -> anyhow::Result<()> {
        self.client().await?.command(vec![json!("stop")]).await?;
        Ok(())
    }

    pub async fn seek(&self, seconds: f64) -> anyhow::Result<()> {
        self.client()
            .await?
            .command(vec![json!("seek"), json!(seconds), json!("absolute")])
            .await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> anyhow::Result<()> {
        self.client()
            .await?
            .set_property("volume", json!(volume))
            .await
    }

    pub async fn get_state(&self) -> anyhow::Result<PlayerState> {
        let client = self.client().await?;
        let pause = client.get_property("pause").await?;
        let time_pos = client.get_property("time-pos").await?;
        let duration = client.get_property("duration").await?;
        let volume = client.get_property("volume").await?;

        let mut state = self.player_state.lock();
        state.is_playing = !pause.as_bool().unwrap_or(false);
        state.position_sec = time_pos.as_f64().unwrap_or(state.position_sec);
        state.duration_sec = duration.as_f64().unwrap_or(state.duration_sec);
        state.volume = volume.as_f64().map(|v| v.round() as u8).unwrap_or(state.volume);
        Ok(state.clone())
    }

    pub fn cached_state(&self) -> PlayerState {
        self.player_state.lock().clone()
    }

    pub fn set_bgm_active(&self, active: bool) {
        self.player_state.lock().bgm_active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocal_gain_mapping() {
        assert_eq!(VocalAssist::Off.gain(), 0.0);
        assert!((VocalAssist::Low.gain() - 0.25).abs() < f32::EPSILON);
        assert!((VocalAssist::Med.gain() - 0.55).abs() < f32::EPSILON);
        assert!((VocalAssist::High.gain() - 0.85).abs() < f32::EPSILON);
    }
}
