use crate::collaborators::Library;
use crate::coordinator::{PlaybackCoordinator, PlaybackState};
use crate::envelope::{InboundMessage, OutboundMessage};
use crate::error::AppError;
use crate::media::MediaAdapter;
use crate::model::{now_secs, DeviceInfo, ParticipantKey, RoomState};
use crate::queue::QueueEngine;
use crate::registry::SessionRegistry;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

const CONTROL_QUEUE_CAPACITY: usize = 16;

struct Connection {
    key: ParticipantKey,
    state_tx: watch::Sender<RoomState>,
    control_tx: mpsc::Sender<OutboundMessage>,
    kill: Arc<Notify>,
}

/// Connection fan-out (spec §4.5). Owns the live connection table; every
/// other component is reached through an `Arc` handed in at construction.
/// The table itself is a `DashMap` (never held across an `.await` any
/// longer than a single entry lookup), matching the "Hub (connection
/// table)" leaf lock in the ordering contract of spec §5 — the Hub is
/// always the LAST lock acquired, so it never needs to reach back into
/// Queue/Session/Coordinator while holding its own.
pub struct Hub {
    connections: DashMap<u64, Connection>,
    next_conn_id: AtomicU64,
    registry: Arc<SessionRegistry>,
    queue: Arc<QueueEngine>,
    coordinator: Arc<PlaybackCoordinator>,
    media: Arc<MediaAdapter>,
    library: Arc<dyn Library>,
}

impl Hub {
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: Arc<QueueEngine>,
        coordinator: Arc<PlaybackCoordinator>,
        media: Arc<MediaAdapter>,
        library: Arc<dyn Library>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            registry,
            queue,
            coordinator,
            media,
            library,
        })
    }

    /// Computes a RoomState snapshot under the canonical lock order (Queue,
    /// Session, Coordinator; spec §5). Exposed for the admin-gated HTTP
    /// status endpoint as well as the fan-out path below.
    pub fn room_state(&self) -> RoomState {
        let queue = self.queue.snapshot();
        let current_song = queue.current().cloned();
        let sessions = self.registry.list_active();
        let countdown = self.coordinator.countdown();
        let player = self.media.cached_state();
        RoomState {
            player,
            current_song,
            queue,
            sessions,
            countdown,
        }
    }

    /// `broadcastState()` (spec §4.5): fans the latest RoomState out to
    /// every connection's `watch` channel. `watch` naturally implements the
    /// "drop stale, keep only the freshest" overflow policy spec §4.5 calls
    /// for ("state updates are idempotent and resendable").
    pub fn broadcast_state(&self) {
        let state = self.room_state();
        for entry in self.connections.iter() {
            let _ = entry.value().state_tx.send(state.clone());
        }
    }

    /// `broadcastToAdmins(client_list, ...)` (spec §4.5), filtered to
    /// connections whose bound session currently has `isAdmin == true`.
    fn broadcast_client_list(&self) {
        let sessions = self.registry.list_active();
        for entry in self.connections.iter() {
            if self
                .registry
                .get(&entry.value().key)
                .map(|s| s.is_admin)
                .unwrap_or(false)
            {
                let _ = entry
                    .value()
                    .control_tx
                    .try_send(OutboundMessage::ClientList { sessions: sessions.clone() });
            }
        }
    }

    /// `kickClient(conn, reason)` (spec §4.5): enqueues a final `kicked`
    /// message, gives the writer a brief window to flush it, then signals
    /// the connection's read loop to close the socket.
    async fn kick(&self, key: &ParticipantKey, reason: &str) {
        let targets: Vec<(u64, Arc<Notify>)> = self
            .connections
            .iter()
            .filter(|e| e.value().key.as_str() == key.as_str())
            .map(|e| (*e.key(), e.value().kill.clone()))
            .collect();

        for (conn_id, kill) in targets {
            if let Some(entry) = self.connections.get(&conn_id) {
                let _ = entry
                    .value()
                    .control_tx
                    .try_send(OutboundMessage::Kicked { reason: reason.to_string() });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            kill.notify_one();
        }
        self.registry.set_online(key, false);
        self.broadcast_client_list();
    }

    /// Entry point for the axum WebSocket upgrade handler. Runs the
    /// handshake, then the per-connection read loop, until disconnect.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, peer_ip: Option<IpAddr>, user_agent: Option<String>) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let handshake_key = match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(InboundMessage::Handshake { key, proposed_name }) => Some((key, proposed_name)),
                _ => None,
            },
            _ => None,
        };

        let Some((key, proposed_name)) = handshake_key else {
            let _ = send_one(&mut ws_tx, &OutboundMessage::error("first message must be handshake")).await;
            return;
        };
        let key = ParticipantKey::from(key);

        let (blocked, reason) = self.registry.is_blocked(&key);
        if blocked {
            let _ = send_one(
                &mut ws_tx,
                &OutboundMessage::Kicked {
                    reason: reason.unwrap_or_else(|| "blocked".to_string()),
                },
            )
            .await;
            return;
        }

        let session = self.registry.get_or_create(&key, &proposed_name);
        self.registry.update_device(
            &key,
            DeviceInfo {
                user_agent,
                friendly_name: None,
                ip_address: peer_ip.map(|ip| ip.to_string()),
            },
        );
        self.registry.set_online(&key, true);
        info!(key = %key, "connection established");

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let room_state = self.room_state();
        let (state_tx, state_rx) = watch::channel(room_state.clone());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let kill = Arc::new(Notify::new());

        self.connections.insert(
            conn_id,
            Connection {
                key: key.clone(),
                state_tx,
                control_tx: control_tx.clone(),
                kill: kill.clone(),
            },
        );

        let welcome = OutboundMessage::Welcome {
            session: self.registry.get(&key).unwrap_or(session),
            state: room_state,
        };
        let _ = control_tx.try_send(welcome);
        self.broadcast_client_list();

        let writer = tokio::spawn(writer_loop(ws_tx, state_rx, control_rx));

        loop {
            tokio::select! {
                _ = kill.notified() => break,
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(&key, &text, &control_tx).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(key = %key, error = %e, "connection read error");
                            break;
                        }
                    }
                }
            }
        }

        self.connections.remove(&conn_id);
        self.registry.set_online(&key, false);
        self.broadcast_client_list();
        drop(writer); // channels are already closed by the table removal above
        info!(key = %key, "connection closed");
    }

    async fn handle_inbound(self: &Arc<Self>, key: &ParticipantKey, text: &str, control_tx: &mpsc::Sender<OutboundMessage>) {
        let inbound: InboundMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                let _ = control_tx.try_send(OutboundMessage::error(format!("malformed message: {e}")));
                return;
            }
        };

        let is_admin = self.registry.get(key).map(|s| s.is_admin).unwrap_or(false);
        if inbound.requires_admin() && !is_admin {
            let _ = control_tx.try_send(AppError::Authorization.into());
            return;
        }

        match self.dispatch(key, is_admin, inbound).await {
            Ok(Some(reply)) => {
                let _ = control_tx.try_send(reply);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = control_tx.try_send(e.into());
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        key: &ParticipantKey,
        is_admin: bool,
        msg: InboundMessage,
    ) -> Result<Option<OutboundMessage>, AppError> {
        match msg {
            InboundMessage::Handshake { .. } => {
                Err(AppError::ClientProtocol("handshake already completed for this connection".into()))
            }

            InboundMessage::Search { query } => Ok(Some(OutboundMessage::SearchResult {
                song: self.library.get_song(&query),
            })),

            InboundMessage::QueueAdd { song_id, vocal_assist } => {
                let mut song = self
                    .library
                    .get_song(&song_id)
                    .ok_or_else(|| AppError::NotFound("song not found".into()))?;
                song.id = uuid::Uuid::new_v4().to_string();
                song.vocal_assist = vocal_assist;
                song.added_by = key.clone();
                song.added_at = now_secs();

                let was_empty = self.queue.is_empty();
                self.queue.add(song);
                if was_empty {
                    let coordinator = Arc::clone(&self.coordinator);
                    tokio::spawn(async move { coordinator.on_song_added_to_empty_queue().await });
                }
                Ok(None)
            }

            InboundMessage::QueueRemove { song_id } => {
                let prev_singer = self.queue.current().map(|s| s.added_by.clone());
                let (removed, current_removed) = self.queue.remove(&song_id);
                if !removed {
                    return Err(AppError::NotFound("song not in queue".into()));
                }
                if current_removed {
                    let coordinator = Arc::clone(&self.coordinator);
                    tokio::spawn(async move { coordinator.on_current_removed(prev_singer).await });
                }
                Ok(None)
            }

            InboundMessage::QueueMove { from, to } => {
                self.queue.move_song(from, to);
                Ok(None)
            }

            InboundMessage::QueueClear => {
                self.queue.clear();
                Ok(None)
            }

            InboundMessage::QueueShuffle => {
                self.queue.shuffle();
                Ok(None)
            }

            InboundMessage::QueueRequeue { song_id, new_added_by } => {
                let target = new_added_by.map(ParticipantKey::from).unwrap_or_else(|| key.clone());
                self.queue
                    .requeue(&song_id, target)
                    .ok_or_else(|| AppError::NotFound("song not found in history".into()))?;
                Ok(None)
            }

            InboundMessage::Play => {
                match self.coordinator.state() {
                    PlaybackState::CountdownAuto
                    | PlaybackState::CountdownApproval
                    | PlaybackState::CountdownAdmin => {
                        if !is_admin {
                            return Err(AppError::Authorization);
                        }
                        let coordinator = Arc::clone(&self.coordinator);
                        tokio::spawn(async move { coordinator.admin_play_now().await });
                    }
                    PlaybackState::Idle => {
                        let coordinator = Arc::clone(&self.coordinator);
                        tokio::spawn(async move { coordinator.play_current().await });
                    }
                    PlaybackState::Playing | PlaybackState::Bgm => {
                        self.media.play().await.map_err(|e| AppError::Media(e.to_string()))?;
                    }
                }
                Ok(None)
            }

            InboundMessage::Pause => {
                self.media.pause().await.map_err(|e| AppError::Media(e.to_string()))?;
                Ok(None)
            }

            InboundMessage::Skip => {
                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move { coordinator.user_skip().await });
                Ok(None)
            }

            InboundMessage::Seek { seconds } => {
                self.media.seek(seconds).await.map_err(|e| AppError::Media(e.to_string()))?;
                Ok(None)
            }

            InboundMessage::SetVocalAssist { vocal_assist } => {
                if let Some(song) = self.queue.current() {
                    if song.added_by.as_str() == key.as_str() {
                        self.queue.set_vocal_assist(&song.id, vocal_assist);
                        let coordinator = Arc::clone(&self.coordinator);
                        let key = key.clone();
                        tokio::spawn(async move { coordinator.on_vocal_assist_changed(&key).await });
                    }
                }
                Ok(None)
            }

            InboundMessage::SetVolume { volume } => {
                self.media.set_volume(volume).await.map_err(|e| AppError::Media(e.to_string()))?;
                Ok(None)
            }

            InboundMessage::SetDisplayName { name } => {
                self.registry.update_profile(key, Some(&name), None);
                self.broadcast_state();
                Ok(None)
            }

            InboundMessage::SetAutoplay { on } => {
                self.queue.set_autoplay(on);
                Ok(None)
            }

            InboundMessage::SetAfk { afk } => {
                self.registry.set_afk(key, afk);
                if afk {
                    self.queue.bump_user_to_end(key);
                } else {
                    self.broadcast_state();
                }
                Ok(None)
            }

            InboundMessage::AdminSetAdmin { key: target, is_admin } => {
                self.registry.set_admin(&ParticipantKey::from(target), is_admin);
                self.broadcast_state();
                self.broadcast_client_list();
                Ok(None)
            }

            InboundMessage::AdminKick { key: target } => {
                let target_key = ParticipantKey::from(target);
                self.remove_users_songs_and_kick(&target_key, "removed by admin").await;
                Ok(None)
            }

            InboundMessage::AdminBlock { key: target, duration_secs, reason } => {
                let target_key = ParticipantKey::from(target);
                self.registry.block(&target_key, duration_secs, reason.clone());
                self.remove_users_songs_and_kick(&target_key, &format!("blocked: {reason}")).await;
                Ok(None)
            }

            InboundMessage::AdminUnblock { key: target } => {
                self.registry.unblock(&ParticipantKey::from(target));
                self.broadcast_state();
                Ok(None)
            }

            InboundMessage::AdminSetAfk { key: target, afk } => {
                let target_key = ParticipantKey::from(target);
                self.registry.set_afk(&target_key, afk);
                if afk {
                    self.queue.bump_user_to_end(&target_key);
                } else {
                    self.broadcast_state();
                }
                Ok(None)
            }

            InboundMessage::AdminPlayNext => {
                self.coordinator
                    .admin_play_next()
                    .await
                    .map_err(|e| AppError::Media(e.to_string()))?;
                Ok(None)
            }

            InboundMessage::AdminStop => {
                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move { coordinator.admin_stop().await });
                Ok(None)
            }

            InboundMessage::AdminSetName { key: target, name } => {
                self.registry.admin_set_name(&ParticipantKey::from(target), &name);
                self.broadcast_state();
                Ok(None)
            }

            InboundMessage::AdminSetNameLock { key: target, locked } => {
                self.registry.set_name_lock(&ParticipantKey::from(target), locked);
                self.broadcast_state();
                Ok(None)
            }
        }
    }

    /// Shared by `admin_kick` and `admin_block`: remove the target's queue
    /// entries (handling current-song removal as in `queue_remove`), then
    /// kick the socket (spec §4.5 dispatch table).
    async fn remove_users_songs_and_kick(self: &Arc<Self>, target_key: &ParticipantKey, reason: &str) {
        let prev_singer = self.queue.current().map(|s| s.added_by.clone());
        let current_removed = self.queue.remove_by_user(target_key);
        if current_removed {
            let coordinator = Arc::clone(&self.coordinator);
            let prev_singer = prev_singer.clone();
            tokio::spawn(async move { coordinator.on_current_removed(prev_singer).await });
        }
        self.kick(target_key, reason).await;
    }

    /// Graceful-shutdown hook (spec §5): tells every live connection it is
    /// going away. Best-effort; in-flight broadcasts are not guaranteed.
    pub async fn shutdown(&self) {
        debug!(count = self.connections.len(), "hub: closing all connections for shutdown");
        for entry in self.connections.iter() {
            let _ = entry
                .value()
                .control_tx
                .try_send(OutboundMessage::error("server shutting down"));
        }
    }
}

async fn writer_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut state_rx: watch::Receiver<RoomState>,
    mut control_rx: mpsc::Receiver<OutboundMessage>,
) {
    // The initial value in a freshly-created `watch` counts as "changed" on
    // the first poll; mark it seen so we don't immediately resend the state
    // already folded into `welcome`.
    state_rx.borrow_and_update();

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if send_one(&mut ws_tx, &OutboundMessage::StateUpdate(state)).await.is_err() {
                    break;
                }
            }
            msg = control_rx.recv() => {
                match msg {
                    Some(out) => {
                        if send_one(&mut ws_tx, &out).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

async fn send_one(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &OutboundMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| "{\"type\":\"error\",\"payload\":{\"message\":\"encode failure\"}}".to_string());
    ws_tx.send(Message::Text(text)).await
}
