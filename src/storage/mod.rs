mod schema;

use crate::model::{BlockRecord, DeviceInfo, MediaRef, ParticipantKey, Session, Song, VocalAssist};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::error;

/// Embedded relational store backing the Session Registry, Queue Engine and
/// block list (spec §6). Every write-through is best-effort: failures are
/// logged and returned to the caller, never panicked on, per the
/// PersistenceError trade-off in §7 ("in-memory state still updated,
/// callers not blocked").
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- sessions ----

    pub fn upsert_session(&self, session: &Session) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (key, display_name, avatar, is_admin, is_afk, name_locked, is_online, last_seen, user_agent, friendly_name, ip_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(key) DO UPDATE SET
                display_name=excluded.display_name,
                avatar=excluded.avatar,
                is_admin=excluded.is_admin,
                is_afk=excluded.is_afk,
                name_locked=excluded.name_locked,
                is_online=excluded.is_online,
                last_seen=excluded.last_seen,
                user_agent=excluded.user_agent,
                friendly_name=excluded.friendly_name,
                ip_address=excluded.ip_address",
            params![
                session.key.as_str(),
                session.display_name,
                session.avatar,
                session.is_admin,
                session.is_afk,
                session.name_locked,
                session.is_online,
                session.last_seen as i64,
                session.device.user_agent,
                session.device.friendly_name,
                session.device.ip_address,
            ],
        )?;
        Ok(())
    }

    pub fn load_sessions(&self) -> rusqlite::Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, display_name, avatar, is_admin, is_afk, name_locked, is_online, last_seen, user_agent, friendly_name, ip_address FROM sessions",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Session {
                key: ParticipantKey(row.get(0)?),
                display_name: row.get(1)?,
                avatar: row.get(2)?,
                is_admin: row.get(3)?,
                is_afk: row.get(4)?,
                name_locked: row.get(5)?,
                is_online: false, // never trust persisted online state across restarts
                last_seen: row.get::<_, i64>(7)? as u64,
                device: DeviceInfo {
                    user_agent: row.get(8)?,
                    friendly_name: row.get(9)?,
                    ip_address: row.get(10)?,
                },
                is_blocked: false,
            })
        })?;
        rows.collect()
    }

    // ---- block list ----

    pub fn upsert_block(&self, block: &BlockRecord) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blocked_users (key, reason, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET reason=excluded.reason, expires_at=excluded.expires_at",
            params![block.key.as_str(), block.reason, block.until.map(|u| u as i64)],
        )?;
        Ok(())
    }

    pub fn remove_block(&self, key: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blocked_users WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn load_blocks(&self) -> rusqlite::Result<Vec<BlockRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, reason, expires_at FROM blocked_users")?;
        let rows = stmt.query_map([], |row| {
            Ok(BlockRecord {
                key: ParticipantKey(row.get(0)?),
                reason: row.get(1)?,
                until: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
            })
        })?;
        rows.collect()
    }

    // ---- queue ----

    /// Replaces the full queue contents and cursor in one transaction, the
    /// way the Queue Engine writes through after every mutation (spec
    /// §4.2 "Persistence").
    pub fn save_queue(
        &self,
        songs: &[Song],
        position: usize,
        autoplay: bool,
        fair_rotation: bool,
    ) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue", [])?;
        for (order, song) in songs.iter().enumerate() {
            let media_ref_json = serde_json::to_string(&song.media_ref)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let vocal_assist = serde_json::to_string(&song.vocal_assist)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.execute(
                "INSERT INTO queue (queue_order, id, media_ref_json, title, artist, duration_sec, thumbnail, vocal_assist, added_by, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    order as i64,
                    song.id,
                    media_ref_json,
                    song.title,
                    song.artist,
                    song.duration_sec,
                    song.thumbnail,
                    vocal_assist,
                    song.added_by.as_str(),
                    song.added_at as i64,
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO queue_state (id, position, autoplay, fair_rotation) VALUES (0, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET position=excluded.position, autoplay=excluded.autoplay, fair_rotation=excluded.fair_rotation",
            params![position as i64, autoplay, fair_rotation],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Loads the persisted queue. Autoplay is forced to `false` by the
    /// caller regardless of the stored value (spec §3, §4.2, invariant 7).
    pub fn load_queue(&self) -> rusqlite::Result<Option<(Vec<Song>, usize, bool, bool)>> {
        let conn = self.conn.lock();
        let state: Option<(i64, bool, bool)> = conn
            .query_row(
                "SELECT position, autoplay, fair_rotation FROM queue_state WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((position, autoplay, fair_rotation)) = state else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, media_ref_json, title, artist, duration_sec, thumbnail, vocal_assist, added_by, added_at
             FROM queue ORDER BY queue_order ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let media_ref_json: String = row.get(1)?;
            let vocal_assist_json: String = row.get(6)?;
            let media_ref: MediaRef = serde_json::from_str(&media_ref_json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
            let vocal_assist: VocalAssist = serde_json::from_str(&vocal_assist_json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
            Ok(Song {
                id: row.get(0)?,
                media_ref,
                title: row.get(2)?,
                artist: row.get(3)?,
                duration_sec: row.get(4)?,
                thumbnail: row.get(5)?,
                vocal_assist,
                added_by: ParticipantKey(row.get(7)?),
                added_at: row.get::<_, i64>(8)? as u64,
            })
        })?;
        let songs: Vec<Song> = rows.collect::<rusqlite::Result<_>>()?;

        Ok(Some((songs, position as usize, autoplay, fair_rotation)))
    }
}

/// Logs and swallows a persistence error at a call site that must not block
/// the in-memory mutation it follows (spec §7 PersistenceError policy).
pub fn log_persistence_err<T>(result: rusqlite::Result<T>, context: &str) {
    if let Err(e) = result {
        error!(error = %e, context, "persistence write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueEngine;
    use std::sync::Arc;

    fn session(key: &str, name: &str) -> Session {
        let mut s = Session::new(ParticipantKey::from(key), name.to_string(), 1_700_000_000);
        s.is_online = true;
        s.is_admin = true;
        s.device = DeviceInfo {
            user_agent: Some("test-agent".to_string()),
            friendly_name: Some("Test Device".to_string()),
            ip_address: Some("192.168.1.5".to_string()),
        };
        s
    }

    fn song(id: &str, added_by: &str) -> Song {
        Song {
            id: id.to_string(),
            media_ref: MediaRef::UrlRef { url: "http://x".into() },
            title: id.to_string(),
            artist: "artist".to_string(),
            duration_sec: 180.0,
            thumbnail: None,
            vocal_assist: VocalAssist::Med,
            added_by: ParticipantKey::from(added_by),
            added_at: 42,
        }
    }

    #[test]
    fn session_round_trips_every_field_except_online_state() {
        let storage = Storage::open_in_memory().unwrap();
        let s = session("abc123", "Alice");
        storage.upsert_session(&s).unwrap();

        let loaded = storage.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        let reloaded = &loaded[0];
        assert_eq!(reloaded.key, s.key);
        assert_eq!(reloaded.display_name, s.display_name);
        assert_eq!(reloaded.avatar, s.avatar);
        assert_eq!(reloaded.is_admin, s.is_admin);
        assert_eq!(reloaded.is_afk, s.is_afk);
        assert_eq!(reloaded.name_locked, s.name_locked);
        assert_eq!(reloaded.last_seen, s.last_seen);
        assert_eq!(reloaded.device, s.device);
        // online state is never trusted across a reload regardless of what
        // was last persisted.
        assert!(!reloaded.is_online);
    }

    #[test]
    fn block_round_trips_through_storage() {
        let storage = Storage::open_in_memory().unwrap();
        let block = BlockRecord {
            key: ParticipantKey::from("blockedkey1"),
            reason: "spam".to_string(),
            until: Some(123_456),
        };
        storage.upsert_block(&block).unwrap();

        let loaded = storage.load_blocks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, block.key);
        assert_eq!(loaded[0].reason, block.reason);
        assert_eq!(loaded[0].until, block.until);
    }

    #[test]
    fn queue_round_trips_songs_and_position_through_storage() {
        let storage = Storage::open_in_memory().unwrap();
        let songs = vec![song("s1", "a"), song("s2", "b")];
        storage.save_queue(&songs, 1, true, true).unwrap();

        let (loaded_songs, position, autoplay, fair_rotation) =
            storage.load_queue().unwrap().unwrap();
        assert_eq!(loaded_songs, songs);
        assert_eq!(position, 1);
        // `Storage` itself round-trips autoplay faithfully; forcing it back
        // off on startup is `QueueEngine::new`'s job, exercised below.
        assert!(autoplay);
        assert!(fair_rotation);
    }

    #[test]
    fn reloaded_queue_engine_forces_autoplay_off_but_keeps_songs_and_position() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage
            .save_queue(&[song("s1", "a"), song("s2", "b")], 1, true, true)
            .unwrap();

        let engine = QueueEngine::new(Arc::clone(&storage));
        assert!(!engine.get_autoplay());
        let snap = engine.snapshot();
        assert_eq!(snap.position, 1);
        assert_eq!(snap.songs.len(), 2);
        assert!(snap.fair_rotation);
    }
}
