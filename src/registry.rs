use crate::model::{now_secs, BlockRecord, DeviceInfo, ParticipantKey, Session};
use crate::names;
use crate::storage::{log_persistence_err, Storage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Identity lifecycle, profile and moderation flags for every participant
/// that has ever connected (spec §4.1). Sessions are never destroyed:
/// offline sessions persist for history references (e.g. `addedBy` on
/// queue entries surviving a disconnect).
///
/// Guarded by a single `parking_lot::RwLock` rather than `tokio::sync`,
/// since every operation here is pure in-memory bookkeeping plus a
/// synchronous sqlite write — never an `.await` — matching the lock
/// discipline in spec §5 (acquired in the canonical Queue -> Session ->
/// Coordinator -> Hub order, never held across a suspension point).
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    blocks: RwLock<HashMap<String, BlockRecord>>,
    storage: Arc<Storage>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        let sessions = storage.load_sessions().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load sessions from storage, starting empty");
            Vec::new()
        });
        let blocks = storage.load_blocks().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load block list from storage, starting empty");
            Vec::new()
        });

        let sessions = sessions
            .into_iter()
            .map(|s| (s.key.as_str().to_string(), s))
            .collect();
        let blocks = blocks
            .into_iter()
            .map(|b| (b.key.as_str().to_string(), b))
            .collect();

        Self {
            sessions: RwLock::new(sessions),
            blocks: RwLock::new(blocks),
            storage,
        }
    }

    /// Returns the existing session for `key`, or creates one with a unique
    /// auto-generated display name. Never overwrites a `nameLocked` name;
    /// otherwise adopts `proposed_name` only if it is nonempty and the
    /// stored name is still an untouched default (spec §4.1).
    pub fn get_or_create(&self, key: &ParticipantKey, proposed_name: &str) -> Session {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(key.as_str()) {
                if existing.name_locked || proposed_name.is_empty() {
                    return existing.clone();
                }
                if !names::is_auto_generated(&existing.display_name) {
                    return existing.clone();
                }
            }
        }

        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get_mut(key.as_str()) {
            if !existing.name_locked
                && !proposed_name.is_empty()
                && names::is_auto_generated(&existing.display_name)
            {
                existing.display_name = proposed_name.to_string();
                let snapshot = existing.clone();
                drop(sessions);
                log_persistence_err(self.storage.upsert_session(&snapshot), "upsert_session");
                return snapshot;
            }
            return existing.clone();
        }

        let taken: std::collections::HashSet<String> =
            sessions.values().map(|s| s.display_name.clone()).collect();
        let display_name = if !proposed_name.is_empty() {
            proposed_name.to_string()
        } else {
            names::unique_default_name(|n| taken.contains(n))
        };

        let session = Session::new(key.clone(), display_name, now_secs());
        sessions.insert(key.as_str().to_string(), session.clone());
        drop(sessions);

        info!(key = %key, name = %session.display_name, "session created");
        log_persistence_err(self.storage.upsert_session(&session), "upsert_session");
        session
    }

    /// Rejected silently (no-op) if the session is `nameLocked`.
    pub fn update_profile(&self, key: &ParticipantKey, name: Option<&str>, avatar: Option<&str>) {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(key.as_str()) else {
            return;
        };
        if session.name_locked {
            return;
        }
        if let Some(name) = name {
            if !name.is_empty() {
                session.display_name = name.to_string();
            }
        }
        if let Some(avatar) = avatar {
            use base64::Engine;
            if base64::engine::general_purpose::STANDARD.decode(avatar).is_ok() {
                session.avatar = Some(avatar.to_string());
            } else {
                warn!(key = %key, "rejected avatar update: not valid base64");
            }
        }
        let snapshot = session.clone();
        drop(sessions);
        log_persistence_err(self.storage.upsert_session(&snapshot), "upsert_session");
    }

    pub fn admin_set_name(&self, key: &ParticipantKey, name: &str) {
        self.mutate(key, |s| s.display_name = name.to_string());
    }

    pub fn set_name_lock(&self, key: &ParticipantKey, locked: bool) {
        self.mutate(key, |s| s.name_locked = locked);
    }

    pub fn set_admin(&self, key: &ParticipantKey, is_admin: bool) {
        self.mutate(key, |s| s.is_admin = is_admin);
    }

    pub fn set_afk(&self, key: &ParticipantKey, is_afk: bool) {
        self.mutate(key, |s| s.is_afk = is_afk);
    }

    pub fn set_online(&self, key: &ParticipantKey, is_online: bool) {
        self.mutate(key, |s| {
            s.is_online = is_online;
            s.last_seen = now_secs();
        });
    }

    pub fn update_device(&self, key: &ParticipantKey, device: DeviceInfo) {
        self.mutate(key, |s| s.device = device);
    }

    fn mutate(&self, key: &ParticipantKey, f: impl FnOnce(&mut Session)) {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(key.as_str()) else {
            return;
        };
        f(session);
        let snapshot = session.clone();
        drop(sessions);
        log_persistence_err(self.storage.upsert_session(&snapshot), "upsert_session");
    }

    pub fn get(&self, key: &ParticipantKey) -> Option<Session> {
        self.sessions.read().get(key.as_str()).cloned()
    }

    /// `duration == 0` means permanent.
    pub fn block(&self, key: &ParticipantKey, duration_secs: u64, reason: String) {
        let until = if duration_secs == 0 {
            None
        } else {
            Some(now_secs() + duration_secs)
        };
        let record = BlockRecord {
            key: key.clone(),
            reason,
            until,
        };
        self.blocks.write().insert(key.as_str().to_string(), record.clone());
        info!(key = %key, "session blocked");
        log_persistence_err(self.storage.upsert_block(&record), "upsert_block");
    }

    pub fn unblock(&self, key: &ParticipantKey) {
        self.blocks.write().remove(key.as_str());
        log_persistence_err(self.storage.remove_block(key.as_str()), "remove_block");
    }

    /// True iff a non-expired block record exists. Expired records are
    /// pruned lazily on read.
    pub fn is_blocked(&self, key: &ParticipantKey) -> (bool, Option<String>) {
        let now = now_secs();
        let mut blocks = self.blocks.write();
        if let Some(record) = blocks.get(key.as_str()) {
            if record.is_expired(now) {
                let reason = record.reason.clone();
                blocks.remove(key.as_str());
                drop(blocks);
                log_persistence_err(self.storage.remove_block(key.as_str()), "remove_block");
                return (false, Some(reason));
            }
            return (true, Some(record.reason.clone()));
        }
        (false, None)
    }

    /// Sessions that are online or have been seen within the last 10
    /// minutes. Blocked users remain listed with their flag rather than
    /// removed (Design Notes open question, resolved as listed-with-flag).
    pub fn list_active(&self) -> Vec<Session> {
        const RECENT_WINDOW_SECS: u64 = 600;
        let now = now_secs();
        let sessions = self.sessions.read();
        let blocks = self.blocks.read();
        sessions
            .values()
            .filter(|s| s.is_online || now.saturating_sub(s.last_seen) <= RECENT_WINDOW_SECS)
            .map(|s| {
                let mut s = s.clone();
                s.is_blocked = blocks
                    .get(s.key.as_str())
                    .map(|b| !b.is_expired(now))
                    .unwrap_or(false);
                s
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(Storage::open_in_memory().unwrap()))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let reg = registry();
        let key = ParticipantKey::from("abcd1234abcd1234");
        let s1 = reg.get_or_create(&key, "Alice");
        let s2 = reg.get_or_create(&key, "");
        assert_eq!(s1.key, s2.key);
        assert_eq!(s1.display_name, "Alice");
        assert_eq!(s2.display_name, "Alice");
    }

    #[test]
    fn name_lock_prevents_overwrite() {
        let reg = registry();
        let key = ParticipantKey::from("lockedkey0000001");
        reg.get_or_create(&key, "Original");
        reg.set_name_lock(&key, true);
        reg.update_profile(&key, Some("Renamed"), None);
        assert_eq!(reg.get(&key).unwrap().display_name, "Original");
    }

    #[test]
    fn proposed_name_only_overwrites_default() {
        let reg = registry();
        let key = ParticipantKey::from("renamekey0000001");
        let created = reg.get_or_create(&key, "");
        assert!(names::is_auto_generated(&created.display_name));
        let updated = reg.get_or_create(&key, "Chosen Name");
        assert_eq!(updated.display_name, "Chosen Name");
        // now that the name is a real, non-default name, a second proposal is ignored
        let again = reg.get_or_create(&key, "Other Name");
        assert_eq!(again.display_name, "Chosen Name");
    }

    #[test]
    fn block_and_expiry() {
        let reg = registry();
        let key = ParticipantKey::from("blockedkey000001");
        reg.block(&key, 0, "spam".to_string());
        let (blocked, reason) = reg.is_blocked(&key);
        assert!(blocked);
        assert_eq!(reason.unwrap(), "spam");
        reg.unblock(&key);
        assert!(!reg.is_blocked(&key).0);
    }

    #[test]
    fn setters_are_idempotent() {
        let reg = registry();
        let key = ParticipantKey::from("adminkey00000001");
        reg.get_or_create(&key, "Admin");
        reg.set_admin(&key, true);
        reg.set_admin(&key, true);
        assert!(reg.get(&key).unwrap().is_admin);
    }
}
