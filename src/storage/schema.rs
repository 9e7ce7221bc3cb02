/// DDL for the embedded store (spec §6 "Persisted state layout"). Run once
/// at startup; `CREATE TABLE IF NOT EXISTS` keeps it idempotent across
/// restarts the way a hand-rolled migration would for a single-file crate
/// this size (the teacher has no migration runner either).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    key             TEXT PRIMARY KEY,
    display_name    TEXT NOT NULL,
    avatar          TEXT,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    is_afk          INTEGER NOT NULL DEFAULT 0,
    name_locked     INTEGER NOT NULL DEFAULT 0,
    is_online       INTEGER NOT NULL DEFAULT 0,
    last_seen       INTEGER NOT NULL DEFAULT 0,
    user_agent      TEXT,
    friendly_name   TEXT,
    ip_address      TEXT
);

CREATE TABLE IF NOT EXISTS blocked_users (
    key         TEXT PRIMARY KEY,
    reason      TEXT NOT NULL,
    expires_at  INTEGER
);

CREATE TABLE IF NOT EXISTS queue (
    queue_order     INTEGER NOT NULL,
    id              TEXT PRIMARY KEY,
    media_ref_json  TEXT NOT NULL,
    title           TEXT NOT NULL,
    artist          TEXT NOT NULL,
    duration_sec    REAL NOT NULL,
    thumbnail       TEXT,
    vocal_assist    TEXT NOT NULL,
    added_by        TEXT NOT NULL,
    added_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_state (
    id              INTEGER PRIMARY KEY CHECK (id = 0),
    position        INTEGER NOT NULL DEFAULT 0,
    autoplay        INTEGER NOT NULL DEFAULT 0,
    fair_rotation   INTEGER NOT NULL DEFAULT 0
);
"#;
