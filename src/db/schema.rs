/// Schema for the offline store.
///
/// Each table is an independent partition; there are no cross-table keys.
pub const SCHEMA: &str = r#"
-- Response cache, one namespace per partition generation
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    identity TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key_hash)
);

-- Mutating requests waiting for replay
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

-- Last known assignment, overwritten wholesale
CREATE TABLE IF NOT EXISTS emergency_assignments (
    cache_key TEXT PRIMARY KEY,
    assignment_id TEXT,
    payload TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

-- Position samples, append-only until synced
CREATE TABLE IF NOT EXISTS location_updates (
    timestamp INTEGER PRIMARY KEY,
    ambulance_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_location_updates_synced
    ON location_updates(synced, timestamp);
"#;
