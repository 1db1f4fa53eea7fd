//! Build history schema.
//!
//! `CURRENT` creates a fresh database. `MIGRATIONS` upgrades an existing
//! one step by step; entry `n` brings a version `n - 1` database to `n`.

pub const SCHEMA_VERSION: i32 = 2;

pub const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub const CURRENT: &str = "
CREATE TABLE builds (
    id TEXT PRIMARY KEY NOT NULL,
    project TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT,
    input_digest TEXT,
    environment_digest TEXT,
    image_digest TEXT,
    base_digest TEXT,
    failed_stage TEXT,
    error TEXT
);

CREATE INDEX idx_builds_input_digest ON builds(input_digest);
CREATE INDEX idx_builds_created_at ON builds(created_at);
";

/// `(version, sql)`, ascending.
pub const MIGRATIONS: &[(i32, &str)] = &[(2, "ALTER TABLE builds ADD COLUMN base_digest TEXT;")];
