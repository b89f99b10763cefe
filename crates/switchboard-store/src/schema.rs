//! Session store DDL as an ordered list of migrations. A database records the
//! highest applied step in `schema_version`; opening applies whatever is newer.

pub struct Migration {
    pub version: u32,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE sessions (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL DEFAULT 'disconnected',
                external_id TEXT NOT NULL DEFAULT '',
                qr_code     TEXT NOT NULL DEFAULT '',
                proxy_url   TEXT,
                is_active   INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX idx_sessions_status ON sessions(status);
            CREATE INDEX idx_sessions_active ON sessions(is_active);
        ",
    },
];

/// Highest version in [`MIGRATIONS`].
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

pub const VERSION_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)";

/// Per-connection settings; `journal_mode` is a no-op for in-memory databases.
pub const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA busy_timeout = 5000;
    PRAGMA foreign_keys = ON;
";
