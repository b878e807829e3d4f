/// Sessions and chat turns. Applied on every start; every statement is idempotent.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        status BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_status_user ON sessions (status, user_id);

    -- At most one open session per user
    CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
        ON sessions (user_id) WHERE status = 1 AND deleted_at = 0;

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER REFERENCES sessions (id),
        from_user_id TEXT NOT NULL,
        to_user_id TEXT NOT NULL,
        content TEXT NOT NULL,
        spouse_id INTEGER REFERENCES messages (id),
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session_from ON messages (session_id, from_user_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_messages_session_to ON messages (session_id, to_user_id, created_at);
";
