//! Database schema SQL.

/// Projects and their conversation history.
pub const PROJECTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL REFERENCES projects(name) ON DELETE CASCADE,
    from_agent INTEGER NOT NULL,
    text TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project);
"#;

/// One run-state row per project. Deliberately not a foreign key: the state
/// store accepts any project id and project deletion removes it explicitly.
pub const RUN_STATES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS run_states (
    project_id TEXT PRIMARY KEY,
    is_active INTEGER NOT NULL DEFAULT 0,
    is_completed INTEGER NOT NULL DEFAULT 0,
    token_usage INTEGER NOT NULL DEFAULT 0,
    browser_session TEXT,
    terminal_session TEXT,
    run_id TEXT,
    mode TEXT,
    heartbeat_at INTEGER,
    last_error TEXT,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_states_active ON run_states(is_active);
"#;
