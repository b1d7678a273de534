//! SQLite-backed implementation of [`StateStore`] and [`ProjectRegistry`].

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::schema::{PROJECTS_SQL, RUN_STATES_SQL};
use crate::traits::{ProjectRegistry, StateStore};
use crate::types::*;
use agentdesk_core::{Error, Result};

/// SQLite store holding run states, projects and messages.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteStore {
    /// Open or create the store.
    ///
    /// `db_dir` is the directory (e.g., `data/db/`). The file will be `db_dir/agentdesk.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let db_path = db_dir.join("agentdesk.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let projects = store.count_projects()?;
        let active = store.list_active()?.len();
        info!(
            "SqliteStore initialized: {} projects, {} active runs, path={}",
            projects,
            active,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", PROJECTS_SQL, RUN_STATES_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::StoreUnavailable(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn count_projects(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count)
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_run_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunState> {
        let json_col = |name: &str| -> rusqlite::Result<Option<serde_json::Value>> {
            let raw = match row.get::<_, Option<String>>(name)? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Discarding unreadable {} ({} bytes): {}", name, raw.len(), e);
                    Ok(None)
                }
            }
        };
        Ok(RunState {
            project_id: row.get("project_id")?,
            is_active: row.get("is_active")?,
            is_completed: row.get("is_completed")?,
            token_usage: u64::try_from(row.get::<_, i64>("token_usage")?).unwrap_or(0),
            browser_session: json_col("browser_session")?,
            terminal_session: json_col("terminal_session")?,
            run_id: row.get("run_id")?,
            mode: row
                .get::<_, Option<String>>("mode")?
                .as_deref()
                .and_then(RunMode::parse),
            heartbeat_at: row.get("heartbeat_at")?,
            last_error: row.get("last_error")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            id: row.get("id")?,
            project: row.get("project")?,
            from_agent: row.get("from_agent")?,
            text: row.get("text")?,
            timestamp: row.get("timestamp")?,
        })
    }
}

// ---------------------------------------------------------------
// Run State
// ---------------------------------------------------------------

impl StateStore for SqliteStore {
    fn get(&self, project_id: &str) -> Result<Option<RunState>> {
        let conn = self.conn.lock();
        let state = conn
            .prepare_cached("SELECT * FROM run_states WHERE project_id = ?1")
            .map_err(db_err)?
            .query_row(params![project_id], Self::row_to_run_state)
            .optional()
            .map_err(db_err)?;
        Ok(state)
    }

    fn put(&self, state: &RunState) -> Result<()> {
        let browser = state
            .browser_session
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let terminal = state
            .terminal_session
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO run_states (
                project_id, is_active, is_completed, token_usage, browser_session,
                terminal_session, run_id, mode, heartbeat_at, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(project_id) DO UPDATE SET
                is_active = excluded.is_active,
                is_completed = excluded.is_completed,
                token_usage = excluded.token_usage,
                browser_session = excluded.browser_session,
                terminal_session = excluded.terminal_session,
                run_id = excluded.run_id,
                mode = excluded.mode,
                heartbeat_at = excluded.heartbeat_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .map_err(db_err)?
        .execute(params![
            state.project_id,
            state.is_active,
            state.is_completed,
            i64::try_from(state.token_usage).unwrap_or(i64::MAX),
            browser,
            terminal,
            state.run_id,
            state.mode.map(|m| m.as_str()),
            state.heartbeat_at,
            state.last_error,
            state.updated_at,
        ])
        .map_err(db_err)?;
        debug!(
            "Stored run state for {}: active={}, completed={}",
            state.project_id, state.is_active, state.is_completed
        );
        Ok(())
    }

    fn delete(&self, project_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM run_states WHERE project_id = ?1", params![project_id])
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn latest_token_usage(&self, project_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let usage: Option<i64> = conn
            .prepare_cached("SELECT token_usage FROM run_states WHERE project_id = ?1")
            .map_err(db_err)?
            .query_row(params![project_id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(usage.and_then(|u| u64::try_from(u).ok()).unwrap_or(0))
    }

    fn list_active(&self) -> Result<Vec<RunState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM run_states WHERE is_active = 1 ORDER BY project_id")
            .map_err(db_err)?;
        let rows = stmt.query_map([], Self::row_to_run_state).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

// ---------------------------------------------------------------
// Projects & Messages
// ---------------------------------------------------------------

impl ProjectRegistry for SqliteStore {
    fn create_project(&self, name: &str) -> Result<Project> {
        let project = Project {
            name: name.to_string(),
            created_at: now_millis(),
        };
        let conn = self.conn.lock();
        conn.prepare_cached("INSERT INTO projects (name, created_at) VALUES (?1, ?2)")
            .map_err(db_err)?
            .execute(params![project.name, project.created_at])
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint") {
                    Error::ProjectExists(name.to_string())
                } else {
                    db_err(e)
                }
            })?;
        info!("Project created: {}", name);
        Ok(project)
    }

    fn project_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .prepare_cached("SELECT 1 FROM projects WHERE name = ?1")
            .map_err(db_err)?
            .query_row(params![name], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT name, created_at FROM projects ORDER BY created_at, name")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Project {
                    name: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete_project(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM run_states WHERE project_id = ?1", params![name])
            .map_err(db_err)?;
        let count = tx
            .execute("DELETE FROM projects WHERE name = ?1", params![name])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if count > 0 {
            info!("Project deleted: {}", name);
        }
        Ok(count > 0)
    }

    fn add_message(&self, project: &str, from_agent: bool, text: &str) -> Result<Message> {
        let timestamp = now_millis();
        let conn = self.conn.lock();
        let id = conn
            .prepare_cached(
                "INSERT INTO messages (project, from_agent, text, timestamp) VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(db_err)?
            .insert(params![project, from_agent, text, timestamp])
            .map_err(|e| {
                if e.to_string().contains("FOREIGN KEY constraint") {
                    Error::UnknownProject(project.to_string())
                } else {
                    db_err(e)
                }
            })?;
        Ok(Message {
            id,
            project: project.to_string(),
            from_agent,
            text: text.to_string(),
            timestamp,
        })
    }

    fn get_messages(&self, project: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM messages WHERE project = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![project], Self::row_to_message)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
