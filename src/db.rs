//! Embedded persistent store for `AgentSession` rows and key/value app
//! settings (§6). Schema evolves through an additive migration table, the
//! same pattern used for every other piece of persisted state in this
//! lineage.

use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;

use crate::error::{DaemonError, DaemonResult};
use crate::models::{AgentSession, AgentType};

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/0001_init.sql"),
}];

pub fn open_database(path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    let mut conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    migrate(&mut conn)?;
    Ok(conn)
}

pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    ensure_meta_table(conn)?;
    let current_version = read_schema_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            apply_migration(conn, migration)?;
        }
    }

    Ok(latest_version())
}

fn latest_version() -> u32 {
    MIGRATIONS
        .last()
        .map(|migration| migration.version)
        .unwrap_or(0)
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn ensure_meta_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1;",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value
        .as_deref()
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(0))
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    write_schema_version(&tx, migration.version)?;
    tx.commit()?;
    Ok(())
}

fn write_schema_version(tx: &Transaction<'_>, version: u32) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2);",
        (SCHEMA_VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

fn agent_type_to_sql(agent_type: AgentType) -> &'static str {
    agent_type.as_str()
}

fn agent_type_from_sql(raw: &str) -> AgentType {
    match raw {
        "claude" => AgentType::Claude,
        "codex" => AgentType::Codex,
        "pi" => AgentType::Pi,
        _ => AgentType::Unknown,
    }
}

pub fn upsert_agent_session(conn: &Connection, row: &AgentSession) -> DaemonResult<()> {
    let _timer = crate::metrics::Timer::new(&crate::metrics::METRICS.db_write);
    conn.execute(
        r#"
        INSERT INTO agent_sessions (
            session_id, agent_type, project_path, log_file_path, display_name,
            current_window, last_activity_at, created_at, last_user_message,
            is_pinned, last_resume_error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(session_id) DO UPDATE SET
            agent_type = excluded.agent_type,
            project_path = excluded.project_path,
            log_file_path = excluded.log_file_path,
            display_name = excluded.display_name,
            current_window = excluded.current_window,
            last_activity_at = excluded.last_activity_at,
            last_user_message = excluded.last_user_message,
            is_pinned = excluded.is_pinned,
            last_resume_error = excluded.last_resume_error;
        "#,
        rusqlite::params![
            row.session_id,
            agent_type_to_sql(row.agent_type),
            row.project_path,
            row.log_file_path,
            row.display_name,
            row.current_window,
            row.last_activity_at,
            row.created_at,
            row.last_user_message,
            row.is_pinned as i64,
            row.last_resume_error,
        ],
    )
    .map_err(DaemonError::from)?;
    Ok(())
}

pub fn get_agent_session(conn: &Connection, session_id: &str) -> DaemonResult<Option<AgentSession>> {
    conn.query_row(
        "SELECT session_id, agent_type, project_path, log_file_path, display_name, \
         current_window, last_activity_at, created_at, last_user_message, is_pinned, last_resume_error \
         FROM agent_sessions WHERE session_id = ?1;",
        [session_id],
        row_to_agent_session,
    )
    .optional()
    .map_err(DaemonError::from)
}

pub fn list_agent_sessions(conn: &Connection) -> DaemonResult<Vec<AgentSession>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, agent_type, project_path, log_file_path, display_name, \
         current_window, last_activity_at, created_at, last_user_message, is_pinned, last_resume_error \
         FROM agent_sessions;",
    )?;
    let rows = stmt
        .query_map([], row_to_agent_session)
        .map_err(DaemonError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(DaemonError::from)?);
    }
    Ok(out)
}

pub fn list_pinned_orphans(conn: &Connection) -> DaemonResult<Vec<AgentSession>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, agent_type, project_path, log_file_path, display_name, \
         current_window, last_activity_at, created_at, last_user_message, is_pinned, last_resume_error \
         FROM agent_sessions WHERE is_pinned = 1 AND current_window IS NULL;",
    )?;
    let rows = stmt
        .query_map([], row_to_agent_session)
        .map_err(DaemonError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(DaemonError::from)?);
    }
    Ok(out)
}

pub fn set_pinned(conn: &Connection, session_id: &str, pinned: bool) -> DaemonResult<()> {
    conn.execute(
        "UPDATE agent_sessions SET is_pinned = ?2 WHERE session_id = ?1;",
        rusqlite::params![session_id, pinned as i64],
    )
    .map_err(DaemonError::from)?;
    Ok(())
}

pub fn set_resume_error(conn: &Connection, session_id: &str, error: Option<&str>) -> DaemonResult<()> {
    conn.execute(
        "UPDATE agent_sessions SET last_resume_error = ?2 WHERE session_id = ?1;",
        rusqlite::params![session_id, error],
    )
    .map_err(DaemonError::from)?;
    Ok(())
}

fn row_to_agent_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        session_id: row.get(0)?,
        agent_type: agent_type_from_sql(&row.get::<_, String>(1)?),
        project_path: row.get(2)?,
        log_file_path: row.get(3)?,
        display_name: row.get(4)?,
        current_window: row.get(5)?,
        last_activity_at: row.get(6)?,
        created_at: row.get(7)?,
        last_user_message: row.get(8)?,
        is_pinned: row.get::<_, i64>(9)? != 0,
        last_resume_error: row.get(10)?,
    })
}

pub fn get_app_setting(conn: &Connection, key: &str) -> DaemonResult<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_settings WHERE key = ?1;",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(DaemonError::from)
}

pub fn set_app_setting(conn: &Connection, key: &str, value: &str) -> DaemonResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO app_settings (key, value) VALUES (?1, ?2);",
        [key, value],
    )
    .map_err(DaemonError::from)?;
    Ok(())
}
