use std::time::{Duration, SystemTime};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{FsError, FsResult};
use crate::store::entry::to_seconds;
use crate::store::{EntryKind, SyncState};

/// Bumped whenever the tables below change shape. Databases written with another
/// version are refused instead of migrated.
pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) const ROOT_NAME: &str = "/";
pub(crate) const ROOT_MODE: u32 = 0o700;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT UNIQUE,
    name TEXT NOT NULL,
    kind INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    mode INTEGER NOT NULL,
    atime REAL NOT NULL,
    mtime REAL NOT NULL,
    ctime REAL NOT NULL,
    sync_state INTEGER NOT NULL,
    checksum TEXT,
    parent_id INTEGER REFERENCES entry (id),
    open_refcount INTEGER NOT NULL DEFAULT 0 CHECK (open_refcount >= 0),
    UNIQUE (parent_id, name)
);
CREATE INDEX IF NOT EXISTS entry_parent ON entry (parent_id, id);

-- single row: the OAuth credential of the account
CREATE TABLE IF NOT EXISTS auth_session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    token_type TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expiry REAL NOT NULL
);

-- single row: how far the remote change feed has been applied
CREATE TABLE IF NOT EXISTS change_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    token TEXT NOT NULL
);
"#;

/// Per-connection settings, applied to the writer and to every pooled reader.
pub(crate) fn configure(conn: &Connection) -> FsResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("journal_mode: {}", mode);
    Ok(())
}

/// Creates the tables and the root entry on first use and checks the schema version.
pub(crate) fn prepare(conn: &mut Connection) -> FsResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(VERSION_TABLE)?;
    let found: Option<i64> = tx
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;
    match found {
        None => {
            info!("initializing schema version {}", SCHEMA_VERSION);
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(version) if version != SCHEMA_VERSION => {
            return Err(FsError::SchemaVersion {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }
        Some(_) => {}
    }
    tx.execute_batch(SCHEMA)?;

    let now = to_seconds(SystemTime::now());
    let created = tx.execute(
        "INSERT INTO entry (id, name, kind, size, mode, atime, mtime, ctime, sync_state, parent_id)
         SELECT 1, ?1, ?2, 0, ?3, ?4, ?4, ?4, ?5, NULL
         WHERE NOT EXISTS (SELECT 1 FROM entry WHERE parent_id IS NULL)",
        params![
            ROOT_NAME,
            EntryKind::Directory,
            ROOT_MODE,
            now,
            SyncState::Clean
        ],
    )?;
    if created > 0 {
        info!("created root entry");
    }
    tx.commit()?;
    Ok(())
}
