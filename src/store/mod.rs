//! Persistent tree of entries mirrored from the remote drive.
//!
//! All mutations go through a single writer connection, each inside its own
//! transaction. Reads use a small pool of extra connections so they can run while
//! a write is in progress.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument, trace, warn};

pub use entry::{Entry, EntryId, EntryKind, SyncState, TimeField};
pub use iter::ChildrenIter;
pub use session::{AuthSession, ChangeCursor};

use crate::error::{FsError, FsResult};
use crate::google_drive::DriveId;
use entry::{entry_from_row, to_seconds, ENTRY_COLUMNS};

pub(crate) mod entry;
mod iter;
mod schema;
mod session;

const MAX_IDLE_READERS: usize = 4;

/// Mode given to directories first seen on the remote.
pub const REMOTE_DIR_MODE: u32 = 0o700;
/// Mode given to files first seen on the remote.
pub const REMOTE_FILE_MODE: u32 = 0o600;

/// Metadata of a remote file or folder as reported by the drive.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub external_id: DriveId,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub checksum: Option<String>,
    /// `None` for the root folder of the drive.
    pub parent_external_id: Option<DriveId>,
}

/// What [`MetadataStore::upsert_by_external_id`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub id: EntryId,
    pub inserted: bool,
    pub previous_checksum: Option<String>,
    /// Id-path the entry had before it was moved to another parent.
    pub moved_from: Option<Vec<EntryId>>,
}

pub struct MetadataStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .finish()
    }
}

impl MetadataStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// Fails with [`FsError::SchemaVersion`] if the file was written by an
    /// incompatible version.
    #[instrument]
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> FsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)?;
        schema::configure(&conn)?;
        schema::prepare(&mut conn)?;
        info!("opened metadata store at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> FsResult<T>) -> FsResult<T> {
        let pooled = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                trace!("opening reader connection");
                let conn = Connection::open(&self.path)?;
                schema::configure(&conn)?;
                conn
            }
        };
        let result = f(&conn);
        let mut pool = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < MAX_IDLE_READERS {
            pool.push(conn);
        }
        result
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&Connection) -> FsResult<T>) -> FsResult<T> {
        let mut conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    //region queries

    pub fn get_by_id(&self, id: EntryId) -> FsResult<Entry> {
        self.read(|conn| get_entry(conn, id))
    }

    pub fn lookup(&self, parent: EntryId, name: &str) -> FsResult<Entry> {
        self.read(|conn| {
            child_named(conn, parent, name)?
                .ok_or_else(|| FsError::not_found(format!("{name:?} in {parent}")))
        })
    }

    pub fn find_by_external_id(&self, external_id: &DriveId) -> FsResult<Option<Entry>> {
        self.read(|conn| find_external(conn, external_id))
    }

    /// Children of `parent` with an id greater than `after`, in ascending id order.
    pub fn list_children(
        &self,
        parent: EntryId,
        after: Option<EntryId>,
        page_size: usize,
    ) -> FsResult<Vec<Entry>> {
        self.read(|conn| {
            require_dir(conn, parent)?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entry
                 WHERE parent_id = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3"
            ))?;
            let after = after.map(|id| id.get()).unwrap_or(0);
            let rows = stmt.query_map(
                params![parent, after, page_size as i64],
                entry_from_row,
            )?;
            let mut children = Vec::new();
            for row in rows {
                children.push(row?);
            }
            Ok(children)
        })
    }

    pub fn children(&self, parent: EntryId, page_size: usize) -> ChildrenIter<'_> {
        ChildrenIter::new(self, parent, page_size)
    }

    /// Ids from the root down to `id`, both included.
    pub fn path_of(&self, id: EntryId) -> FsResult<Vec<EntryId>> {
        self.read(|conn| id_path(conn, id))
    }

    //endregion
    //region local mutations

    #[instrument(skip(self))]
    pub fn create_directory(
        &self,
        parent: EntryId,
        name: &str,
        mode: u32,
        sync_state: SyncState,
        checksum: Option<&str>,
    ) -> FsResult<EntryId> {
        self.write(|conn| {
            insert_entry(
                conn,
                NewEntry {
                    parent,
                    name,
                    kind: EntryKind::Directory,
                    size: 0,
                    mode,
                    sync_state,
                    checksum,
                    external_id: None,
                    mtime: None,
                    ctime: None,
                },
            )
        })
    }

    #[instrument(skip(self))]
    pub fn create_file(
        &self,
        parent: EntryId,
        name: &str,
        size: u64,
        mode: u32,
        sync_state: SyncState,
        checksum: Option<&str>,
    ) -> FsResult<EntryId> {
        self.write(|conn| {
            insert_entry(
                conn,
                NewEntry {
                    parent,
                    name,
                    kind: EntryKind::File,
                    size,
                    mode,
                    sync_state,
                    checksum,
                    external_id: None,
                    mtime: None,
                    ctime: None,
                },
            )
        })
    }

    #[instrument(skip(self))]
    pub fn rename(&self, id: EntryId, new_name: &str) -> FsResult<()> {
        self.write(|conn| {
            let entry = get_entry(conn, id)?;
            let parent = entry.parent_id.ok_or(FsError::RootImmutable)?;
            ensure_name_free(conn, parent, new_name, id)?;
            conn.execute(
                "UPDATE entry SET name = ?1, ctime = ?2 WHERE id = ?3",
                params![new_name, to_seconds(SystemTime::now()), id],
            )?;
            Ok(())
        })
    }

    /// Moves `id` under `new_parent` as `new_name` and returns the id-path it had
    /// before the move.
    #[instrument(skip(self))]
    pub fn move_entry(
        &self,
        id: EntryId,
        new_parent: EntryId,
        new_name: &str,
    ) -> FsResult<Vec<EntryId>> {
        self.write(|conn| {
            let previous = movable(conn, id, new_parent)?;
            ensure_name_free(conn, new_parent, new_name, id)?;
            conn.execute(
                "UPDATE entry SET parent_id = ?1, name = ?2, ctime = ?3 WHERE id = ?4",
                params![new_parent, new_name, to_seconds(SystemTime::now()), id],
            )?;
            Ok(previous)
        })
    }

    /// Fails the way [`Self::move_entry`] would if `id` cannot go under `new_parent`,
    /// without changing anything. Name collisions are not checked.
    pub fn check_move(&self, id: EntryId, new_parent: EntryId) -> FsResult<()> {
        self.read(|conn| movable(conn, id, new_parent).map(|_| ()))
    }

    pub fn chmod(&self, id: EntryId, mode: u32) -> FsResult<()> {
        self.update(
            id,
            "UPDATE entry SET mode = ?1, ctime = ?2 WHERE id = ?3",
            params![mode & 0o7777, to_seconds(SystemTime::now()), id],
        )
    }

    pub fn resize(&self, id: EntryId, size: u64) -> FsResult<()> {
        self.update(
            id,
            "UPDATE entry SET size = ?1 WHERE id = ?2",
            params![size as i64, id],
        )
    }

    pub fn touch(&self, id: EntryId, which: TimeField, timestamp: SystemTime) -> FsResult<()> {
        let sql = format!("UPDATE entry SET {} = ?1 WHERE id = ?2", which.column());
        self.update(id, &sql, params![to_seconds(timestamp), id])
    }

    pub fn set_sync_state(&self, id: EntryId, state: SyncState) -> FsResult<()> {
        self.update(
            id,
            "UPDATE entry SET sync_state = ?1 WHERE id = ?2",
            params![state, id],
        )
    }

    fn update(&self, id: EntryId, sql: &str, params: &[&dyn rusqlite::ToSql]) -> FsResult<()> {
        self.write(|conn| {
            let changed = conn.execute(sql, params)?;
            if changed == 0 {
                return Err(FsError::not_found(id));
            }
            Ok(())
        })
    }

    /// Deletes an entry and returns the id-path it had.
    ///
    /// Directories must be empty. The root can never be removed.
    #[instrument(skip(self))]
    pub fn remove(&self, id: EntryId) -> FsResult<Vec<EntryId>> {
        self.write(|conn| {
            if id.is_root() {
                return Err(FsError::RootImmutable);
            }
            let path = id_path(conn, id)?;
            if has_children(conn, id)? {
                return Err(FsError::DirectoryNotEmpty(id));
            }
            conn.execute("DELETE FROM entry WHERE id = ?1", params![id])?;
            debug!("removed entry {}", id);
            Ok(path)
        })
    }

    pub fn add_ref(&self, id: EntryId) -> FsResult<u32> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE entry SET open_refcount = open_refcount + 1 WHERE id = ?1",
                params![id],
            )?;
            if changed == 0 {
                return Err(FsError::not_found(id));
            }
            refcount(conn, id)
        })
    }

    /// Drops one open reference and returns how many remain.
    pub fn release_ref(&self, id: EntryId) -> FsResult<u32> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE entry SET open_refcount = open_refcount - 1
                 WHERE id = ?1 AND open_refcount > 0",
                params![id],
            )?;
            if changed == 0 {
                // distinguishes a missing entry from one with no references
                get_entry(conn, id)?;
                return Err(FsError::RefcountUnderflow(id));
            }
            refcount(conn, id)
        })
    }

    //endregion
    //region remote reconciliation

    /// Inserts or updates the entry bound to `remote.external_id`.
    ///
    /// A remote entry without a parent is the drive root and gets bound to the
    /// local root. The parent of every other entry must already be known.
    #[instrument(skip(self, remote), fields(external_id = %remote.external_id, name = %remote.name))]
    pub fn upsert_by_external_id(&self, remote: &RemoteEntry) -> FsResult<UpsertOutcome> {
        self.write(|conn| {
            let Some(parent_external_id) = &remote.parent_external_id else {
                return bind_root(conn, remote);
            };
            let parent = find_external(conn, parent_external_id)?
                .ok_or_else(|| FsError::not_found(format!("parent {parent_external_id}")))?;
            if !parent.is_dir() {
                return Err(FsError::NotADirectory(parent.id));
            }

            let Some(existing) = find_external(conn, &remote.external_id)? else {
                let mode = match remote.kind {
                    EntryKind::Directory => REMOTE_DIR_MODE,
                    EntryKind::File => REMOTE_FILE_MODE,
                };
                let id = insert_entry(
                    conn,
                    NewEntry {
                        parent: parent.id,
                        name: &remote.name,
                        kind: remote.kind,
                        size: remote.size,
                        mode,
                        sync_state: SyncState::Clean,
                        checksum: remote.checksum.as_deref(),
                        external_id: Some(&remote.external_id),
                        mtime: Some(remote.mtime),
                        ctime: Some(remote.ctime),
                    },
                )?;
                return Ok(UpsertOutcome {
                    id,
                    inserted: true,
                    previous_checksum: None,
                    moved_from: None,
                });
            };

            if existing.id.is_root() {
                return Err(FsError::RootImmutable);
            }
            let moved = existing.parent_id != Some(parent.id);
            let moved_from = if moved {
                ensure_not_descendant(conn, existing.id, parent.id)?;
                Some(id_path(conn, existing.id)?)
            } else {
                None
            };
            if moved || existing.name != remote.name {
                ensure_name_free(conn, parent.id, &remote.name, existing.id)?;
            }
            conn.execute(
                "UPDATE entry SET name = ?1, kind = ?2, size = ?3, mtime = ?4, ctime = ?5,
                    checksum = ?6, parent_id = ?7, sync_state = ?8
                 WHERE id = ?9",
                params![
                    remote.name,
                    remote.kind,
                    remote.size as i64,
                    to_seconds(remote.mtime),
                    to_seconds(remote.ctime),
                    remote.checksum,
                    parent.id,
                    SyncState::Clean,
                    existing.id
                ],
            )?;
            Ok(UpsertOutcome {
                id: existing.id,
                inserted: false,
                previous_checksum: existing.checksum,
                moved_from,
            })
        })
    }

    /// Deletes tombstoned entries that are neither open nor parents, repeating until
    /// nothing more can go. Returns the id-paths of what was deleted.
    #[instrument(skip(self))]
    pub fn purge_tombstones(&self) -> FsResult<Vec<Vec<EntryId>>> {
        self.write(|conn| {
            let mut purged = Vec::new();
            loop {
                let mut stmt = conn.prepare_cached(
                    "SELECT id FROM entry AS e
                     WHERE e.sync_state = ?1 AND e.open_refcount = 0
                       AND NOT EXISTS (SELECT 1 FROM entry AS c WHERE c.parent_id = e.id)",
                )?;
                let ids = stmt
                    .query_map(params![SyncState::Tombstoned], |row| row.get::<_, EntryId>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if ids.is_empty() {
                    break;
                }
                for id in ids {
                    if id.is_root() {
                        warn!("root entry was tombstoned, restoring it");
                        conn.execute(
                            "UPDATE entry SET sync_state = ?1 WHERE id = ?2",
                            params![SyncState::Clean, id],
                        )?;
                        continue;
                    }
                    purged.push(id_path(conn, id)?);
                    conn.execute("DELETE FROM entry WHERE id = ?1", params![id])?;
                }
            }
            if !purged.is_empty() {
                debug!("purged {} tombstoned entries", purged.len());
            }
            Ok(purged)
        })
    }

    //endregion
}

struct NewEntry<'a> {
    parent: EntryId,
    name: &'a str,
    kind: EntryKind,
    size: u64,
    mode: u32,
    sync_state: SyncState,
    checksum: Option<&'a str>,
    external_id: Option<&'a DriveId>,
    mtime: Option<SystemTime>,
    ctime: Option<SystemTime>,
}

fn insert_entry(conn: &Connection, new: NewEntry<'_>) -> FsResult<EntryId> {
    require_dir(conn, new.parent)?;
    if child_named(conn, new.parent, new.name)?.is_some() {
        return Err(FsError::Conflict {
            parent: new.parent,
            name: new.name.to_string(),
        });
    }
    let now = SystemTime::now();
    let mtime = new.mtime.unwrap_or(now);
    let ctime = new.ctime.unwrap_or(now);
    conn.execute(
        "INSERT INTO entry (external_id, name, kind, size, mode, atime, mtime, ctime,
            sync_state, checksum, parent_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            new.external_id.map(DriveId::as_str),
            new.name,
            new.kind,
            new.size as i64,
            new.mode & 0o7777,
            to_seconds(mtime),
            to_seconds(mtime),
            to_seconds(ctime),
            new.sync_state,
            new.checksum,
            new.parent
        ],
    )?;
    let id = EntryId::new(conn.last_insert_rowid());
    trace!("inserted entry {} ({:?}) under {}", id, new.name, new.parent);
    Ok(id)
}

fn bind_root(conn: &Connection, remote: &RemoteEntry) -> FsResult<UpsertOutcome> {
    let root = get_entry(conn, EntryId::ROOT)?;
    conn.execute(
        "UPDATE entry SET external_id = NULL WHERE external_id = ?1 AND id != ?2",
        params![remote.external_id.as_str(), EntryId::ROOT],
    )?;
    conn.execute(
        "UPDATE entry SET external_id = ?1, mtime = ?2, ctime = ?3, sync_state = ?4
         WHERE id = ?5",
        params![
            remote.external_id.as_str(),
            to_seconds(remote.mtime),
            to_seconds(remote.ctime),
            SyncState::Clean,
            EntryId::ROOT
        ],
    )?;
    if root.external_id.as_ref() != Some(&remote.external_id) {
        info!("bound root to {}", remote.external_id);
    }
    Ok(UpsertOutcome {
        id: EntryId::ROOT,
        inserted: false,
        previous_checksum: root.checksum,
        moved_from: None,
    })
}

fn get_entry(conn: &Connection, id: EntryId) -> FsResult<Entry> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {ENTRY_COLUMNS} FROM entry WHERE id = ?1"))?;
    stmt.query_row(params![id], entry_from_row)
        .optional()?
        .ok_or_else(|| FsError::not_found(id))
}

fn require_dir(conn: &Connection, id: EntryId) -> FsResult<Entry> {
    let entry = get_entry(conn, id)?;
    if !entry.is_dir() {
        return Err(FsError::NotADirectory(id));
    }
    Ok(entry)
}

fn find_external(conn: &Connection, external_id: &DriveId) -> FsResult<Option<Entry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entry WHERE external_id = ?1"
    ))?;
    Ok(stmt
        .query_row(params![external_id.as_str()], entry_from_row)
        .optional()?)
}

fn child_named(conn: &Connection, parent: EntryId, name: &str) -> FsResult<Option<Entry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entry WHERE parent_id = ?1 AND name = ?2"
    ))?;
    Ok(stmt.query_row(params![parent, name], entry_from_row).optional()?)
}

fn ensure_name_free(conn: &Connection, parent: EntryId, name: &str, own: EntryId) -> FsResult<()> {
    match child_named(conn, parent, name)? {
        Some(other) if other.id != own => Err(FsError::Conflict {
            parent,
            name: name.to_string(),
        }),
        _ => Ok(()),
    }
}

fn has_children(conn: &Connection, id: EntryId) -> FsResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM entry WHERE parent_id = ?1 LIMIT 1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn refcount(conn: &Connection, id: EntryId) -> FsResult<u32> {
    let count: i64 = conn.query_row(
        "SELECT open_refcount FROM entry WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u32)
}

fn id_path(conn: &Connection, id: EntryId) -> FsResult<Vec<EntryId>> {
    let mut stmt = conn.prepare_cached("SELECT parent_id FROM entry WHERE id = ?1")?;
    let mut path = vec![id];
    let mut seen = HashSet::from([id]);
    let mut current = id;
    loop {
        let parent: Option<Option<EntryId>> =
            stmt.query_row(params![current], |row| row.get(0)).optional()?;
        match parent {
            None => return Err(FsError::not_found(current)),
            Some(None) => break,
            Some(Some(parent)) => {
                if !seen.insert(parent) {
                    return Err(FsError::CorruptTree(id));
                }
                path.push(parent);
                current = parent;
            }
        }
    }
    path.reverse();
    Ok(path)
}

/// Id-path of `id` if it may be moved under `new_parent`.
fn movable(conn: &Connection, id: EntryId, new_parent: EntryId) -> FsResult<Vec<EntryId>> {
    if id.is_root() {
        return Err(FsError::RootImmutable);
    }
    let previous = id_path(conn, id)?;
    require_dir(conn, new_parent)?;
    ensure_not_descendant(conn, id, new_parent)?;
    Ok(previous)
}

fn ensure_not_descendant(conn: &Connection, id: EntryId, new_parent: EntryId) -> FsResult<()> {
    if id_path(conn, new_parent)?.contains(&id) {
        return Err(FsError::InvalidMove { id, new_parent });
    }
    Ok(())
}
