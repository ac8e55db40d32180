use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;

use crate::google_drive::DriveId;

/// Locally assigned identity of an entry. Doubles as the inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(i64);

impl EntryId {
    pub const ROOT: EntryId = EntryId(1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
    pub fn ino(&self) -> u64 {
        self.0 as u64
    }
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntryId {
    fn from(value: u64) -> EntryId {
        EntryId(value as i64)
    }
}

impl From<i64> for EntryId {
    fn from(value: i64) -> EntryId {
        EntryId(value)
    }
}

impl ToSql for EntryId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for EntryId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(EntryId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    File,
}

impl EntryKind {
    fn code(&self) -> i64 {
        match self {
            EntryKind::Directory => 1,
            EntryKind::File => 2,
        }
    }
}

impl ToSql for EntryKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for EntryKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            1 => Ok(EntryKind::Directory),
            2 => Ok(EntryKind::File),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// Whether the local state of an entry has been reconciled with the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Clean,
    /// changed or created locally
    Dirty,
    /// removed, waiting for its last handle or child to go away
    Tombstoned,
}

impl SyncState {
    fn code(&self) -> i64 {
        match self {
            SyncState::Dirty => 0,
            SyncState::Clean => 1,
            SyncState::Tombstoned => -1,
        }
    }
}

impl ToSql for SyncState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for SyncState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(SyncState::Dirty),
            1 => Ok(SyncState::Clean),
            -1 => Ok(SyncState::Tombstoned),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// Which timestamp `touch` updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Access,
    Modify,
    Change,
}

impl TimeField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            TimeField::Access => "atime",
            TimeField::Modify => "mtime",
            TimeField::Change => "ctime",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub external_id: Option<DriveId>,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub sync_state: SyncState,
    pub checksum: Option<String>,
    pub parent_id: Option<EntryId>,
    pub open_refcount: u32,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
    pub fn is_tombstoned(&self) -> bool {
        self.sync_state == SyncState::Tombstoned
    }
}

pub(crate) const ENTRY_COLUMNS: &str = "id, external_id, name, kind, size, mode, atime, mtime, \
     ctime, sync_state, checksum, parent_id, open_refcount";

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let external_id: Option<String> = row.get(1)?;
    let size: i64 = row.get(4)?;
    let mode: i64 = row.get(5)?;
    let open_refcount: i64 = row.get(12)?;
    Ok(Entry {
        id: row.get(0)?,
        external_id: external_id.map(DriveId::from),
        name: row.get(2)?,
        kind: row.get(3)?,
        size: size.max(0) as u64,
        mode: mode as u32,
        atime: from_seconds(row.get(6)?),
        mtime: from_seconds(row.get(7)?),
        ctime: from_seconds(row.get(8)?),
        sync_state: row.get(9)?,
        checksum: row.get(10)?,
        parent_id: row.get(11)?,
        open_refcount: open_refcount.max(0) as u32,
    })
}

/// Timestamps are stored as fractional seconds since the epoch.
pub(crate) fn to_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn from_seconds(seconds: f64) -> SystemTime {
    if seconds.is_finite() && seconds > 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(seconds)
    } else {
        UNIX_EPOCH
    }
}
