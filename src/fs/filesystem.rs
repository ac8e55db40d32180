use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use tracing::{debug, info, instrument, trace};

use crate::async_helper::run_async_blocking;
use crate::cache::{ContentCache, HandleFlags};
use crate::config::SyncSettings;
use crate::error::{FsError, FsResult};
use crate::fs::attr::{file_attr, file_type};
use crate::google_drive::RemoteDrive;
use crate::reply_try;
use crate::store::{Entry, EntryId, MetadataStore, SyncState, TimeField};
use crate::sync::ShutdownFlag;

/// Cookie shared by the `.` and `..` entries; child cookies are their ids, which
/// are always greater.
const DOT_COOKIE: i64 = 1;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    pub ino: u64,
    pub cookie: i64,
    pub kind: FileType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirPage {
    pub rows: Vec<DirEntry>,
    /// where the next page starts, `None` once the directory is exhausted
    pub next_offset: Option<i64>,
}

/// Kernel-facing view of the mirrored drive.
pub struct DriveFilesystem {
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteDrive>,
    settings: SyncSettings,
    shutdown: ShutdownFlag,
    uid: u32,
    gid: u32,
    generation: u64,
}

impl Display for DriveFilesystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DriveFilesystem({})", self.store.path().display())
    }
}

impl DriveFilesystem {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteDrive>,
        settings: SyncSettings,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            store,
            cache,
            remote,
            settings,
            shutdown,
            uid: 0,
            gid: 0,
            generation: 0,
        }
    }

    fn attr(&self, entry: &Entry) -> FileAttr {
        file_attr(entry, self.uid, self.gid)
    }

    /// Looks up `name` under `parent`, hiding tombstoned entries.
    fn visible_child(&self, parent: EntryId, name: &OsStr) -> FsResult<Entry> {
        let name = name_str(name)?;
        let entry = self.store.lookup(parent, name)?;
        if entry.is_tombstoned() {
            return Err(FsError::not_found(format!("{name:?} in {parent}")));
        }
        Ok(entry)
    }

    /// Moves a tombstone that still holds `name` out of the way so the name can be
    /// reused.
    fn clear_tombstone(&self, parent: EntryId, name: &str) -> FsResult<()> {
        match self.store.lookup(parent, name) {
            Ok(entry) if entry.is_tombstoned() => {
                debug!("renaming tombstone {} to free {:?}", entry.id, name);
                self.store
                    .rename(entry.id, &format!(".drivefs-deleted-{}", entry.id))
            }
            Ok(_) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    //region core operations

    pub(crate) fn get_attr(&self, ino: u64) -> FsResult<FileAttr> {
        Ok(self.attr(&self.store.get_by_id(ino.into())?))
    }

    pub(crate) fn lookup_child(&self, parent: u64, name: &OsStr) -> FsResult<FileAttr> {
        let entry = self.visible_child(parent.into(), name)?;
        Ok(self.attr(&entry))
    }

    /// Listing of `ino` resuming after `offset`, reading at most `limit` children.
    /// Tombstoned children are skipped, so a page may hold fewer rows than read.
    pub(crate) fn read_dir(&self, ino: u64, offset: i64, limit: usize) -> FsResult<DirPage> {
        let dir = self.store.get_by_id(ino.into())?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(dir.id));
        }
        let limit = limit.max(1);
        let mut rows = Vec::new();
        if offset < DOT_COOKIE {
            let parent = dir.parent_id.unwrap_or(EntryId::ROOT);
            rows.push(DirEntry {
                ino: dir.id.ino(),
                cookie: DOT_COOKIE,
                kind: FileType::Directory,
                name: ".".into(),
            });
            rows.push(DirEntry {
                ino: parent.ino(),
                cookie: DOT_COOKIE,
                kind: FileType::Directory,
                name: "..".into(),
            });
        }
        let after = (offset > DOT_COOKIE).then(|| EntryId::new(offset));
        let children = self.store.list_children(dir.id, after, limit)?;
        let next_offset = match children.last() {
            Some(last) if children.len() == limit => Some(last.id.get()),
            _ => None,
        };
        rows.extend(
            children
                .into_iter()
                .filter(|e| !e.is_tombstoned())
                .map(|e| DirEntry {
                    ino: e.id.ino(),
                    cookie: e.id.get(),
                    kind: file_type(e.kind),
                    name: e.name,
                }),
        );
        Ok(DirPage { rows, next_offset })
    }

    pub(crate) fn make_dir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> FsResult<FileAttr> {
        let parent = EntryId::from(parent);
        let name = name_str(name)?;
        self.clear_tombstone(parent, name)?;
        let id = self
            .store
            .create_directory(parent, name, mode & !umask & 0o7777, SyncState::Dirty, None)?;
        self.get_attr(id.ino())
    }

    pub(crate) fn remove_dir(&self, parent: u64, name: &OsStr) -> FsResult<()> {
        let entry = self.visible_child(parent.into(), name)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory(entry.id));
        }
        self.remove_directory(&entry)
    }

    /// Deletes an empty directory. One whose only children are tombstones is
    /// tombstoned as well and goes away with the last of them.
    fn remove_directory(&self, dir: &Entry) -> FsResult<()> {
        match self.store.remove(dir.id) {
            Ok(path) => self.cache.remove_at(&path),
            Err(FsError::DirectoryNotEmpty(id)) => {
                let page_size = self.settings.page_size() as usize;
                for child in self.store.children(id, page_size) {
                    if !child?.is_tombstoned() {
                        return Err(FsError::DirectoryNotEmpty(id));
                    }
                }
                debug!("{} only holds tombstones, tombstoning it", id);
                self.store.set_sync_state(id, SyncState::Tombstoned)?;
                self.purge_tombstones()
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes every tombstone that is no longer open or a parent, with its content.
    fn purge_tombstones(&self) -> FsResult<()> {
        for path in self.store.purge_tombstones()? {
            self.cache.remove_at(&path)?;
        }
        Ok(())
    }

    pub(crate) fn create_file(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FsResult<(FileAttr, u64)> {
        let parent = EntryId::from(parent);
        let name = name_str(name)?;
        self.clear_tombstone(parent, name)?;
        let id = self.store.create_file(
            parent,
            name,
            0,
            mode & !umask & 0o7777,
            SyncState::Dirty,
            None,
        )?;
        let fh = self.cache.create(id)?;
        self.store.add_ref(id)?;
        Ok((self.get_attr(id.ino())?, fh))
    }

    pub(crate) fn open_file(&self, ino: u64, flags: i32) -> FsResult<u64> {
        let entry = self.store.get_by_id(ino.into())?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(entry.id));
        }
        let flags = HandleFlags::from(flags);
        if !self.cache.is_cached(entry.id)? {
            self.fill_cache(&entry, flags)?;
        }
        let fh = self.cache.open(entry.id, flags)?;
        if flags.truncate() && flags.can_write() {
            self.store.resize(entry.id, 0)?;
            self.store.set_sync_state(entry.id, SyncState::Dirty)?;
        }
        if let Err(e) = self.store.add_ref(entry.id) {
            let _ = self.cache.close(fh);
            return Err(e);
        }
        Ok(fh)
    }

    /// Puts content for `entry` into the cache: downloaded if the remote has it,
    /// empty for files that only exist locally or are about to be truncated.
    fn fill_cache(&self, entry: &Entry, flags: HandleFlags) -> FsResult<()> {
        match &entry.external_id {
            Some(_) if !(flags.truncate() && flags.can_write()) => self.download(entry),
            _ => self.cache.truncate(entry.id, 0),
        }
    }

    #[instrument(skip(self, entry), fields(id = %entry.id, name = %entry.name))]
    fn download(&self, entry: &Entry) -> FsResult<()> {
        let external_id = entry
            .external_id
            .as_ref()
            .ok_or_else(|| FsError::not_found(format!("remote copy of {}", entry.id)))?;
        let mut target = self.cache.download_target(entry.id)?;
        let written = run_async_blocking(self.remote.download(external_id, target.as_file_mut()))?;
        self.cache.commit_download(entry.id, target)?;
        if let Some(expected) = &entry.checksum {
            let actual = self.cache.checksum(entry.id)?;
            if &actual != expected {
                self.cache.remove(entry.id)?;
                return Err(FsError::RemoteRejected(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    entry.id, expected, actual
                )));
            }
        }
        if written != entry.size {
            debug!("size of {} changed to {}", entry.id, written);
            self.store.resize(entry.id, written)?;
        }
        info!("downloaded {} bytes for {}", written, entry.id);
        Ok(())
    }

    pub(crate) fn read_file(&self, fh: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        self.cache.read(fh, offset.max(0) as u64, size as usize)
    }

    pub(crate) fn write_file(&self, fh: u64, offset: i64, data: &[u8]) -> FsResult<usize> {
        self.cache.write(fh, offset.max(0) as u64, data)
    }

    pub(crate) fn release_file(&self, fh: u64) -> FsResult<()> {
        let closed = self.cache.close(fh)?;
        let id = closed.id;
        if closed.flags.can_write() {
            self.store.resize(id, closed.size)?;
            self.store.touch(id, TimeField::Modify, SystemTime::now())?;
        }
        let remaining = self.store.release_ref(id)?;
        let entry = self.store.get_by_id(id)?;
        if entry.is_tombstoned() {
            if remaining == 0 {
                debug!("last handle of tombstoned {} released", id);
                self.purge_tombstones()?;
            }
        } else if closed.flags.can_write() {
            self.store.set_sync_state(id, SyncState::Dirty)?;
        }
        Ok(())
    }

    pub(crate) fn unlink_file(&self, parent: u64, name: &OsStr) -> FsResult<()> {
        let entry = self.visible_child(parent.into(), name)?;
        self.unlink_entry(&entry)
    }

    fn unlink_entry(&self, entry: &Entry) -> FsResult<()> {
        if entry.is_dir() {
            return Err(FsError::IsADirectory(entry.id));
        }
        if entry.open_refcount > 0 {
            debug!("{} still open, tombstoning", entry.id);
            return self.store.set_sync_state(entry.id, SyncState::Tombstoned);
        }
        let path = self.store.remove(entry.id)?;
        self.cache.remove_at(&path)
    }

    pub(crate) fn rename_entry(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FsResult<()> {
        let entry = self.visible_child(parent.into(), name)?;
        let new_parent = EntryId::from(new_parent);
        let new_name = name_str(new_name)?;
        self.store.check_move(entry.id, new_parent)?;
        match self.visible_child(new_parent, OsStr::new(new_name)) {
            Ok(target) if target.id != entry.id => {
                match (entry.is_dir(), target.is_dir()) {
                    (false, false) => self.unlink_entry(&target)?,
                    (true, true) => self.remove_directory(&target)?,
                    (true, false) => return Err(FsError::NotADirectory(target.id)),
                    (false, true) => return Err(FsError::IsADirectory(target.id)),
                }
            }
            Ok(_) | Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.clear_tombstone(new_parent, new_name)?;
        if entry.parent_id == Some(new_parent) {
            self.store.rename(entry.id, new_name)?;
        } else {
            let old_path = self.store.move_entry(entry.id, new_parent, new_name)?;
            self.cache.relocate(&old_path, entry.id)?;
        }
        self.store.set_sync_state(entry.id, SyncState::Dirty)
    }

    pub(crate) fn set_attr(
        &self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<FileAttr> {
        let entry = self.store.get_by_id(ino.into())?;
        if let Some(mode) = mode {
            self.store.chmod(entry.id, mode)?;
        }
        if let Some(size) = size {
            if entry.is_dir() {
                return Err(FsError::IsADirectory(entry.id));
            }
            if !self.cache.is_cached(entry.id)? && size > 0 {
                self.fill_cache(&entry, HandleFlags::read_write())?;
            }
            self.cache.truncate(entry.id, size)?;
            self.store.resize(entry.id, size)?;
            self.store.touch(entry.id, TimeField::Modify, SystemTime::now())?;
            self.store.set_sync_state(entry.id, SyncState::Dirty)?;
        }
        if let Some(atime) = atime {
            self.store.touch(entry.id, TimeField::Access, resolve_time(atime))?;
        }
        if let Some(mtime) = mtime {
            self.store.touch(entry.id, TimeField::Modify, resolve_time(mtime))?;
        }
        self.get_attr(ino)
    }

    //endregion
}

fn name_str(name: &OsStr) -> FsResult<&str> {
    name.to_str()
        .ok_or_else(|| FsError::not_found(format!("non UTF-8 name {name:?}")))
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

//region filesystem
impl Filesystem for DriveFilesystem {
    #[instrument(skip(req, _config), fields(%self))]
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.uid = req.uid();
        self.gid = req.gid();
        info!("mounted for uid {} gid {}", self.uid, self.gid);
        Ok(())
    }

    #[instrument(fields(%self))]
    fn destroy(&mut self) {
        info!("unmounted, stopping sync");
        self.shutdown.trigger();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup: {}:{:?}", parent, name);
        let attr = reply_try!(self.lookup_child(parent, name), reply, "lookup {}:{:?}", parent, name);
        reply.entry(&self.settings.time_to_live(), &attr, self.generation);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let attr = reply_try!(self.get_attr(ino), reply, "getattr {}", ino);
        reply.attr(&self.settings.time_to_live(), &attr);
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = reply_try!(
            self.set_attr(ino, mode, size, atime, mtime),
            reply,
            "setattr {}",
            ino
        );
        reply.attr(&self.settings.time_to_live(), &attr);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir: {} from {}", ino, offset);
        let page_size = self.settings.page_size() as usize;
        let mut offset = offset;
        loop {
            let page = reply_try!(self.read_dir(ino, offset, page_size), reply, "readdir {}", ino);
            for row in &page.rows {
                if reply.add(row.ino, row.cookie, row.kind, &row.name) {
                    reply.ok();
                    return;
                }
            }
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }
        reply.ok();
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let attr = reply_try!(
            self.make_dir(parent, name, mode, umask),
            reply,
            "mkdir {}:{:?}",
            parent,
            name
        );
        reply.entry(&self.settings.time_to_live(), &attr, self.generation);
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_try!(self.remove_dir(parent, name), reply, "rmdir {}:{:?}", parent, name);
        reply.ok();
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_try!(self.unlink_file(parent, name), reply, "unlink {}:{:?}", parent, name);
        reply.ok();
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply_try!(
            self.rename_entry(parent, name, newparent, newname),
            reply,
            "rename {}:{:?} to {}:{:?}",
            parent,
            name,
            newparent,
            newname
        );
        reply.ok();
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (attr, fh) = reply_try!(
            self.create_file(parent, name, mode, umask),
            reply,
            "create {}:{:?}",
            parent,
            name
        );
        reply.created(
            &self.settings.time_to_live(),
            &attr,
            self.generation,
            fh,
            flags as u32,
        );
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fh = reply_try!(self.open_file(ino, flags), reply, "open {}", ino);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let data = reply_try!(
            self.read_file(fh, offset, size),
            reply,
            "read {} (fh {})",
            ino,
            fh
        );
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let written = reply_try!(
            self.write_file(fh, offset, data),
            reply,
            "write {} (fh {})",
            ino,
            fh
        );
        reply.written(written as u32);
    }

    #[instrument(skip(_req, reply), fields(%self))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply_try!(self.release_file(fh), reply, "release {} (fh {})", ino, fh);
        reply.ok();
    }
}
//endregion

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::google_drive::fake::{self, FakeDrive};
    use crate::google_drive::DriveId;
    use crate::store::{EntryKind, RemoteEntry};

    struct Fixture {
        _dir: TempDir,
        runtime: tokio::runtime::Runtime,
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        remote: Arc<FakeDrive>,
        fs: DriveFilesystem,
    }

    fn fixture() -> Fixture {
        crate::tests::init_logs();
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("drivefs.db")).unwrap());
        let cache = Arc::new(ContentCache::new(dir.path().join("cache"), store.clone()).unwrap());
        let remote = Arc::new(FakeDrive::new());
        let fs = DriveFilesystem::new(
            store.clone(),
            cache.clone(),
            remote.clone(),
            SyncSettings::default().with_page_size(2),
            ShutdownFlag::default(),
        );
        Fixture {
            _dir: dir,
            runtime,
            store,
            cache,
            remote,
            fs,
        }
    }

    fn remote_file(f: &Fixture, id: &str, name: &str, content: &[u8]) -> EntryId {
        f.store
            .upsert_by_external_id(&RemoteEntry {
                external_id: fake::ROOT_ID.into(),
                name: "/".into(),
                kind: EntryKind::Directory,
                size: 0,
                mtime: SystemTime::now(),
                ctime: SystemTime::now(),
                checksum: None,
                parent_external_id: None,
            })
            .unwrap();
        let metadata = fake::file(id, name, fake::ROOT_ID, content);
        f.remote.add(metadata.clone(), Some(content));
        let entry = crate::google_drive::helpers::remote_entry(&metadata, Some(fake::ROOT_ID.into()))
            .unwrap();
        f.store.upsert_by_external_id(&entry).unwrap().id
    }

    #[test]
    fn first_open_downloads_the_content() {
        let f = fixture();
        let _guard = f.runtime.enter();
        let id = remote_file(&f, "R1", "remote.txt", b"remote bytes");
        assert!(!f.cache.is_cached(id).unwrap());

        let fh = f.fs.open_file(id.ino(), libc::O_RDONLY).unwrap();
        assert_eq!(b"remote bytes".to_vec(), f.fs.read_file(fh, 0, 64).unwrap());
        assert_eq!(1, f.store.get_by_id(id).unwrap().open_refcount);
        f.fs.release_file(fh).unwrap();
        assert_eq!(0, f.store.get_by_id(id).unwrap().open_refcount);

        // second open is served from the cache
        let fh = f.fs.open_file(id.ino(), libc::O_RDONLY).unwrap();
        f.fs.release_file(fh).unwrap();
        let downloads = f
            .remote
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("download"))
            .count();
        assert_eq!(1, downloads);
        assert_eq!(SyncState::Clean, f.store.get_by_id(id).unwrap().sync_state);
    }

    #[test]
    fn corrupt_download_is_discarded() {
        let f = fixture();
        let _guard = f.runtime.enter();
        let id = remote_file(&f, "R1", "remote.txt", b"remote bytes");
        f.remote
            .contents
            .lock()
            .unwrap()
            .insert("R1".into(), b"tampered".to_vec());
        assert!(matches!(
            f.fs.open_file(id.ino(), libc::O_RDONLY),
            Err(FsError::RemoteRejected(_))
        ));
        assert!(!f.cache.is_cached(id).unwrap());
        assert_eq!(0, f.store.get_by_id(id).unwrap().open_refcount);
    }

    #[test]
    fn create_write_release_updates_metadata() {
        let f = fixture();
        let name = OsStr::new("new.txt");
        let (attr, fh) = f.fs.create_file(1, name, 0o666, 0o022).unwrap();
        assert_eq!(0o644, attr.perm);
        assert_eq!(FileType::RegularFile, attr.kind);
        // owner is filled in by init from the mounting request
        assert_eq!((0, 0), (attr.uid, attr.gid));
        assert_eq!(5, f.fs.write_file(fh, 0, b"hello").unwrap());
        f.fs.release_file(fh).unwrap();

        let attr = f.fs.lookup_child(1, name).unwrap();
        assert_eq!(5, attr.size);
        let entry = f.store.get_by_id(attr.ino.into()).unwrap();
        assert_eq!(SyncState::Dirty, entry.sync_state);
        assert_eq!(0, entry.open_refcount);
        assert!(matches!(
            f.fs.create_file(1, name, 0o644, 0),
            Err(FsError::Conflict { .. })
        ));
    }

    #[test]
    fn readdir_pages_by_cookie() {
        let f = fixture();
        let mut names = Vec::new();
        for i in 0..5 {
            let name = format!("d{i}");
            f.fs.make_dir(1, OsStr::new(&name), 0o755, 0).unwrap();
            names.push(name);
        }
        // a tombstoned child is skipped without ending the listing early
        let (_, fh) = f.fs.create_file(1, OsStr::new("gone"), 0o644, 0).unwrap();
        f.fs.unlink_file(1, OsStr::new("gone")).unwrap();

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = f.fs.read_dir(1, offset, 2).unwrap();
            seen.extend(page.rows.into_iter().map(|r| r.name));
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }
        f.fs.release_file(fh).unwrap();
        let mut expected = vec![".".to_string(), "..".to_string()];
        expected.extend(names);
        assert_eq!(expected, seen);
        assert!(matches!(
            f.fs.read_dir(f.fs.lookup_child(1, OsStr::new("d0")).unwrap().ino + 100, 0, 2),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn rmdir_and_unlink() {
        let f = fixture();
        let dir = f.fs.make_dir(1, OsStr::new("dir"), 0o755, 0).unwrap();
        let (file, fh) = f.fs.create_file(dir.ino, OsStr::new("f"), 0o644, 0).unwrap();
        f.fs.release_file(fh).unwrap();
        assert!(matches!(
            f.fs.remove_dir(1, OsStr::new("dir")),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            f.fs.unlink_file(1, OsStr::new("dir")),
            Err(FsError::IsADirectory(_))
        ));
        f.fs.unlink_file(dir.ino, OsStr::new("f")).unwrap();
        assert!(matches!(f.fs.get_attr(file.ino), Err(FsError::NotFound(_))));
        f.fs.remove_dir(1, OsStr::new("dir")).unwrap();
        assert!(matches!(
            f.fs.lookup_child(1, OsStr::new("dir")),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn unlink_of_an_open_file_waits_for_release() {
        let f = fixture();
        let (attr, fh) = f.fs.create_file(1, OsStr::new("busy"), 0o644, 0).unwrap();
        f.fs.write_file(fh, 0, b"data").unwrap();
        f.fs.unlink_file(1, OsStr::new("busy")).unwrap();
        assert!(matches!(
            f.fs.lookup_child(1, OsStr::new("busy")),
            Err(FsError::NotFound(_))
        ));
        // still readable through the open handle
        assert_eq!(b"data".to_vec(), f.fs.read_file(fh, 0, 16).unwrap());
        // the name can be reused right away
        let (_, other) = f.fs.create_file(1, OsStr::new("busy"), 0o644, 0).unwrap();
        f.fs.release_file(other).unwrap();

        f.fs.release_file(fh).unwrap();
        assert!(matches!(f.fs.get_attr(attr.ino), Err(FsError::NotFound(_))));
    }

    #[test]
    fn rename_moves_cached_content() {
        let f = fixture();
        let dir = f.fs.make_dir(1, OsStr::new("dir"), 0o755, 0).unwrap();
        let (attr, fh) = f.fs.create_file(1, OsStr::new("a"), 0o644, 0).unwrap();
        f.fs.write_file(fh, 0, b"moved").unwrap();
        f.fs.release_file(fh).unwrap();

        f.fs
            .rename_entry(1, OsStr::new("a"), dir.ino, OsStr::new("b"))
            .unwrap();
        let moved = f.fs.lookup_child(dir.ino, OsStr::new("b")).unwrap();
        assert_eq!(attr.ino, moved.ino);
        let fh = f.fs.open_file(moved.ino, libc::O_RDONLY).unwrap();
        assert_eq!(b"moved".to_vec(), f.fs.read_file(fh, 0, 16).unwrap());
        f.fs.release_file(fh).unwrap();

        assert!(matches!(
            f.fs.rename_entry(1, OsStr::new("dir"), dir.ino, OsStr::new("inner")),
            Err(FsError::InvalidMove { .. })
        ));
    }

    #[test]
    fn rmdir_succeeds_when_only_unlinked_open_files_remain() {
        let f = fixture();
        let dir = f.fs.make_dir(1, OsStr::new("logs"), 0o755, 0).unwrap();
        let (file, fh) = f.fs.create_file(dir.ino, OsStr::new("app.log"), 0o644, 0).unwrap();
        f.fs.write_file(fh, 0, b"line").unwrap();
        f.fs.unlink_file(dir.ino, OsStr::new("app.log")).unwrap();
        assert!(f.fs.read_dir(dir.ino, DOT_COOKIE, 10).unwrap().rows.is_empty());

        f.fs.remove_dir(1, OsStr::new("logs")).unwrap();
        assert!(matches!(
            f.fs.lookup_child(1, OsStr::new("logs")),
            Err(FsError::NotFound(_))
        ));
        // the name is free again while the old directory waits for its last handle
        let again = f.fs.make_dir(1, OsStr::new("logs"), 0o755, 0).unwrap();
        assert_eq!(b"line".to_vec(), f.fs.read_file(fh, 0, 16).unwrap());

        f.fs.release_file(fh).unwrap();
        assert!(matches!(f.fs.get_attr(file.ino), Err(FsError::NotFound(_))));
        assert!(matches!(f.fs.get_attr(dir.ino), Err(FsError::NotFound(_))));
        assert_eq!(again.ino, f.fs.lookup_child(1, OsStr::new("logs")).unwrap().ino);
    }

    #[test]
    fn rmdir_with_a_live_child_still_fails() {
        let f = fixture();
        let dir = f.fs.make_dir(1, OsStr::new("d"), 0o755, 0).unwrap();
        let (_, open) = f.fs.create_file(dir.ino, OsStr::new("gone"), 0o644, 0).unwrap();
        let (_, kept) = f.fs.create_file(dir.ino, OsStr::new("kept"), 0o644, 0).unwrap();
        f.fs.release_file(kept).unwrap();
        f.fs.unlink_file(dir.ino, OsStr::new("gone")).unwrap();
        assert!(matches!(
            f.fs.remove_dir(1, OsStr::new("d")),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        assert!(!f.store.get_by_id(dir.ino.into()).unwrap().is_tombstoned());
        f.fs.release_file(open).unwrap();
    }

    #[test]
    fn invalid_move_leaves_the_target_in_place() {
        let f = fixture();
        let outer = f.fs.make_dir(1, OsStr::new("outer"), 0o755, 0).unwrap();
        let inner = f.fs.make_dir(outer.ino, OsStr::new("inner"), 0o755, 0).unwrap();
        assert!(matches!(
            f.fs.rename_entry(1, OsStr::new("outer"), outer.ino, OsStr::new("inner")),
            Err(FsError::InvalidMove { .. })
        ));
        assert_eq!(
            inner.ino,
            f.fs.lookup_child(outer.ino, OsStr::new("inner")).unwrap().ino
        );
    }

    #[test]
    fn rename_over_an_existing_file_replaces_it() {
        let f = fixture();
        for name in ["a", "b"] {
            let (_, fh) = f.fs.create_file(1, OsStr::new(name), 0o644, 0).unwrap();
            f.fs.write_file(fh, 0, name.as_bytes()).unwrap();
            f.fs.release_file(fh).unwrap();
        }
        let a = f.fs.lookup_child(1, OsStr::new("a")).unwrap();
        f.fs
            .rename_entry(1, OsStr::new("a"), 1, OsStr::new("b"))
            .unwrap();
        assert_eq!(a.ino, f.fs.lookup_child(1, OsStr::new("b")).unwrap().ino);
        assert!(f.fs.lookup_child(1, OsStr::new("a")).is_err());
    }

    #[test]
    fn truncate_and_chmod() {
        let f = fixture();
        let _guard = f.runtime.enter();
        let id = remote_file(&f, "R1", "remote.txt", b"0123456789");
        let attr = f
            .fs
            .set_attr(id.ino(), Some(0o100640), Some(4), None, None)
            .unwrap();
        assert_eq!(4, attr.size);
        assert_eq!(0o640, attr.perm);
        let fh = f.fs.open_file(id.ino(), libc::O_RDONLY).unwrap();
        assert_eq!(b"0123".to_vec(), f.fs.read_file(fh, 0, 16).unwrap());
        f.fs.release_file(fh).unwrap();
        assert_eq!(SyncState::Dirty, f.store.get_by_id(id).unwrap().sync_state);
        assert_eq!(
            Some(DriveId::from("R1")),
            f.store.get_by_id(id).unwrap().external_id
        );
    }

    #[test]
    fn end_to_end_tree() {
        let f = fixture();
        let a = f.fs.make_dir(1, OsStr::new("a"), 0o755, 0).unwrap();
        let b = f.fs.make_dir(a.ino, OsStr::new("b"), 0o755, 0).unwrap();
        let (c, fh) = f.fs.create_file(b.ino, OsStr::new("c.txt"), 0o644, 0).unwrap();
        f.fs.write_file(fh, 0, &[b'x'; 42]).unwrap();
        f.fs.release_file(fh).unwrap();

        let listing = f.fs.read_dir(a.ino, DOT_COOKIE, 10).unwrap();
        assert_eq!(vec![b.ino], listing.rows.iter().map(|r| r.ino).collect::<Vec<_>>());
        assert_eq!(None, listing.next_offset);
        assert_eq!(
            vec![
                EntryId::ROOT,
                EntryId::from(a.ino),
                EntryId::from(b.ino),
                EntryId::from(c.ino)
            ],
            f.store.path_of(c.ino.into()).unwrap()
        );
        assert_eq!(42, f.fs.get_attr(c.ino).unwrap().size);
        assert!(matches!(
            f.fs.remove_dir(1, OsStr::new("a")),
            Err(FsError::DirectoryNotEmpty(_))
        ));
    }
}
