//! Local copies of file contents, stored under `<cache_dir>/<id-path>`.

use std::collections::HashMap;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, trace, warn};

pub use handle_flags::HandleFlags;

use crate::error::{FsError, FsResult};
use crate::store::{EntryId, MetadataStore};

mod handle_flags;

const CACHE_DIR_MODE: u32 = 0o700;
const CACHE_FILE_MODE: u32 = 0o600;

#[derive(Debug)]
struct CachedFile {
    id: EntryId,
    file: File,
    flags: HandleFlags,
}

/// What a handle referred to when it was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedHandle {
    pub id: EntryId,
    pub flags: HandleFlags,
    pub size: u64,
}

#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    store: Arc<MetadataStore>,
    handles: Mutex<HashMap<u64, Arc<CachedFile>>>,
    next_handle: AtomicU64,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, store: Arc<MetadataStore>) -> FsResult<Self> {
        let root = root.into();
        create_dir_chain(&root)?;
        debug!("content cache at {}", root.display());
        Ok(Self {
            root,
            store,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the cached copy for an id-path.
    pub fn path_at(&self, id_path: &[EntryId]) -> PathBuf {
        let mut path = self.root.clone();
        for id in id_path {
            path.push(id.to_string());
        }
        path
    }

    pub fn path_for(&self, id: EntryId) -> FsResult<PathBuf> {
        let id_path = self.store.path_of(id)?;
        Ok(self.path_at(&id_path))
    }

    /// Creates the directories of every ancestor of `id` in the cache.
    pub fn ensure_dirs_for(&self, id: EntryId) -> FsResult<PathBuf> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            create_dir_chain(parent)?;
        }
        Ok(path)
    }

    //region handles

    /// Creates an empty cached file for `id` and opens it for reading and writing.
    #[instrument(skip(self))]
    pub fn create(&self, id: EntryId) -> FsResult<u64> {
        let path = self.ensure_dirs_for(id)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CACHE_FILE_MODE)
            .open(&path)?;
        Ok(self.register(id, file, HandleFlags::read_write()))
    }

    /// Opens the cached copy of `id`. Read-only opens require the content to be
    /// cached already; writable opens create it if missing.
    #[instrument(skip(self))]
    pub fn open(&self, id: EntryId, flags: HandleFlags) -> FsResult<u64> {
        let path = self.ensure_dirs_for(id)?;
        let file = OpenOptions::new()
            .read(true)
            .write(flags.can_write())
            .create(flags.can_write())
            .truncate(flags.can_write() && flags.truncate())
            .mode(CACHE_FILE_MODE)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => FsError::not_found(format!("cached content of {id}")),
                _ => FsError::Io(e),
            })?;
        Ok(self.register(id, file, flags))
    }

    fn register(&self, id: EntryId, file: File, flags: HandleFlags) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(CachedFile { id, file, flags }));
        trace!("opened handle {} for {} ({:?})", handle, id, flags);
        handle
    }

    fn handle(&self, handle: u64) -> FsResult<Arc<CachedFile>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or(FsError::BadHandle(handle))
    }

    pub fn close(&self, handle: u64) -> FsResult<ClosedHandle> {
        let cached = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(FsError::BadHandle(handle))?;
        let size = cached.file.metadata()?.len();
        if cached.flags.can_write() {
            cached.file.sync_data()?;
        }
        trace!("closed handle {} of {}", handle, cached.id);
        Ok(ClosedHandle {
            id: cached.id,
            flags: cached.flags,
            size,
        })
    }

    /// Reads up to `length` bytes at `offset`. Returns fewer bytes at end of file.
    pub fn read(&self, handle: u64, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let cached = self.handle(handle)?;
        if !cached.flags.can_read() {
            return Err(FsError::AccessDenied(handle));
        }
        let mut buf = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            match cached.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let cached = self.handle(handle)?;
        if !cached.flags.can_write() {
            return Err(FsError::AccessDenied(handle));
        }
        let offset = if cached.flags.append() {
            cached.file.metadata()?.len()
        } else {
            offset
        };
        cached.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn size_of(&self, handle: u64) -> FsResult<u64> {
        Ok(self.handle(handle)?.file.metadata()?.len())
    }

    //endregion
    //region whole files

    pub fn is_cached(&self, id: EntryId) -> FsResult<bool> {
        Ok(self.path_for(id)?.is_file())
    }

    /// Temporary file next to the final location of `id`; see [`Self::commit_download`].
    pub fn download_target(&self, id: EntryId) -> FsResult<NamedTempFile> {
        let path = self.ensure_dirs_for(id)?;
        let dir = path.parent().unwrap_or(&self.root);
        let target = tempfile::Builder::new()
            .prefix(&format!(".{id}."))
            .suffix(".part")
            .tempfile_in(dir)?;
        Ok(target)
    }

    /// Moves a finished download into place.
    pub fn commit_download(&self, id: EntryId, download: NamedTempFile) -> FsResult<()> {
        let path = self.path_for(id)?;
        download.as_file().sync_all()?;
        download.persist(&path).map_err(|e| FsError::Io(e.error))?;
        debug!("cached content of {} at {}", id, path.display());
        Ok(())
    }

    pub fn truncate(&self, id: EntryId, size: u64) -> FsResult<()> {
        let path = self.ensure_dirs_for(id)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(CACHE_FILE_MODE)
            .open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Moves whatever was cached at `old_path` to the current location of `id`.
    #[instrument(skip(self))]
    pub fn relocate(&self, old_path: &[EntryId], id: EntryId) -> FsResult<()> {
        let from = self.path_at(old_path);
        if !from.exists() {
            return Ok(());
        }
        let to = self.ensure_dirs_for(id)?;
        if from != to {
            std::fs::rename(&from, &to)?;
            trace!("moved {} to {}", from.display(), to.display());
        }
        Ok(())
    }

    /// Drops the cached copy of `id`, if any.
    pub fn remove(&self, id: EntryId) -> FsResult<()> {
        let path = self.path_for(id)?;
        remove_path(&path)
    }

    /// Drops whatever is cached at an id-path. Used after the entry row is gone.
    pub fn remove_at(&self, id_path: &[EntryId]) -> FsResult<()> {
        remove_path(&self.path_at(id_path))
    }

    /// Hex MD5 of the cached content of `id`.
    pub fn checksum(&self, id: EntryId) -> FsResult<String> {
        let mut file = File::open(self.path_for(id)?)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    //endregion
}

fn create_dir_chain(path: &Path) -> FsResult<()> {
    match DirBuilder::new()
        .recursive(true)
        .mode(CACHE_DIR_MODE)
        .create(path)
    {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e.into()),
        _ => Ok(()),
    }
}

fn remove_path(path: &Path) -> FsResult<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("could not remove {}: {}", path.display(), e);
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}
