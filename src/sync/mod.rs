//! Background task keeping the metadata store in step with the remote drive.
//!
//! The first run crawls the whole drive; afterwards only the change feed is
//! followed, starting from the persisted cursor.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

pub use change::{Change, ChangeKind};

use crate::cache::ContentCache;
use crate::config::{CommonFileFilter, SyncSettings};
use crate::error::{FsError, FsResult};
use crate::google_drive::{helpers, Credentials, DriveId, RemoteDrive};
use crate::prelude::DriveFileMetadata;
use crate::store::{
    ChangeCursor, Entry, EntryId, EntryKind, MetadataStore, RemoteEntry, SyncState, UpsertOutcome,
};

mod change;

/// Process-wide stop signal, set once on shutdown.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// No cursor persisted yet.
    NeedsCursor,
    /// Full traversal; `start` becomes the cursor once it completes.
    Crawling { start: ChangeCursor },
    Polling { cursor: ChangeCursor },
    Idle { cursor: ChangeCursor },
    Stopped,
}

enum Applied {
    Done,
    /// The parent is not known yet.
    Deferred(Change),
}

pub struct SyncEngine {
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteDrive>,
    credentials: Arc<Credentials>,
    settings: SyncSettings,
    filter: CommonFileFilter,
    shutdown: ShutdownFlag,
    state: EngineState,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteDrive>,
        credentials: Arc<Credentials>,
        settings: SyncSettings,
        filter: CommonFileFilter,
        shutdown: ShutdownFlag,
    ) -> FsResult<Self> {
        let state = Self::initial_state(&store)?;
        info!("sync engine starting in {:?} with {}", state, settings);
        Ok(Self {
            store,
            cache,
            remote,
            credentials,
            settings,
            filter,
            shutdown,
            state,
        })
    }

    /// `Polling` if a cursor was persisted by an earlier run, else `NeedsCursor`.
    pub fn initial_state(store: &MetadataStore) -> FsResult<EngineState> {
        Ok(match store.load_change_cursor()? {
            Some(cursor) => EngineState::Polling { cursor },
            None => EngineState::NeedsCursor,
        })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub async fn run(mut self) {
        while self.state != EngineState::Stopped {
            self.step().await;
        }
        info!("sync engine stopped");
    }

    /// Advances the state machine by one transition.
    pub async fn step(&mut self) {
        if self.shutdown.is_set() {
            self.state = EngineState::Stopped;
            return;
        }
        let state = std::mem::replace(&mut self.state, EngineState::Stopped);
        self.state = match state {
            EngineState::NeedsCursor => match self.fetch_start_token().await {
                Ok(start) => EngineState::Crawling { start },
                Err(e) => {
                    warn!("could not get a start token: {}", e);
                    self.idle().await;
                    EngineState::NeedsCursor
                }
            },
            EngineState::Crawling { start } => match self.crawl().await {
                Ok(true) => match self.store.save_change_cursor(&start) {
                    Ok(()) => {
                        info!("initial crawl complete");
                        EngineState::Polling { cursor: start }
                    }
                    Err(e) => {
                        error!("could not persist the change cursor: {}", e);
                        EngineState::Crawling { start }
                    }
                },
                Ok(false) => EngineState::Crawling { start },
                Err(e) => {
                    warn!("crawl failed: {}", e);
                    self.idle().await;
                    EngineState::Crawling { start }
                }
            },
            EngineState::Polling { cursor } => match self.poll(&cursor).await {
                Ok((next, true)) => EngineState::Polling { cursor: next },
                Ok((next, false)) => EngineState::Idle { cursor: next },
                Err(e) => {
                    warn!("poll failed: {}", e);
                    EngineState::Idle { cursor }
                }
            },
            EngineState::Idle { cursor } => {
                self.idle().await;
                EngineState::Polling { cursor }
            }
            EngineState::Stopped => EngineState::Stopped,
        };
        trace!("engine state: {:?}", self.state);
    }

    /// Sleeps up to the poll interval, waking every idle step to check for shutdown.
    async fn idle(&self) {
        let deadline = Instant::now() + self.settings.poll_interval();
        loop {
            if self.shutdown.is_set() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            sleep(self.settings.idle_step().min(deadline - now)).await;
        }
    }

    /// Runs a remote call with a fresh credential, retrying transient failures
    /// with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> FsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let attempts = self.settings.retry_attempts().max(1);
        let mut delay = self.settings.retry_base_delay();
        let mut attempt = 1;
        loop {
            let result = match self.credentials.ensure_fresh().await {
                Ok(()) => call().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts && !self.shutdown.is_set() => {
                    debug!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} still failing after {} attempts: {}", what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_start_token(&self) -> FsResult<ChangeCursor> {
        self.with_retry("start page token", || self.remote.start_page_token())
            .await
    }

    //region crawl

    /// Walks the whole drive. Returns `false` if interrupted by shutdown.
    #[instrument(skip(self))]
    async fn crawl(&self) -> FsResult<bool> {
        let root = self
            .with_retry("root metadata", || self.remote.root_metadata())
            .await?;
        let root_entry = helpers::remote_entry(&root, None)
            .ok_or_else(|| FsError::RemoteRejected("root metadata without id".into()))?;
        self.store.upsert_by_external_id(&root_entry)?;

        let mut seen = HashSet::from([root_entry.external_id.clone()]);
        let mut worklist = VecDeque::from([(root_entry.external_id, PathBuf::new())]);
        let mut count = 0usize;
        while let Some((folder, folder_path)) = worklist.pop_front() {
            if self.shutdown.is_set() {
                return Ok(false);
            }
            let children = match self
                .with_retry("folder listing", || self.remote.list_folder(&folder))
                .await
            {
                Ok(children) => children,
                Err(e) => {
                    warn!("skipping folder {} ({}): {}", folder, folder_path.display(), e);
                    continue;
                }
            };
            for child in children {
                let Some(path) = self.admit(&child, &folder_path) else {
                    continue;
                };
                let Some(entry) = helpers::remote_entry(&child, Some(folder.clone())) else {
                    continue;
                };
                match self.apply_upsert(&entry) {
                    Ok(_) => count += 1,
                    Err(e) if is_local_failure(&e) => return Err(e),
                    Err(e) => {
                        warn!("skipping {}: {}", path.display(), e);
                        continue;
                    }
                }
                if entry.kind == EntryKind::Directory && seen.insert(entry.external_id.clone()) {
                    worklist.push_back((entry.external_id, path));
                }
            }
        }
        info!("crawled {} entries", count);
        Ok(true)
    }

    /// Relative path of `file` under `parent_path` if it should be mirrored.
    fn admit(&self, file: &DriveFileMetadata, parent_path: &Path) -> Option<PathBuf> {
        let name = file.name.as_deref()?;
        if file.trashed.unwrap_or(false) {
            return None;
        }
        if helpers::is_native_document(file) {
            trace!("skipping native document {:?}", name);
            return None;
        }
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            warn!("skipping entry with unusable name {:?}", name);
            return None;
        }
        let path = parent_path.join(name);
        if self.filter.is_filter_matched(&path, helpers::is_folder(file)) {
            debug!("ignoring {}", path.display());
            return None;
        }
        Some(path)
    }

    //endregion
    //region poll

    /// Applies every change since `cursor`. Returns the next cursor and whether any
    /// change was reported.
    #[instrument(skip(self))]
    async fn poll(&self, cursor: &ChangeCursor) -> FsResult<(ChangeCursor, bool)> {
        let batch = self
            .with_retry("change list", || self.remote.changes_since(cursor))
            .await?;
        let had_changes = !batch.changes.is_empty();
        let mut pending = Vec::with_capacity(batch.changes.len());
        for drive_change in batch.changes {
            match Change::try_from(drive_change) {
                Ok(change) => pending.push(change),
                Err(e) => warn!("ignoring change: {}", e),
            }
        }
        if had_changes {
            debug!("applying {} changes", pending.len());
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for change in pending {
                let id = change.id.clone();
                match self.apply_change(change) {
                    Ok(Applied::Done) => {}
                    Ok(Applied::Deferred(change)) => deferred.push(change),
                    Err(e) if is_local_failure(&e) => return Err(e),
                    Err(e) => warn!("could not apply change to {}: {}", id, e),
                }
            }
            if deferred.len() == before {
                for change in &deferred {
                    self.leave_mirror(&change.id)?;
                }
                break;
            }
            pending = deferred;
        }

        self.sweep_tombstones();
        let next = batch.new_cursor.unwrap_or_else(|| cursor.clone());
        self.store.save_change_cursor(&next)?;
        Ok((next, had_changes))
    }

    fn apply_change(&self, change: Change) -> FsResult<Applied> {
        let file = match &change.kind {
            ChangeKind::Drive => return Ok(Applied::Done),
            ChangeKind::Removed => {
                self.apply_removal(&change.id)?;
                return Ok(Applied::Done);
            }
            ChangeKind::Updated(file) => file,
        };

        let Some(parent_id) = helpers::first_parent(file) else {
            // only the drive root has no parent
            if let Some(existing) = self.store.find_by_external_id(&change.id)? {
                if existing.id.is_root() {
                    if let Some(entry) = helpers::remote_entry(file, None) {
                        self.apply_upsert(&entry)?;
                    }
                }
            }
            return Ok(Applied::Done);
        };
        let Some(parent) = self.store.find_by_external_id(&parent_id)? else {
            return Ok(Applied::Deferred(change));
        };
        if parent.is_tombstoned() {
            return Ok(Applied::Deferred(change));
        }
        let parent_path = self.relative_path(parent.id)?;
        match self.admit(file, &parent_path) {
            Some(_) => {
                let entry = helpers::remote_entry(file, Some(parent_id))
                    .ok_or_else(|| FsError::RemoteRejected("change without name".into()))?;
                self.apply_upsert(&entry)?;
            }
            None => self.apply_removal(&change.id)?,
        }
        Ok(Applied::Done)
    }

    /// Handles a change whose parent never showed up in the store. An entry that
    /// was mirrored has moved somewhere that is not, so it is removed locally.
    fn leave_mirror(&self, external_id: &DriveId) -> FsResult<()> {
        if self.store.find_by_external_id(external_id)?.is_some() {
            debug!("{} moved out of the mirrored tree", external_id);
            self.apply_removal(external_id)
        } else {
            debug!("dropping change to {}: parent is not mirrored", external_id);
            Ok(())
        }
    }

    /// Path of `id` below the drive root, made of entry names.
    fn relative_path(&self, id: EntryId) -> FsResult<PathBuf> {
        let mut path = PathBuf::new();
        for ancestor in self.store.path_of(id)?.into_iter().skip(1) {
            path.push(self.store.get_by_id(ancestor)?.name);
        }
        Ok(path)
    }

    fn apply_upsert(&self, entry: &RemoteEntry) -> FsResult<UpsertOutcome> {
        let outcome = self.store.upsert_by_external_id(entry)?;
        if let Some(old_path) = &outcome.moved_from {
            if let Err(e) = self.cache.relocate(old_path, outcome.id) {
                warn!("could not move cached content of {}: {}", outcome.id, e);
            }
        }
        if !outcome.inserted
            && entry.kind == EntryKind::File
            && outcome.previous_checksum != entry.checksum
        {
            debug!("content of {} changed remotely", outcome.id);
            if let Err(e) = self.cache.remove(outcome.id) {
                warn!("could not drop stale content of {}: {}", outcome.id, e);
            }
        }
        Ok(outcome)
    }

    /// Removes the entry bound to `external_id` together with everything below it.
    /// Entries that are still open are tombstoned and go away in a later sweep.
    fn apply_removal(&self, external_id: &DriveId) -> FsResult<()> {
        let Some(entry) = self.store.find_by_external_id(external_id)? else {
            return Ok(());
        };
        if entry.id.is_root() {
            warn!("remote reported the drive root as removed, ignoring");
            return Ok(());
        }
        self.tombstone_subtree(&entry)?;
        self.sweep_tombstones();
        Ok(())
    }

    fn tombstone_subtree(&self, top: &Entry) -> FsResult<()> {
        let page_size = self.settings.page_size() as usize;
        let mut worklist = VecDeque::from([top.clone()]);
        while let Some(entry) = worklist.pop_front() {
            if entry.is_dir() {
                for child in self.store.children(entry.id, page_size) {
                    worklist.push_back(child?);
                }
            }
            self.store.set_sync_state(entry.id, SyncState::Tombstoned)?;
        }
        debug!("tombstoned {} and its descendants", top.id);
        Ok(())
    }

    /// Deletes tombstoned entries that are no longer in use, along with their content.
    fn sweep_tombstones(&self) {
        match self.store.purge_tombstones() {
            Ok(purged) => {
                for path in purged {
                    if let Err(e) = self.cache.remove_at(&path) {
                        warn!("could not remove cached content: {}", e);
                    }
                }
            }
            Err(e) => warn!("tombstone sweep failed: {}", e),
        }
    }

    //endregion
}

/// Failures of the local database or disk; per-entry remote problems are not.
fn is_local_failure(e: &FsError) -> bool {
    matches!(e, FsError::Storage(_) | FsError::Io(_) | FsError::CorruptTree(_))
}
