//! In-memory drive used by the engine and adapter tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use google_drive3::chrono::Utc;
use md5::{Digest, Md5};

use crate::error::{FsError, FsResult};
use crate::google_drive::helpers::FOLDER_MIME_TYPE;
use crate::google_drive::{ChangeBatch, Credentials, DriveId, RemoteDrive};
use crate::prelude::{DriveChange, DriveFileMetadata};
use crate::store::ChangeCursor;

pub(crate) const ROOT_ID: &str = "root-id";

#[derive(Default)]
pub(crate) struct FakeDrive {
    pub start_token: String,
    pub folders: Mutex<HashMap<String, Vec<DriveFileMetadata>>>,
    pub contents: Mutex<HashMap<String, Vec<u8>>>,
    pub batches: Mutex<VecDeque<ChangeBatch>>,
    pub failing_folders: Mutex<HashSet<String>>,
    /// how many of the next calls fail with a transient error
    pub transient_failures: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    /// one entry per call: whether the credential was unexpired at that time
    pub fresh_at_call: Mutex<Vec<bool>>,
    pub credentials: Option<Arc<Credentials>>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self {
            start_token: "start-1".into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn add(&self, file: DriveFileMetadata, content: Option<&[u8]>) {
        let parent = file
            .parents
            .as_ref()
            .and_then(|p| p.first().cloned())
            .unwrap_or_default();
        if let (Some(content), Some(id)) = (content, file.id.clone()) {
            self.contents.lock().unwrap().insert(id, content.to_vec());
        }
        self.folders
            .lock()
            .unwrap()
            .entry(parent)
            .or_default()
            .push(file);
    }

    pub fn push_changes(&self, changes: Vec<DriveChange>, new_cursor: &str) {
        self.batches.lock().unwrap().push_back(ChangeBatch {
            changes,
            new_cursor: Some(new_cursor.into()),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: String) -> FsResult<()> {
        if let Some(credentials) = &self.credentials {
            let fresh = credentials
                .expiry()
                .await
                .map(|expiry| expiry > SystemTime::now())
                .unwrap_or(false);
            self.fresh_at_call.lock().unwrap().push(fresh);
        }
        self.calls.lock().unwrap().push(call);
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FsError::RemoteUnavailable("503 backend error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDrive for FakeDrive {
    async fn start_page_token(&self) -> FsResult<ChangeCursor> {
        self.record("start_page_token".into()).await?;
        Ok(ChangeCursor::from(self.start_token.as_str()))
    }

    async fn root_metadata(&self) -> FsResult<DriveFileMetadata> {
        self.record("root_metadata".into()).await?;
        let mut root = folder(ROOT_ID, "My Drive", "");
        root.parents = None;
        Ok(root)
    }

    async fn list_folder(&self, folder: &DriveId) -> FsResult<Vec<DriveFileMetadata>> {
        self.record(format!("list_folder {folder}")).await?;
        if self.failing_folders.lock().unwrap().contains(folder.as_str()) {
            return Err(FsError::RemoteRejected(format!("listing {folder} failed")));
        }
        Ok(self
            .folders
            .lock()
            .unwrap()
            .get(folder.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn changes_since(&self, cursor: &ChangeCursor) -> FsResult<ChangeBatch> {
        self.record(format!("changes_since {cursor}")).await?;
        Ok(self
            .batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ChangeBatch {
                changes: Vec::new(),
                new_cursor: Some(cursor.clone()),
            }))
    }

    async fn download(
        &self,
        file: &DriveId,
        target: &mut (dyn std::io::Write + Send),
    ) -> FsResult<u64> {
        self.record(format!("download {file}")).await?;
        let content = self
            .contents
            .lock()
            .unwrap()
            .get(file.as_str())
            .cloned()
            .ok_or_else(|| FsError::not_found(file))?;
        target.write_all(&content)?;
        Ok(content.len() as u64)
    }
}

pub(crate) fn folder(id: &str, name: &str, parent: &str) -> DriveFileMetadata {
    DriveFileMetadata {
        id: Some(id.into()),
        name: Some(name.into()),
        mime_type: Some(FOLDER_MIME_TYPE.into()),
        parents: Some(vec![parent.into()]),
        modified_time: Some(Utc::now()),
        created_time: Some(Utc::now()),
        trashed: Some(false),
        ..Default::default()
    }
}

pub(crate) fn file(id: &str, name: &str, parent: &str, content: &[u8]) -> DriveFileMetadata {
    DriveFileMetadata {
        id: Some(id.into()),
        name: Some(name.into()),
        mime_type: Some("text/plain".into()),
        parents: Some(vec![parent.into()]),
        size: Some(content.len() as i64),
        md5_checksum: Some(format!("{:x}", Md5::digest(content))),
        modified_time: Some(Utc::now()),
        created_time: Some(Utc::now()),
        trashed: Some(false),
        ..Default::default()
    }
}

pub(crate) fn document(id: &str, name: &str, parent: &str) -> DriveFileMetadata {
    DriveFileMetadata {
        mime_type: Some("application/vnd.google-apps.document".into()),
        size: None,
        md5_checksum: None,
        ..file(id, name, parent, b"")
    }
}

pub(crate) fn updated(file: DriveFileMetadata) -> DriveChange {
    DriveChange {
        file_id: file.id.clone(),
        removed: Some(false),
        change_type: Some("file".into()),
        file: Some(file),
        time: Some(Utc::now()),
        ..Default::default()
    }
}

pub(crate) fn removed(id: &str) -> DriveChange {
    DriveChange {
        file_id: Some(id.into()),
        removed: Some(true),
        change_type: Some("file".into()),
        time: Some(Utc::now()),
        ..Default::default()
    }
}
