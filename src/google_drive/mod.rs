use async_trait::async_trait;

pub use auth::{Credentials, OAuthClient, TokenEndpoint, TokenGrant};
pub use drive::GoogleDrive;
pub use drive_id::DriveId;

use crate::error::FsResult;
use crate::prelude::{DriveChange, DriveFileMetadata};
use crate::store::ChangeCursor;

pub(crate) mod auth;
mod drive;
mod drive_id;
#[cfg(test)]
pub(crate) mod fake;
pub mod helpers;

/// Changes reported since a cursor, across all pages.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<DriveChange>,
    /// Where the next poll should start. `None` if the remote did not say.
    pub new_cursor: Option<ChangeCursor>,
}

/// The remote operations the sync engine and the on-demand download need.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Cursor pointing at "now" in the change feed.
    async fn start_page_token(&self) -> FsResult<ChangeCursor>;
    /// Metadata of the root folder of the drive.
    async fn root_metadata(&self) -> FsResult<DriveFileMetadata>;
    /// Every non-trashed child of a folder.
    async fn list_folder(&self, folder: &DriveId) -> FsResult<Vec<DriveFileMetadata>>;
    async fn changes_since(&self, cursor: &ChangeCursor) -> FsResult<ChangeBatch>;
    /// Streams the content of a file into `target` and returns the byte count.
    async fn download(
        &self,
        file: &DriveId,
        target: &mut (dyn std::io::Write + Send),
    ) -> FsResult<u64>;
}
