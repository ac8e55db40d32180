use tracing::instrument;

use crate::error::{FsError, FsResult};
use crate::google_drive::{helpers, DriveId};
use crate::prelude::{DriveChange, DriveFileMetadata};

#[derive(Debug, Clone)]
pub enum ChangeKind {
    /// The file is gone for this account: deleted, trashed, or turned into a
    /// document type that is not mirrored.
    Removed,
    Updated(DriveFileMetadata),
    /// Changes to shared drives themselves; not mirrored.
    Drive,
}

#[derive(Debug, Clone)]
pub struct Change {
    pub id: DriveId,
    pub kind: ChangeKind,
}

impl ChangeKind {
    fn from_drive_change(
        change_type: Option<&str>,
        file: Option<DriveFileMetadata>,
        removed: bool,
    ) -> FsResult<ChangeKind> {
        if removed {
            return Ok(Self::Removed);
        }
        match (change_type, file) {
            (Some("drive"), _) => Ok(Self::Drive),
            (Some("file") | None, Some(file)) => {
                if file.trashed.unwrap_or(false) || helpers::is_native_document(&file) {
                    Ok(Self::Removed)
                } else {
                    Ok(Self::Updated(file))
                }
            }
            (Some("file") | None, None) => Err(FsError::RemoteRejected(
                "file change without file metadata".into(),
            )),
            (Some(other), _) => Err(FsError::RemoteRejected(format!(
                "invalid change type: {other}"
            ))),
        }
    }
}

impl TryFrom<DriveChange> for Change {
    type Error = FsError;
    #[instrument(skip(drive_change), fields(file_id = ?drive_change.file_id))]
    fn try_from(drive_change: DriveChange) -> FsResult<Self> {
        let removed = drive_change.removed.unwrap_or(false);
        let id = drive_change
            .file_id
            .or_else(|| drive_change.file.as_ref().and_then(|f| f.id.clone()))
            .ok_or_else(|| FsError::RemoteRejected("change without file id".into()))?;
        Ok(Self {
            id: DriveId::from(id),
            kind: ChangeKind::from_drive_change(
                drive_change.change_type.as_deref(),
                drive_change.file,
                removed,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google_drive::helpers::FOLDER_MIME_TYPE;

    fn change(file: Option<DriveFileMetadata>, removed: bool) -> DriveChange {
        DriveChange {
            file_id: Some("f".into()),
            removed: Some(removed),
            change_type: Some("file".into()),
            file,
            ..Default::default()
        }
    }

    fn metadata(mime: &str, trashed: bool) -> DriveFileMetadata {
        DriveFileMetadata {
            id: Some("f".into()),
            name: Some("n".into()),
            mime_type: Some(mime.into()),
            trashed: Some(trashed),
            ..Default::default()
        }
    }

    #[test]
    fn removals_trash_and_native_documents() {
        let removed = Change::try_from(change(None, true)).unwrap();
        assert!(matches!(removed.kind, ChangeKind::Removed));
        let trashed = Change::try_from(change(Some(metadata("text/plain", true)), false)).unwrap();
        assert!(matches!(trashed.kind, ChangeKind::Removed));
        let doc = Change::try_from(change(
            Some(metadata("application/vnd.google-apps.document", false)),
            false,
        ))
        .unwrap();
        assert!(matches!(doc.kind, ChangeKind::Removed));
        let folder = Change::try_from(change(Some(metadata(FOLDER_MIME_TYPE, false)), false)).unwrap();
        assert!(matches!(folder.kind, ChangeKind::Updated(_)));
        assert_eq!(DriveId::from("f"), folder.id);
    }

    #[test]
    fn malformed_changes_are_rejected() {
        assert!(Change::try_from(change(None, false)).is_err());
        let mut no_id = change(None, true);
        no_id.file_id = None;
        assert!(Change::try_from(no_id).is_err());
        let mut drive = change(None, false);
        drive.change_type = Some("drive".into());
        assert!(matches!(
            Change::try_from(drive).unwrap().kind,
            ChangeKind::Drive
        ));
    }
}
