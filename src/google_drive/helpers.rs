use std::str::FromStr;
use std::time::SystemTime;

use mime::Mime;

use crate::google_drive::DriveId;
use crate::prelude::DriveFileMetadata;
use crate::store::{EntryKind, RemoteEntry};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const NATIVE_SUBTYPE_PREFIX: &str = "vnd.google-apps.";

pub fn get_mime_from_file_metadata(file: &DriveFileMetadata) -> Option<Mime> {
    Mime::from_str(file.mime_type.as_deref()?).ok()
}

pub fn is_folder(file: &DriveFileMetadata) -> bool {
    file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
}

/// Documents that only exist inside the provider (Docs, Sheets, shortcuts, ...) and
/// have no binary content to download.
pub fn is_native_document(file: &DriveFileMetadata) -> bool {
    if is_folder(file) {
        return false;
    }
    match get_mime_from_file_metadata(file) {
        Some(mime) => {
            mime.type_() == mime::APPLICATION
                && mime.subtype().as_str().starts_with(NATIVE_SUBTYPE_PREFIX)
        }
        None => false,
    }
}

pub fn kind_of(file: &DriveFileMetadata) -> EntryKind {
    if is_folder(file) {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

/// Builds the store representation of `file`, placed under `parent`
/// (`None` for the drive root). Returns `None` if the metadata has no id or name.
pub fn remote_entry(file: &DriveFileMetadata, parent: Option<DriveId>) -> Option<RemoteEntry> {
    let external_id = DriveId::from(file.id.as_ref()?);
    let name = file.name.clone()?;
    let mtime = file
        .modified_time
        .map(SystemTime::from)
        .unwrap_or_else(SystemTime::now);
    let ctime = file.created_time.map(SystemTime::from).unwrap_or(mtime);
    Some(RemoteEntry {
        external_id,
        name,
        kind: kind_of(file),
        size: file.size.unwrap_or(0).max(0) as u64,
        mtime,
        ctime,
        checksum: file.md5_checksum.clone(),
        parent_external_id: parent,
    })
}

/// First parent listed for `file`, if any.
pub fn first_parent(file: &DriveFileMetadata) -> Option<DriveId> {
    file.parents.as_ref()?.first().map(DriveId::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(mime: &str) -> DriveFileMetadata {
        DriveFileMetadata {
            id: Some("id".into()),
            name: Some("name".into()),
            mime_type: Some(mime.into()),
            ..Default::default()
        }
    }

    #[test]
    fn native_documents_are_recognized() {
        assert!(is_native_document(&file("application/vnd.google-apps.document")));
        assert!(is_native_document(&file("application/vnd.google-apps.spreadsheet")));
        assert!(is_native_document(&file("application/vnd.google-apps.shortcut")));
        assert!(!is_native_document(&file(FOLDER_MIME_TYPE)));
        assert!(!is_native_document(&file("application/pdf")));
        assert!(!is_native_document(&file("text/plain")));
    }

    #[test]
    fn remote_entry_from_metadata() {
        let mut f = file("text/plain");
        f.size = Some(42);
        f.md5_checksum = Some("abc".into());
        f.parents = Some(vec!["p1".into(), "p2".into()]);
        let entry = remote_entry(&f, first_parent(&f)).unwrap();
        assert_eq!(EntryKind::File, entry.kind);
        assert_eq!(42, entry.size);
        assert_eq!(Some(DriveId::from("p1")), entry.parent_external_id);
        assert_eq!(Some("abc".to_string()), entry.checksum);

        let folder = file(FOLDER_MIME_TYPE);
        assert_eq!(
            EntryKind::Directory,
            remote_entry(&folder, None).unwrap().kind
        );
        let nameless = DriveFileMetadata {
            id: Some("x".into()),
            ..Default::default()
        };
        assert!(remote_entry(&nameless, None).is_none());
    }
}
