pub type Result<T> = anyhow::Result<T>;

pub type DriveFileMetadata = google_drive3::api::File;
pub type DriveChange = google_drive3::api::Change;
