use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use google_drive3::api::{ChangeList, FileList, StartPageToken};
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument, trace, warn};

use crate::error::{FsError, FsResult};
use crate::google_drive::{ChangeBatch, Credentials, DriveId, RemoteDrive};
use crate::prelude::DriveFileMetadata;
use crate::store::ChangeCursor;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const FIELDS_FILE: &str = "id, name, size, mimeType, kind, md5Checksum, parents, trashed, createdTime, modifiedTime, viewedByMeTime";

/// Drive v3 REST client authenticated with the account credential.
#[derive(Clone)]
pub struct GoogleDrive {
    http: reqwest::Client,
    credentials: Arc<Credentials>,
    base: String,
    page_size: u32,
}

impl GoogleDrive {
    pub fn new(credentials: Arc<Credentials>, page_size: u32) -> Self {
        Self::with_base_url(credentials, page_size, API_BASE)
    }

    pub fn with_base_url(
        credentials: Arc<Credentials>,
        page_size: u32,
        base: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            base: base.into(),
            page_size: page_size.clamp(1, 1000),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> FsResult<Response> {
        let url = format!("{}/{}", self.base, path);
        let authorization = self.credentials.authorization().await?;
        trace!("GET {} {:?}", url, query);
        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, authorization)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        self.check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> FsResult<T> {
        let body = self
            .get(path, query)
            .await?
            .bytes()
            .await
            .map_err(transport_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| FsError::RemoteRejected(format!("undecodable response for {path}: {e}")))
    }

    async fn check_status(&self, response: Response) -> FsResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
            return Err(FsError::AuthExpired);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

fn transport_error(e: reqwest::Error) -> FsError {
    FsError::RemoteUnavailable(e.to_string())
}

fn status_error(status: StatusCode, body: &str) -> FsError {
    let message = format!("{status}: {body}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && body.contains("RateLimitExceeded"))
    {
        FsError::RemoteUnavailable(message)
    } else if status == StatusCode::NOT_FOUND {
        FsError::NotFound(message)
    } else {
        FsError::RemoteRejected(message)
    }
}

/// Ids end up inside a query string literal.
fn check_query_id(id: &DriveId) -> FsResult<()> {
    if id.as_str().is_empty() || id.as_str().contains('\'') {
        return Err(FsError::RemoteRejected(format!("invalid folder id {id:?}")));
    }
    Ok(())
}

#[async_trait]
impl RemoteDrive for GoogleDrive {
    #[instrument]
    async fn start_page_token(&self) -> FsResult<ChangeCursor> {
        let token: StartPageToken = self.get_json("changes/startPageToken", &[]).await?;
        token
            .start_page_token
            .map(ChangeCursor::from)
            .ok_or_else(|| FsError::RemoteRejected("no start page token returned".into()))
    }

    #[instrument]
    async fn root_metadata(&self) -> FsResult<DriveFileMetadata> {
        self.get_json(
            &format!("files/{}", DriveId::root()),
            &[("fields", FIELDS_FILE)],
        )
        .await
    }

    #[instrument]
    async fn list_folder(&self, folder: &DriveId) -> FsResult<Vec<DriveFileMetadata>> {
        check_query_id(folder)?;
        let q = format!("'{}' in parents and trashed = false", folder);
        let fields = format!("nextPageToken, files({})", FIELDS_FILE);
        let page_size = self.page_size.to_string();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
            ];
            if let Some(page_token) = &page_token {
                query.push(("pageToken", page_token.as_str()));
            }
            let list: FileList = self.get_json("files", &query).await?;
            let page = list.files.unwrap_or_default();
            debug!("list_folder: {} entries in page", page.len());
            files.extend(page);
            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(files)
    }

    #[instrument]
    async fn changes_since(&self, cursor: &ChangeCursor) -> FsResult<ChangeBatch> {
        let fields = format!(
            "changes(file({}), changeType, removed, fileId, time), newStartPageToken, nextPageToken",
            FIELDS_FILE
        );
        let page_size = self.page_size.to_string();
        let mut batch = ChangeBatch::default();
        let mut page_token = cursor.as_str().to_string();
        loop {
            debug!("getting changes since {} page: {}", cursor, page_token);
            let list: ChangeList = self
                .get_json(
                    "changes",
                    &[
                        ("pageToken", page_token.as_str()),
                        ("fields", fields.as_str()),
                        ("pageSize", page_size.as_str()),
                        ("includeRemoved", "true"),
                        ("spaces", "drive"),
                    ],
                )
                .await?;
            batch.changes.extend(list.changes.unwrap_or_default());
            if let Some(next_page_token) = list.next_page_token {
                page_token = next_page_token;
            } else if let Some(new_start_page_token) = list.new_start_page_token {
                batch.new_cursor = Some(ChangeCursor::from(new_start_page_token));
                break;
            } else {
                error!("no nextPageToken or newStartPageToken in change list");
                break;
            }
        }
        Ok(batch)
    }

    #[instrument(skip(target))]
    async fn download(
        &self,
        file: &DriveId,
        target: &mut (dyn std::io::Write + Send),
    ) -> FsResult<u64> {
        let mut response = self
            .get(
                &format!("files/{}", file),
                &[("alt", "media"), ("acknowledgeAbuse", "true")],
            )
            .await?;
        let mut written = 0u64;
        let mut counter = 0;
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            trace!("download: chunk {}", counter);
            target.write_all(&chunk)?;
            written += chunk.len() as u64;
            counter += 1;
        }
        target.flush()?;
        if written == 0 {
            warn!("downloaded an empty body for {}", file);
        }
        debug!("download: {} bytes", written);
        Ok(written)
    }
}

impl Debug for GoogleDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GoogleDrive")
    }
}

impl Display for GoogleDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GoogleDrive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(
            StatusCode::FORBIDDEN,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#
        )
        .is_transient());
        assert!(!status_error(StatusCode::FORBIDDEN, "insufficientPermissions").is_transient());
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, ""),
            FsError::NotFound(_)
        ));
    }

    #[test]
    fn folder_ids_are_checked_before_querying() {
        assert!(check_query_id(&DriveId::from("abc")).is_ok());
        assert!(check_query_id(&DriveId::from("a'b")).is_err());
        assert!(check_query_id(&DriveId::from("")).is_err());
    }

    #[test]
    fn change_list_decodes_into_api_types() {
        let json = r#"{
            "nextPageToken": null,
            "newStartPageToken": "1234",
            "changes": [
                {"fileId": "f1", "removed": true, "changeType": "file"},
                {"fileId": "f2", "removed": false, "changeType": "file",
                 "file": {"id": "f2", "name": "a.txt", "size": "42",
                          "mimeType": "text/plain", "parents": ["p"],
                          "modifiedTime": "2023-05-01T10:00:00.000Z"}}
            ]
        }"#;
        let list: ChangeList = serde_json::from_str(json).unwrap();
        assert_eq!(Some("1234".to_string()), list.new_start_page_token);
        let changes = list.changes.unwrap();
        assert_eq!(Some(true), changes[0].removed);
        let file = changes[1].file.as_ref().unwrap();
        assert_eq!(Some(42), file.size);
        assert!(file.modified_time.is_some());
    }
}
