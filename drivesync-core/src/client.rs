use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use md5::Context;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::remote::{
    ChangeSet, FOLDER_MIME_TYPE, RemoteChange, RemoteItem, RemoteKind, RemoteStore, UploadedFile,
};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,md5Checksum,modifiedTime,parents,trashed";
const PAGE_SIZE: &str = "100";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid modified time: {0}")]
    Time(#[from] time::error::Parse),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

impl DriveError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            DriveError::Api { status, body } => classify_api_status(*status, body),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                ErrorClass::Transient
            }
            DriveError::IntegrityMismatch { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ErrorClass {
    if status == StatusCode::NOT_FOUND {
        ErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && (body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")))
    {
        ErrorClass::RateLimit
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    async fn get_file(&self, id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files", id])?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn create_metadata(&self, metadata: &NewFile<'_>) -> Result<String, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files"])?;
        url.query_pairs_mut().append_pair("fields", "id");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(metadata)
            .send()
            .await?;
        let created: CreatedFile = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn list_children_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(
                    "q",
                    &format!(
                        "'{}' in parents and trashed = false",
                        folder_id.replace('\'', "\\'")
                    ),
                )
                .append_pair("pageSize", PAGE_SIZE)
                .append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn list_changes_page(
        &self,
        page_token: &str,
        include_removed: bool,
    ) -> Result<ChangeList, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "changes"])?;
        url.query_pairs_mut()
            .append_pair("pageToken", page_token)
            .append_pair(
                "includeRemoved",
                if include_removed { "true" } else { "false" },
            )
            .append_pair("restrictToMyDrive", "true")
            .append_pair("pageSize", PAGE_SIZE)
            .append_pair(
                "fields",
                &format!(
                    "nextPageToken,newStartPageToken,changes(fileId,removed,file({FILE_FIELDS}))"
                ),
            );
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DriveError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, DriveError> {
        self.create_metadata(&NewFile {
            name,
            mime_type: Some(FOLDER_MIME_TYPE),
            parents: vec![parent_id],
        })
        .await
    }

    async fn create_file(&self, name: &str, parent_id: &str) -> Result<String, DriveError> {
        self.create_metadata(&NewFile {
            name,
            mime_type: None,
            parents: vec![parent_id],
        })
        .await
    }

    async fn upload_file(&self, source: &Path, id: &str) -> Result<UploadedFile, DriveError> {
        let mut url = self.endpoint(&["upload", "drive", "v3", "files", id])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", "id,md5Checksum");
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        let uploaded: CreatedFile = Self::handle_response(response).await?;
        Ok(UploadedFile {
            id: uploaded.id,
            md5: uploaded.md5_checksum,
        })
    }

    async fn download_file(
        &self,
        id: &str,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<(), DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files", id])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = Context::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            md5.consume(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected_md5) = expected_md5 {
            let actual_md5 = format!("{:x}", md5.compute());
            if actual_md5 != expected_md5.to_ascii_lowercase() {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(DriveError::IntegrityMismatch {
                    expected_md5: expected_md5.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }

        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteItem>, DriveError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_children_page(folder_id, page_token.as_deref())
                .await?;
            for file in page.files {
                items.push(file.into_item()?);
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    async fn list_changes(
        &self,
        cursor: &str,
        include_removed: bool,
    ) -> Result<ChangeSet, DriveError> {
        let mut page_token = cursor.to_string();
        let mut changes = Vec::new();
        loop {
            let page = self
                .list_changes_page(&page_token, include_removed)
                .await?;
            for change in page.changes {
                let Some(remote_id) = change.file_id else {
                    continue;
                };
                changes.push(RemoteChange {
                    remote_id,
                    removed: change.removed,
                    item: change.file.map(DriveFile::into_item).transpose()?,
                });
            }
            if let Some(new_cursor) = page.new_start_page_token {
                return Ok(ChangeSet {
                    changes,
                    new_cursor,
                });
            }
            match page.next_page_token {
                Some(next) => page_token = next,
                None => {
                    return Ok(ChangeSet {
                        changes,
                        new_cursor: page_token,
                    });
                }
            }
        }
    }

    async fn current_cursor(&self) -> Result<String, DriveError> {
        let url = self.endpoint(&["drive", "v3", "changes", "startPageToken"])?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let token: StartPageToken = Self::handle_response(response).await?;
        Ok(token.start_page_token)
    }

    async fn delete(&self, id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&["drive", "v3", "files", id])?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    async fn metadata(&self, id: &str) -> Result<RemoteItem, DriveError> {
        self.get_file(id).await?.into_item()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    parents: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedFile {
    id: String,
    #[serde(default)]
    md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    md5_checksum: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    trashed: bool,
}

impl DriveFile {
    fn into_item(self) -> Result<RemoteItem, DriveError> {
        let modified = self
            .modified_time
            .as_deref()
            .map(|value| OffsetDateTime::parse(value, &Rfc3339))
            .transpose()?;
        let kind = if self.mime_type == FOLDER_MIME_TYPE {
            RemoteKind::Folder
        } else {
            RemoteKind::File
        };
        Ok(RemoteItem {
            id: self.id,
            name: self.name,
            kind,
            parents: self.parents,
            md5: self.md5_checksum,
            modified,
            trashed: self.trashed,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    #[serde(default)]
    changes: Vec<DriveChange>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_keeps_original_extension() {
        assert_eq!(
            partial_path(Path::new("/tmp/a.txt")),
            PathBuf::from("/tmp/a.txt.partial")
        );
        assert_eq!(
            partial_path(Path::new("/tmp/noext")),
            PathBuf::from("/tmp/noext.partial")
        );
    }

    #[test]
    fn classifies_rate_limit_forbidden_as_retryable() {
        let err = DriveError::Api {
            status: StatusCode::FORBIDDEN,
            body: r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#.into(),
        };
        assert_eq!(err.classification(), ErrorClass::RateLimit);
    }

    #[test]
    fn classifies_plain_forbidden_as_auth() {
        let err = DriveError::Api {
            status: StatusCode::FORBIDDEN,
            body: "insufficientPermissions".into(),
        };
        assert_eq!(err.classification(), ErrorClass::Auth);
    }

    #[test]
    fn classifies_server_errors_and_missing_objects() {
        let server = DriveError::Api {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let missing = DriveError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        let invalid = DriveError::Api {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert_eq!(server.classification(), ErrorClass::Transient);
        assert_eq!(missing.classification(), ErrorClass::NotFound);
        assert_eq!(invalid.classification(), ErrorClass::Permanent);
    }
}
