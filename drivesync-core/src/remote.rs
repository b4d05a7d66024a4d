use std::path::Path;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::client::DriveError;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Alias the store accepts for the top of the account tree.
pub const ACCOUNT_ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub kind: RemoteKind,
    pub parents: Vec<String>,
    pub md5: Option<String>,
    pub modified: Option<OffsetDateTime>,
    pub trashed: bool,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == RemoteKind::Folder
    }

    /// First parent; the store allows several but the sync model follows one.
    pub fn parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub remote_id: String,
    pub removed: bool,
    pub item: Option<RemoteItem>,
}

impl RemoteChange {
    /// Removed outright or moved to the trash.
    pub fn is_gone(&self) -> bool {
        self.removed || self.item.as_ref().is_some_and(|item| item.trashed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<RemoteChange>,
    pub new_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub md5: Option<String>,
}

/// Operations the sync engine needs from a remote object store.
///
/// `delete` treats a missing object as success. Every other call reports a
/// missing object as an error whose [`crate::ErrorClass`] is `NotFound`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, DriveError>;

    /// Creates an empty file object and returns its id. Content is sent
    /// separately with [`upload_file`](Self::upload_file), so a failed
    /// content upload can be retried without creating another object.
    async fn create_file(&self, name: &str, parent_id: &str) -> Result<String, DriveError>;

    /// Replaces the content of the existing file `id` with `source`.
    async fn upload_file(&self, source: &Path, id: &str) -> Result<UploadedFile, DriveError>;

    async fn download_file(
        &self,
        id: &str,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<(), DriveError>;

    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteItem>, DriveError>;

    async fn list_changes(
        &self,
        cursor: &str,
        include_removed: bool,
    ) -> Result<ChangeSet, DriveError>;

    async fn current_cursor(&self) -> Result<String, DriveError>;

    async fn delete(&self, id: &str) -> Result<(), DriveError>;

    async fn metadata(&self, id: &str) -> Result<RemoteItem, DriveError>;
}
