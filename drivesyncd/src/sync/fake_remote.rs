//! In-memory [`RemoteStore`] used by the engine and transfer tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use drivesync_core::{
    ChangeSet, DriveError, RemoteChange, RemoteItem, RemoteKind, RemoteStore, StatusCode,
    UploadedFile,
};
use time::OffsetDateTime;

pub use drivesync_core::ACCOUNT_ROOT_ID as ACCOUNT_ROOT;

#[derive(Default)]
struct State {
    objects: BTreeMap<String, (RemoteItem, Vec<u8>)>,
    log: Vec<RemoteChange>,
    next_id: u64,
    failing_names: HashSet<String>,
    transient_upload_failures: usize,
    uploads: usize,
    creates: usize,
    file_creates: usize,
}

impl State {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn touch(&mut self, id: &str) {
        if let Some((item, _)) = self.objects.get(id) {
            self.log.push(RemoteChange {
                remote_id: id.to_string(),
                removed: false,
                item: Some(item.clone()),
            });
        }
    }

    fn parent_known(&self, parent_id: &str) -> bool {
        parent_id == ACCOUNT_ROOT || self.objects.contains_key(parent_id)
    }
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
}

fn not_found(what: &str) -> DriveError {
    DriveError::Api {
        status: StatusCode::NOT_FOUND,
        body: format!("{what} not found"),
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Simulates an edit made by another client.
    pub fn put_file(&self, name: &str, parent_id: &str, content: &[u8]) -> String {
        let mut state = self.state();
        let id = state.fresh_id("file");
        state.objects.insert(
            id.clone(),
            (file_item(&id, name, parent_id, content), content.to_vec()),
        );
        state.touch(&id);
        id
    }

    pub fn put_folder(&self, name: &str, parent_id: &str) -> String {
        let mut state = self.state();
        let id = state.fresh_id("dir");
        state
            .objects
            .insert(id.clone(), (folder_item(&id, name, parent_id), Vec::new()));
        state.touch(&id);
        id
    }

    pub fn overwrite(&self, id: &str, content: &[u8]) {
        let mut state = self.state();
        if let Some((item, bytes)) = state.objects.get_mut(id) {
            item.md5 = Some(md5_hex(content));
            item.modified = Some(OffsetDateTime::now_utc());
            *bytes = content.to_vec();
        }
        state.touch(id);
    }

    pub fn trash(&self, id: &str) {
        let mut state = self.state();
        if let Some((item, _)) = state.objects.get_mut(id) {
            item.trashed = true;
        }
        state.touch(id);
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.state();
        state.objects.remove(id);
        state.log.push(RemoteChange {
            remote_id: id.to_string(),
            removed: true,
            item: None,
        });
    }

    /// Renames and/or moves an item, as another client would.
    pub fn relocate(&self, id: &str, name: &str, parent_id: &str) {
        let mut state = self.state();
        if let Some((item, _)) = state.objects.get_mut(id) {
            item.name = name.to_string();
            item.parents = vec![parent_id.to_string()];
            item.modified = Some(OffsetDateTime::now_utc());
        }
        state.touch(id);
    }

    /// The next `count` content uploads fail with a 503.
    pub fn fail_next_uploads(&self, count: usize) {
        self.state().transient_upload_failures = count;
    }

    pub fn fail_uploads_named(&self, name: &str) {
        self.state().failing_names.insert(name.to_string());
    }

    pub fn item(&self, id: &str) -> Option<RemoteItem> {
        self.state().objects.get(id).map(|(item, _)| item.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state().objects.get(id).map(|(_, bytes)| bytes.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<RemoteItem> {
        self.state()
            .objects
            .values()
            .find(|(item, _)| item.name == name)
            .map(|(item, _)| item.clone())
    }

    pub fn upload_count(&self) -> usize {
        self.state().uploads
    }

    /// Folders created through the store API.
    pub fn create_count(&self) -> usize {
        self.state().creates
    }

    pub fn file_create_count(&self) -> usize {
        self.state().file_creates
    }
}

fn md5_hex(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

fn folder_item(id: &str, name: &str, parent_id: &str) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        name: name.to_string(),
        kind: RemoteKind::Folder,
        parents: vec![parent_id.to_string()],
        md5: None,
        modified: Some(OffsetDateTime::now_utc()),
        trashed: false,
    }
}

fn file_item(id: &str, name: &str, parent_id: &str, content: &[u8]) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        name: name.to_string(),
        kind: RemoteKind::File,
        parents: vec![parent_id.to_string()],
        md5: Some(md5_hex(content)),
        modified: Some(OffsetDateTime::now_utc()),
        trashed: false,
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, DriveError> {
        let mut state = self.state();
        if !state.parent_known(parent_id) {
            return Err(not_found(parent_id));
        }
        state.creates += 1;
        let id = state.fresh_id("dir");
        state
            .objects
            .insert(id.clone(), (folder_item(&id, name, parent_id), Vec::new()));
        state.touch(&id);
        Ok(id)
    }

    async fn create_file(&self, name: &str, parent_id: &str) -> Result<String, DriveError> {
        let mut state = self.state();
        if !state.parent_known(parent_id) {
            return Err(not_found(parent_id));
        }
        state.file_creates += 1;
        let id = state.fresh_id("file");
        state
            .objects
            .insert(id.clone(), (file_item(&id, name, parent_id, b""), Vec::new()));
        state.touch(&id);
        Ok(id)
    }

    async fn upload_file(&self, source: &Path, id: &str) -> Result<UploadedFile, DriveError> {
        let content = tokio::fs::read(source).await?;
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut state = self.state();
        if state.failing_names.contains(&name) {
            return Err(DriveError::Api {
                status: StatusCode::BAD_REQUEST,
                body: format!("upload of {name} rejected"),
            });
        }
        if state.transient_upload_failures > 0 {
            state.transient_upload_failures -= 1;
            return Err(DriveError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "backend error".to_string(),
            });
        }
        let Some((item, bytes)) = state.objects.get_mut(id) else {
            return Err(not_found(id));
        };
        item.md5 = Some(md5_hex(&content));
        item.modified = Some(OffsetDateTime::now_utc());
        *bytes = content;
        let md5 = item.md5.clone();
        state.uploads += 1;
        state.touch(id);
        Ok(UploadedFile {
            id: id.to_string(),
            md5,
        })
    }

    async fn download_file(
        &self,
        id: &str,
        target: &Path,
        _expected_md5: Option<&str>,
    ) -> Result<(), DriveError> {
        let content = self
            .content(id)
            .ok_or_else(|| not_found(id))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, content).await?;
        Ok(())
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteItem>, DriveError> {
        Ok(self
            .state()
            .objects
            .values()
            .filter(|(item, _)| !item.trashed && item.parent() == Some(folder_id))
            .map(|(item, _)| item.clone())
            .collect())
    }

    async fn list_changes(
        &self,
        cursor: &str,
        include_removed: bool,
    ) -> Result<ChangeSet, DriveError> {
        let state = self.state();
        let start = cursor.parse::<usize>().unwrap_or(0).min(state.log.len());
        let changes = state.log[start..]
            .iter()
            .filter(|change| include_removed || !change.removed)
            .cloned()
            .collect();
        Ok(ChangeSet {
            changes,
            new_cursor: state.log.len().to_string(),
        })
    }

    async fn current_cursor(&self) -> Result<String, DriveError> {
        Ok(self.state().log.len().to_string())
    }

    async fn delete(&self, id: &str) -> Result<(), DriveError> {
        let mut state = self.state();
        if state.objects.remove(id).is_some() {
            state.log.push(RemoteChange {
                remote_id: id.to_string(),
                removed: true,
                item: None,
            });
        }
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<RemoteItem, DriveError> {
        self.item(id).ok_or_else(|| not_found(id))
    }
}
