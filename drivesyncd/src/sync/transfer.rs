use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivesync_core::{DriveError, RemoteKind, RemoteStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::archive::{ArchiveError, ArchiveRecord, ArchiveStore, FOLDER_HASH};
use super::crawler::EntryKind;
use super::paths::{file_md5, modified_ns};
use super::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote call failed for {path:?} (remote id {remote_id:?}): {source}")]
    Remote {
        path: PathBuf,
        remote_id: Option<String>,
        #[source]
        source: DriveError,
    },
    #[error("remote parent {parent_id} of {path:?} no longer exists")]
    ParentGone { path: PathBuf, parent_id: String },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} has no file name")]
    NoFileName(PathBuf),
    #[error("no remote root folder to upload {0:?} into")]
    NoRemoteRoot(PathBuf),
    #[error(
        "no local folder is mapped to remote parent {parent_id:?} of {name} ({remote_id}) and no download directory is configured"
    )]
    UnmappedParent {
        remote_id: String,
        name: String,
        parent_id: Option<String>,
    },
}

/// State shared by every upload and download worker of one run.
pub struct TransferContext {
    pub store: Arc<ArchiveStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub retry: RetryPolicy,
    /// Remote folder that receives the sync roots themselves. Only uploads
    /// need it.
    pub root_folder_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub path: PathBuf,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub remote_id: String,
    pub kind: RemoteKind,
    pub md5: Option<String>,
    pub destination: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn local_modified_ns(path: &Path) -> Result<i64, TransferError> {
    let metadata = tokio::fs::metadata(path).await.map_err(io_error(path))?;
    modified_ns(&metadata).map_err(io_error(path))
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::NoFileName(path.to_path_buf()))
}

async fn parent_remote_id(ctx: &TransferContext, path: &Path) -> Result<String, TransferError> {
    if let Some(parent) = path.parent() {
        if let Some(record) = ctx
            .store
            .find_by_path(parent)
            .await?
            .filter(ArchiveRecord::is_folder)
        {
            return Ok(record.remote_id);
        }
    }
    ctx.root_folder_id
        .clone()
        .ok_or_else(|| TransferError::NoRemoteRoot(path.to_path_buf()))
}

pub async fn upload(ctx: Arc<TransferContext>, item: UploadItem) -> Result<(), TransferError> {
    let parent_id = parent_remote_id(&ctx, &item.path).await?;
    match item.kind {
        EntryKind::Folder => upload_folder(&ctx, &item.path, &parent_id).await,
        EntryKind::File => upload_file(&ctx, &item.path, &parent_id).await,
    }
}

async fn upload_folder(
    ctx: &TransferContext,
    path: &Path,
    parent_id: &str,
) -> Result<(), TransferError> {
    if ctx.store.find_by_path(path).await?.is_some() {
        debug!(path = %path.display(), "folder already archived");
        return Ok(());
    }
    let name = file_name(path)?;
    let remote = &ctx.remote;
    let created = ctx
        .retry
        .run_remote("create_folder", || remote.create_folder(&name, parent_id))
        .await
        .map_err(|source| TransferError::Remote {
            path: path.to_path_buf(),
            remote_id: None,
            source,
        })?;
    let Some(remote_id) = created else {
        return Err(TransferError::ParentGone {
            path: path.to_path_buf(),
            parent_id: parent_id.to_string(),
        });
    };

    let modified = local_modified_ns(path).await?;
    ctx.store
        .upsert(&ArchiveRecord::folder(
            path.to_path_buf(),
            remote_id.clone(),
            modified,
        ))
        .await?;
    info!(path = %path.display(), remote_id = %remote_id, "folder created");
    Ok(())
}

async fn upload_file(
    ctx: &TransferContext,
    path: &Path,
    parent_id: &str,
) -> Result<(), TransferError> {
    let existing = ctx
        .store
        .find_by_path(path)
        .await?
        .filter(|record| !record.is_folder())
        .map(|record| record.remote_id);

    // Captured before reading so an edit during upload shows up as newer.
    let modified = local_modified_ns(path).await?;
    let local_hash = file_md5(path).await.map_err(io_error(path))?;

    let mut uploaded = match existing.as_deref() {
        Some(id) => put_content(ctx, path, id).await?,
        None => None,
    };
    if uploaded.is_none() {
        if existing.is_some() {
            warn!(
                path = %path.display(),
                remote_id = ?existing,
                "archived remote file is gone, uploading as new"
            );
        }
        let id = create_remote_file(ctx, path, parent_id).await?;
        uploaded = put_content(ctx, path, &id).await?;
    }
    let Some(uploaded) = uploaded else {
        return Err(TransferError::ParentGone {
            path: path.to_path_buf(),
            parent_id: parent_id.to_string(),
        });
    };

    if let Some(remote_md5) = uploaded.md5.as_deref() {
        if !remote_md5.eq_ignore_ascii_case(&local_hash) {
            warn!(
                path = %path.display(),
                remote_id = %uploaded.id,
                "file changed while uploading"
            );
        }
    }

    ctx.store
        .upsert(&ArchiveRecord {
            local_path: path.to_path_buf(),
            remote_id: uploaded.id.clone(),
            modified_ns: modified,
            content_hash: local_hash,
        })
        .await?;
    info!(path = %path.display(), remote_id = %uploaded.id, "file uploaded");
    Ok(())
}

async fn create_remote_file(
    ctx: &TransferContext,
    path: &Path,
    parent_id: &str,
) -> Result<String, TransferError> {
    let name = file_name(path)?;
    let remote = &ctx.remote;
    let created = ctx
        .retry
        .run_remote("create_file", || remote.create_file(&name, parent_id))
        .await
        .map_err(|source| TransferError::Remote {
            path: path.to_path_buf(),
            remote_id: None,
            source,
        })?;
    created.ok_or_else(|| TransferError::ParentGone {
        path: path.to_path_buf(),
        parent_id: parent_id.to_string(),
    })
}

/// Only the content upload is retried; the object it targets already exists.
async fn put_content(
    ctx: &TransferContext,
    path: &Path,
    remote_id: &str,
) -> Result<Option<drivesync_core::UploadedFile>, TransferError> {
    let remote = &ctx.remote;
    ctx.retry
        .run_remote("upload_file", || remote.upload_file(path, remote_id))
        .await
        .map_err(|source| TransferError::Remote {
            path: path.to_path_buf(),
            remote_id: Some(remote_id.to_string()),
            source,
        })
}

pub async fn download(ctx: Arc<TransferContext>, item: DownloadItem) -> Result<(), TransferError> {
    let target = item.destination.as_path();
    let content_hash = match item.kind {
        RemoteKind::Folder => {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(io_error(target))?;
            FOLDER_HASH.to_string()
        }
        RemoteKind::File => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_error(parent))?;
            }
            let remote = &ctx.remote;
            let fetched = ctx
                .retry
                .run_remote("download_file", || {
                    remote.download_file(&item.remote_id, target, item.md5.as_deref())
                })
                .await
                .map_err(|source| TransferError::Remote {
                    path: target.to_path_buf(),
                    remote_id: Some(item.remote_id.clone()),
                    source,
                })?;
            if fetched.is_none() {
                warn!(
                    path = %target.display(),
                    remote_id = %item.remote_id,
                    "remote file vanished before download"
                );
                return Ok(());
            }
            match item.md5.clone() {
                Some(hash) => hash.to_ascii_lowercase(),
                None => file_md5(target).await.map_err(io_error(target))?,
            }
        }
    };

    let modified = local_modified_ns(target).await?;
    ctx.store
        .upsert(&ArchiveRecord {
            local_path: target.to_path_buf(),
            remote_id: item.remote_id.clone(),
            modified_ns: modified,
            content_hash,
        })
        .await?;
    info!(path = %target.display(), remote_id = %item.remote_id, "downloaded");
    Ok(())
}

/// Remote names may contain characters that are separators locally.
pub fn local_name(remote_name: &str) -> String {
    let cleaned: String = remote_name
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' { '_' } else { ch })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Local target for a remote item: its archived path, else next to its
/// archived parent folder, else inside `download_dir`.
pub async fn resolve_destination(
    store: &ArchiveStore,
    remote_id: &str,
    name: &str,
    parent_id: Option<&str>,
    download_dir: Option<&Path>,
) -> Result<PathBuf, TransferError> {
    if let Some(record) = store.find_by_remote_id(remote_id).await? {
        return Ok(record.local_path);
    }
    if let Some(parent_id) = parent_id {
        if let Some(parent) = store
            .find_by_remote_id(parent_id)
            .await?
            .filter(ArchiveRecord::is_folder)
        {
            return Ok(parent.local_path.join(local_name(name)));
        }
    }
    match download_dir {
        Some(dir) => Ok(dir.join(local_name(name))),
        None => Err(TransferError::UnmappedParent {
            remote_id: remote_id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake_remote::{ACCOUNT_ROOT, FakeRemote};
    use crate::sync::retry::Backoff;
    use drivesync_core::DriveClient;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn context(remote: Arc<FakeRemote>) -> Arc<TransferContext> {
        context_with(remote, RetryPolicy::default()).await
    }

    async fn context_with(remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Arc<TransferContext> {
        Arc::new(TransferContext {
            store: Arc::new(ArchiveStore::in_memory().await.unwrap()),
            remote,
            retry,
            root_folder_id: Some(ACCOUNT_ROOT.to_string()),
        })
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false),
        )
    }

    #[tokio::test]
    async fn uploading_new_file_archives_its_disk_hash() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, b"hello").unwrap();
        let remote = Arc::new(FakeRemote::new());
        let ctx = context(remote.clone()).await;

        upload(
            ctx.clone(),
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        )
        .await
        .unwrap();

        let record = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        assert_eq!(record.content_hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(remote.content(&record.remote_id).unwrap(), b"hello");
        assert_eq!(
            remote.item(&record.remote_id).unwrap().parent(),
            Some(ACCOUNT_ROOT)
        );
    }

    #[tokio::test]
    async fn files_land_under_their_archived_parent_folder() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("docs");
        let file = folder.join("a.txt");
        fs::create_dir(&folder).unwrap();
        fs::write(&file, b"a").unwrap();
        let remote = Arc::new(FakeRemote::new());
        let ctx = context(remote.clone()).await;

        for item in [
            UploadItem {
                path: folder.clone(),
                kind: EntryKind::Folder,
            },
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        ] {
            upload(ctx.clone(), item).await.unwrap();
        }

        let folder_record = ctx.store.find_by_path(&folder).await.unwrap().unwrap();
        let file_record = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        assert!(folder_record.is_folder());
        assert_eq!(
            remote.item(&file_record.remote_id).unwrap().parent(),
            Some(folder_record.remote_id.as_str())
        );
    }

    #[tokio::test]
    async fn re_upload_updates_the_same_remote_object() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"one").unwrap();
        let remote = Arc::new(FakeRemote::new());
        let ctx = context(remote.clone()).await;
        let item = UploadItem {
            path: file.clone(),
            kind: EntryKind::File,
        };

        upload(ctx.clone(), item.clone()).await.unwrap();
        let first = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        fs::write(&file, b"two").unwrap();
        upload(ctx.clone(), item).await.unwrap();
        let second = ctx.store.find_by_path(&file).await.unwrap().unwrap();

        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(remote.content(&second.remote_id).unwrap(), b"two");
    }

    #[tokio::test]
    async fn vanished_remote_object_is_recreated() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"one").unwrap();
        let remote = Arc::new(FakeRemote::new());
        let ctx = context(remote.clone()).await;
        ctx.store
            .upsert(&ArchiveRecord {
                local_path: file.clone(),
                remote_id: "deleted-elsewhere".into(),
                modified_ns: 0,
                content_hash: "old".into(),
            })
            .await
            .unwrap();

        upload(
            ctx.clone(),
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        )
        .await
        .unwrap();

        let record = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        assert_ne!(record.remote_id, "deleted-elsewhere");
        assert!(remote.item(&record.remote_id).is_some());
    }

    #[tokio::test]
    async fn rejected_upload_reports_path_and_leaves_archive_untouched() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, b"x").unwrap();
        let remote = Arc::new(FakeRemote::new());
        remote.fail_uploads_named("bad.bin");
        let ctx = context(remote).await;

        let err = upload(
            ctx.clone(),
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Remote { ref path, .. } if *path == file));
        assert!(ctx.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_content_failure_is_retried_against_one_created_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        let remote = Arc::new(FakeRemote::new());
        remote.fail_next_uploads(2);
        let ctx = context_with(remote.clone(), fast_retry()).await;

        upload(
            ctx.clone(),
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        )
        .await
        .unwrap();

        assert_eq!(remote.file_create_count(), 1);
        assert_eq!(remote.upload_count(), 1);
        let record = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        assert_eq!(remote.content(&record.remote_id).unwrap(), b"hello");
        assert_eq!(remote.find_by_name("a.txt").unwrap().id, record.remote_id);
    }

    #[tokio::test]
    async fn rest_upload_retry_posts_metadata_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "new-file" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/new-file"))
            .respond_with(ResponseTemplate::new(503).set_body_string("backend error"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/new-file"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "new-file",
                "md5Checksum": "5d41402abc4b2a76b9719d911017c592"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
        let ctx = context_with(Arc::new(client), fast_retry()).await;

        upload(
            ctx.clone(),
            UploadItem {
                path: file.clone(),
                kind: EntryKind::File,
            },
        )
        .await
        .unwrap();

        let posts = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.method.as_str() == "POST")
            .count();
        assert_eq!(posts, 1);
        let record = ctx.store.find_by_path(&file).await.unwrap().unwrap();
        assert_eq!(record.remote_id, "new-file");
    }

    #[tokio::test]
    async fn download_writes_file_and_archives_remote_hash() {
        let dir = tempdir().unwrap();
        let remote = Arc::new(FakeRemote::new());
        let id = remote.put_file("a.txt", ACCOUNT_ROOT, b"hello");
        let ctx = context(remote.clone()).await;
        let target = dir.path().join("nested/a.txt");

        download(
            ctx.clone(),
            DownloadItem {
                remote_id: id.clone(),
                kind: RemoteKind::File,
                md5: remote.item(&id).unwrap().md5,
                destination: target.clone(),
            },
        )
        .await
        .unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"hello");
        let record = ctx.store.find_by_remote_id(&id).await.unwrap().unwrap();
        assert_eq!(record.local_path, target);
        assert_eq!(record.content_hash, "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn download_of_vanished_file_is_a_no_op() {
        let dir = tempdir().unwrap();
        let ctx = context(Arc::new(FakeRemote::new())).await;

        download(
            ctx.clone(),
            DownloadItem {
                remote_id: "missing".into(),
                kind: RemoteKind::File,
                md5: None,
                destination: dir.path().join("a.txt"),
            },
        )
        .await
        .unwrap();

        assert!(!dir.path().join("a.txt").exists());
        assert!(ctx.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn destination_prefers_record_then_parent_then_download_dir() {
        let store = ArchiveStore::in_memory().await.unwrap();
        store
            .upsert(&ArchiveRecord::folder("/sync/Docs".into(), "dir".into(), 0))
            .await
            .unwrap();
        store
            .upsert(&ArchiveRecord {
                local_path: "/sync/Docs/kept.txt".into(),
                remote_id: "kept".into(),
                modified_ns: 0,
                content_hash: "h".into(),
            })
            .await
            .unwrap();
        let downloads = Path::new("/downloads");

        let archived = resolve_destination(&store, "kept", "renamed.txt", Some("dir"), None)
            .await
            .unwrap();
        let sibling = resolve_destination(&store, "new", "b/c.txt", Some("dir"), None)
            .await
            .unwrap();
        let untracked =
            resolve_destination(&store, "other", "x.txt", Some("elsewhere"), Some(downloads))
                .await
                .unwrap();
        let unmapped = resolve_destination(&store, "other", "x.txt", Some("elsewhere"), None).await;

        assert_eq!(archived, PathBuf::from("/sync/Docs/kept.txt"));
        assert_eq!(sibling, PathBuf::from("/sync/Docs/b_c.txt"));
        assert_eq!(untracked, PathBuf::from("/downloads/x.txt"));
        assert!(matches!(
            unmapped,
            Err(TransferError::UnmappedParent { .. })
        ));
    }

    #[test]
    fn local_name_replaces_separators() {
        assert_eq!(local_name("a/b\\c"), "a_b_c");
        assert_eq!(local_name(".."), "_");
        assert_eq!(local_name("plain.txt"), "plain.txt");
    }
}
