use std::collections::HashSet;
use std::path::{Path, PathBuf};

use drivesync_core::{ChangeSet, DriveError, RemoteItem, RemoteKind, RemoteStore};
use thiserror::Error;
use tracing::debug;

use super::archive::{ArchiveError, ArchiveRecord, ArchiveStore};
use super::blacklist::Blacklist;
use super::paths::{datetime_ns, path_key};
use super::reconcile::{ReconcileError, Reconciler, SyncDecision};
use super::remote_paths::{RemoteNode, RemotePathCache};
use super::retry::RetryPolicy;
use super::transfer::local_name;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Remote(#[from] DriveError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// A remote change that needs action locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeItem {
    pub decision: SyncDecision,
    pub kind: RemoteKind,
    pub remote_id: String,
    pub remote_path: String,
    pub content_hash: Option<String>,
    pub name: String,
    pub parent_id: Option<String>,
    pub modified_ns: Option<i64>,
}

impl ChangeItem {
    /// Number of path segments, so `/a/b` is 2.
    pub fn depth(&self) -> usize {
        self.remote_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .count()
    }

    pub fn is_folder(&self) -> bool {
        self.kind == RemoteKind::Folder
    }
}

fn in_scope(path: &str, scopes: &[String]) -> bool {
    scopes.iter().any(|scope| {
        path.strip_prefix(scope.as_str())
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
    })
}

pub struct ChangePoller<'a> {
    remote: &'a dyn RemoteStore,
    store: &'a ArchiveStore,
    blacklist: &'a Blacklist,
    paths: &'a RemotePathCache,
    retry: RetryPolicy,
}

impl<'a> ChangePoller<'a> {
    pub fn new(
        remote: &'a dyn RemoteStore,
        store: &'a ArchiveStore,
        blacklist: &'a Blacklist,
        paths: &'a RemotePathCache,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            store,
            blacklist,
            paths,
            retry,
        }
    }

    /// Full remote path of `id`, resolved through the path cache.
    pub async fn remote_path(&self, id: &str) -> Result<Option<String>, DriveError> {
        let remote = self.remote;
        let retry = self.retry;
        self.paths
            .resolve(id, |node_id| async move {
                let item = retry
                    .run_remote("metadata", || remote.metadata(&node_id))
                    .await?;
                Ok(item.map(|item| RemoteNode {
                    parent: item.parent().map(str::to_string),
                    name: item.name,
                }))
            })
            .await
    }

    /// Remote paths of the sync roots that have been uploaded at least once.
    pub async fn scopes(&self) -> Result<Vec<String>, PollError> {
        let mut roots: Vec<&Path> = self
            .blacklist
            .roots()
            .iter()
            .map(PathBuf::as_path)
            .collect();
        roots.sort();

        let mut scopes = Vec::new();
        for root in roots {
            let Some(record) = self.store.find_by_path(root).await? else {
                debug!(root = %root.display(), "sync root has no remote folder yet");
                continue;
            };
            if let Some(path) = self.remote_path(&record.remote_id).await? {
                scopes.push(path);
            }
        }
        Ok(scopes)
    }

    async fn list_changes(&self, cursor: &str, include_removed: bool) -> Result<ChangeSet, PollError> {
        let remote = self.remote;
        let changes = self
            .retry
            .run_remote("list_changes", || remote.list_changes(cursor, include_removed))
            .await?;
        Ok(changes.unwrap_or_else(|| ChangeSet {
            changes: Vec::new(),
            new_cursor: cursor.to_string(),
        }))
    }

    /// Changes after `cursor` that need a download or a conflict decision.
    /// Nothing is persisted; the caller stores the returned cursor.
    pub async fn poll_changes(
        &self,
        cursor: &str,
        last_sync: Option<i64>,
    ) -> Result<(Vec<ChangeItem>, String), PollError> {
        let set = self.list_changes(cursor, false).await?;
        // A renamed or moved folder changes the path of its whole subtree.
        if set
            .changes
            .iter()
            .any(|change| change.item.as_ref().is_some_and(RemoteItem::is_folder))
        {
            self.paths.clear();
        }
        let scopes = self.scopes().await?;
        if scopes.is_empty() {
            return Ok((Vec::new(), set.new_cursor));
        }

        // Later events for the same id supersede earlier ones.
        let mut seen = HashSet::new();
        let mut latest: Vec<RemoteItem> = Vec::new();
        for change in set.changes.into_iter().rev() {
            if !seen.insert(change.remote_id.clone()) || change.is_gone() {
                continue;
            }
            if let Some(item) = change.item {
                latest.push(item);
            }
        }
        latest.reverse();

        let reconciler = Reconciler::new(self.blacklist);
        let mut items = Vec::new();
        for item in latest {
            if let (Some(since), Some(modified)) = (last_sync, item.modified) {
                if modified.unix_timestamp() < since {
                    continue;
                }
            }
            let remote_path = match item.parent() {
                Some(parent) => match self.remote_path(parent).await? {
                    Some(parent_path) => format!("{parent_path}/{}", item.name),
                    None => format!("/{}", item.name),
                },
                None => format!("/{}", item.name),
            };
            if !in_scope(&remote_path, &scopes) {
                continue;
            }
            if self.blacklist.is_excluded(Path::new(&item.name)) {
                debug!(remote_path = %remote_path, "remote item matches an exclusion rule");
                continue;
            }

            let record = self.store.find_by_remote_id(&item.id).await?;
            let modified_ns = item.modified.map(datetime_ns);
            let decision = match item.kind {
                RemoteKind::Folder => match &record {
                    Some(record) if self.blacklist.is_excluded_within_roots(&record.local_path) => {
                        SyncDecision::None
                    }
                    _ => SyncDecision::Safe,
                },
                RemoteKind::File => {
                    let Some(hash) = item.md5.as_deref() else {
                        debug!(remote_path = %remote_path, "remote file has no content hash, skipping");
                        continue;
                    };
                    reconciler
                        .decide_for(record.as_ref(), hash, modified_ns)
                        .await?
                }
            };
            if decision == SyncDecision::None {
                let moved = match &record {
                    Some(record) if !self.blacklist.is_excluded_within_roots(&record.local_path) => {
                        self.moved_locally(record, &item).await?
                    }
                    _ => false,
                };
                if !moved {
                    continue;
                }
            }

            items.push(ChangeItem {
                decision,
                kind: item.kind,
                content_hash: item.md5.clone(),
                parent_id: item.parent().map(str::to_string),
                remote_id: item.id,
                remote_path,
                name: item.name,
                modified_ns,
            });
        }
        Ok((items, set.new_cursor))
    }

    /// Whether the archived location of `record` no longer matches the
    /// item's remote name and parent.
    async fn moved_locally(&self, record: &ArchiveRecord, item: &RemoteItem) -> Result<bool, PollError> {
        let Some(parent_id) = item.parent() else {
            return Ok(false);
        };
        let Some(parent) = self
            .store
            .find_by_remote_id(parent_id)
            .await?
            .filter(ArchiveRecord::is_folder)
        else {
            return Ok(false);
        };
        let expected = parent.local_path.join(local_name(&item.name));
        Ok(path_key(&expected) != path_key(&record.local_path))
    }

    /// Ids reported removed or trashed since `cursor`.
    pub async fn poll_removed(&self, cursor: &str) -> Result<(Vec<String>, String), PollError> {
        let set = self.list_changes(cursor, true).await?;
        let mut seen = HashSet::new();
        let ids = set
            .changes
            .into_iter()
            .filter(|change| change.is_gone())
            .map(|change| change.remote_id)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Ok((ids, set.new_cursor))
    }
}
