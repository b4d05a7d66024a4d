use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drivesync_core::{ACCOUNT_ROOT_ID, DriveError, RemoteKind, RemoteStore};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

use super::archive::{ArchiveError, ArchiveRecord, ArchiveStore, CursorKind};
use super::blacklist::{Blacklist, BlacklistError};
use super::changes::{ChangeItem, ChangePoller, PollError};
use super::conflict::{ConflictPrompt, ConflictResolver, non_colliding_path};
use super::crawler::{EntryKind, LocalCrawler};
use super::paths::{datetime_ns, file_md5, is_within, path_key};
use super::queue::{QueueError, TransferQueue};
use super::reconcile::{ReconcileError, Reconciler, SyncDecision};
use super::remote_paths::RemotePathCache;
use super::retry::RetryPolicy;
use super::transfer::{
    self, DownloadItem, TransferContext, TransferError, UploadItem, local_name,
    resolve_destination,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("blacklist error: {0}")]
    Blacklist(#[from] BlacklistError),
    #[error("remote error: {0}")]
    Remote(#[from] DriveError),
    #[error("change polling failed: {0}")]
    Poll(#[from] PollError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("transfer queue failed: {0}")]
    Queue(#[from] QueueError<TransferError>),
    #[error("remote store returned no change cursor")]
    MissingCursor,
    #[error("remote root folder {0:?} could not be created")]
    RootFolderUnavailable(String),
    #[error("remote folder {0} does not exist")]
    MissingRemoteFolder(String),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> EngineError + '_ {
    move |source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-run dependencies shared by every component.
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<ArchiveStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub retry: RetryPolicy,
}

impl SyncContext {
    pub fn new(config: SyncConfig, store: Arc<ArchiveStore>, remote: Arc<dyn RemoteStore>) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            store,
            remote,
            retry,
        }
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

/// What a run did, or would do in dry mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub folders_created: Vec<PathBuf>,
    pub uploaded: Vec<PathBuf>,
    pub downloaded: Vec<PathBuf>,
    pub conflicts_deferred: Vec<PathBuf>,
    pub conflicts_rejected: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub blacklisted: Vec<PathBuf>,
    pub deleted_remote: Vec<PathBuf>,
    /// New local paths of items renamed or moved remotely.
    pub moved: Vec<PathBuf>,
    /// Archive entries forgotten because their remote object is gone.
    pub pruned: Vec<PathBuf>,
    /// Excluded paths deleted remotely and forgotten.
    pub purged: Vec<PathBuf>,
    pub blacklist_compacted: usize,
}

impl SyncReport {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.folders_created.extend(other.folders_created);
        self.uploaded.extend(other.uploaded);
        self.downloaded.extend(other.downloaded);
        self.conflicts_deferred.extend(other.conflicts_deferred);
        self.conflicts_rejected.extend(other.conflicts_rejected);
        self.removed.extend(other.removed);
        self.blacklisted.extend(other.blacklisted);
        self.deleted_remote.extend(other.deleted_remote);
        self.moved.extend(other.moved);
        self.pruned.extend(other.pruned);
        self.purged.extend(other.purged);
        self.blacklist_compacted += other.blacklist_compacted;
    }

    pub fn is_empty(&self) -> bool {
        self.folders_created.is_empty()
            && self.uploaded.is_empty()
            && self.downloaded.is_empty()
            && self.conflicts_deferred.is_empty()
            && self.conflicts_rejected.is_empty()
            && self.removed.is_empty()
            && self.blacklisted.is_empty()
            && self.deleted_remote.is_empty()
            && self.moved.is_empty()
            && self.pruned.is_empty()
            && self.purged.is_empty()
            && self.blacklist_compacted == 0
    }
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `path` as it reads after the moves applied so far in this run.
fn remap(path: &Path, moves: &[(PathBuf, PathBuf)]) -> PathBuf {
    for (from, to) in moves.iter().rev() {
        if let Ok(rest) = path.strip_prefix(from) {
            return if rest.as_os_str().is_empty() {
                to.clone()
            } else {
                to.join(rest)
            };
        }
    }
    path.to_path_buf()
}

type DownloadQueue = TransferQueue<DownloadItem, TransferError>;

pub struct SyncEngine {
    ctx: SyncContext,
    blacklist: Blacklist,
    paths: RemotePathCache,
    dry_run: bool,
    root_folder_id: Option<String>,
}

impl SyncEngine {
    /// Seeds the blacklist from configuration plus the entries persisted by
    /// earlier runs.
    pub async fn new(ctx: SyncContext) -> Result<Self, EngineError> {
        let mut entries = ctx.config.blacklist.clone();
        entries.extend(ctx.store.load_blacklist().await?);
        let blacklist = Blacklist::new(
            ctx.config.sync_dirs.iter().cloned(),
            entries,
            &ctx.config.blacklist_rules,
        )?;
        let paths = RemotePathCache::new(ctx.config.path_cache_size);
        Ok(Self {
            ctx,
            blacklist,
            paths,
            dry_run: false,
            root_folder_id: None,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    fn poller(&self) -> ChangePoller<'_> {
        ChangePoller::new(
            self.ctx.remote.as_ref(),
            &self.ctx.store,
            &self.blacklist,
            &self.paths,
            self.ctx.retry,
        )
    }

    fn transfer_context(&self, root_folder_id: Option<String>) -> Arc<TransferContext> {
        Arc::new(TransferContext {
            store: self.ctx.store.clone(),
            remote: self.ctx.remote.clone(),
            retry: self.ctx.retry,
            root_folder_id,
        })
    }

    fn download_queue(&self) -> DownloadQueue {
        let ctx = self.transfer_context(None);
        TransferQueue::start(
            move |item| transfer::download(ctx.clone(), item),
            self.ctx.config.download_workers,
        )
    }

    /// Configured id, else the stored one, else a newly created folder
    /// under the account root. The result is persisted.
    pub async fn root_folder_id(&mut self) -> Result<String, EngineError> {
        if let Some(id) = &self.root_folder_id {
            return Ok(id.clone());
        }
        let id = match self.ctx.config.remote_root_id.clone() {
            Some(id) => id,
            None => match self.ctx.store.root_folder_id().await? {
                Some(id) => id,
                None => {
                    let name = self.ctx.config.remote_root_name.clone();
                    let remote = &self.ctx.remote;
                    let created = self
                        .ctx
                        .retry
                        .run_remote("create_folder", || {
                            remote.create_folder(&name, ACCOUNT_ROOT_ID)
                        })
                        .await?;
                    let id = created.ok_or(EngineError::RootFolderUnavailable(name))?;
                    info!(remote_id = %id, "created remote root folder");
                    id
                }
            },
        };
        self.ctx.store.set_root_folder_id(&id).await?;
        self.root_folder_id = Some(id.clone());
        Ok(id)
    }

    async fn current_cursor(&self, kind: CursorKind) -> Result<(String, Option<i64>), EngineError> {
        let stored = self.ctx.store.get_cursor(kind).await?;
        if let Some(cursor) = stored.cursor {
            return Ok((cursor, stored.last_sync));
        }
        let remote = &self.ctx.remote;
        let cursor = self
            .ctx
            .retry
            .run_remote("current_cursor", || remote.current_cursor())
            .await?
            .ok_or(EngineError::MissingCursor)?;
        debug!(?kind, cursor = %cursor, "starting from the remote's current cursor");
        Ok((cursor, stored.last_sync))
    }

    /// Crawls every sync root and uploads what changed, folders first and
    /// level by level.
    pub async fn upload_changes(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let started = now_secs();
        let mut folder_levels: BTreeMap<usize, Vec<PathBuf>> = BTreeMap::new();
        let mut files = Vec::new();

        for root in &self.ctx.config.sync_dirs {
            if !tokio::fs::metadata(root)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false)
            {
                warn!(root = %root.display(), "sync root is not a directory, skipping");
                continue;
            }
            let crawler = LocalCrawler::for_root(&self.blacklist, &self.ctx.store, root).await?;
            for candidate in crawler.walk_for_sync(root) {
                match candidate {
                    Ok(candidate) => match candidate.kind {
                        EntryKind::Folder => folder_levels
                            .entry(candidate.depth)
                            .or_default()
                            .push(candidate.path),
                        EntryKind::File => files.push(candidate.path),
                    },
                    Err(err) => warn!(error = %err, "skipping unreadable entry"),
                }
            }
        }

        let folders: Vec<PathBuf> = folder_levels.values().flatten().cloned().collect();
        if self.dry_run {
            report.folders_created = folders;
            report.uploaded = files;
            return Ok(report);
        }
        if folders.is_empty() && files.is_empty() {
            debug!("nothing to upload");
            self.ctx
                .store
                .set_cursor(CursorKind::Upload, None, Some(started))
                .await?;
            return Ok(report);
        }

        let root_id = self.root_folder_id().await?;
        let ctx = self.transfer_context(Some(root_id));
        let mut queue = TransferQueue::start(
            move |item| transfer::upload(ctx.clone(), item),
            self.ctx.config.upload_workers,
        );
        for (depth, level) in &folder_levels {
            debug!(depth, folders = level.len(), "creating folder level");
            for path in level {
                queue.put(UploadItem {
                    path: path.clone(),
                    kind: EntryKind::Folder,
                })?;
            }
            queue.wait(false).await?;
        }
        for path in &files {
            queue.put(UploadItem {
                path: path.clone(),
                kind: EntryKind::File,
            })?;
        }
        queue.wait(true).await?;

        self.ctx
            .store
            .set_cursor(CursorKind::Upload, None, Some(started))
            .await?;
        info!(
            folders = folders.len(),
            files = files.len(),
            "upload sync finished"
        );
        report.folders_created = folders;
        report.uploaded = files;
        Ok(report)
    }

    /// Local path for a polled item: under its parent as planned earlier in
    /// this run or as archived, else where it is archived, else the
    /// download directory.
    async fn plan_destination(
        &self,
        item: &ChangeItem,
        record: Option<&ArchiveRecord>,
        planned: &HashMap<String, PathBuf>,
    ) -> Result<PathBuf, EngineError> {
        if let Some(parent_id) = item.parent_id.as_deref() {
            if let Some(parent) = planned.get(parent_id) {
                return Ok(parent.join(local_name(&item.name)));
            }
            if let Some(parent) = self
                .ctx
                .store
                .find_by_remote_id(parent_id)
                .await?
                .filter(ArchiveRecord::is_folder)
            {
                return Ok(parent.local_path.join(local_name(&item.name)));
            }
        }
        if let Some(record) = record {
            return Ok(record.local_path.clone());
        }
        Ok(resolve_destination(
            &self.ctx.store,
            &item.remote_id,
            &item.name,
            item.parent_id.as_deref(),
            self.ctx.config.download_dir.as_deref(),
        )
        .await?)
    }

    /// Whether an untracked remote file would overwrite something: a path
    /// archived for another remote object, a folder, or a local file with
    /// different content.
    async fn destination_taken(
        &self,
        remote_id: &str,
        remote_hash: Option<&str>,
        destination: &Path,
    ) -> Result<bool, EngineError> {
        if let Some(owner) = self.ctx.store.find_by_path(destination).await? {
            return Ok(owner.remote_id != remote_id);
        }
        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_dir() => Ok(true),
            Ok(_) => {
                let local = file_md5(destination)
                    .await
                    .map_err(io_error(destination))?;
                Ok(!remote_hash.is_some_and(|remote| remote.eq_ignore_ascii_case(&local)))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(destination)(source)),
        }
    }

    /// Target for an untracked remote folder. A path archived for another
    /// object, or a file in the way, gets a numbered sibling instead.
    async fn folder_destination(
        &self,
        remote_id: &str,
        destination: PathBuf,
        reserved: &HashSet<PathBuf>,
    ) -> Result<PathBuf, EngineError> {
        let owned_elsewhere = self
            .ctx
            .store
            .find_by_path(&destination)
            .await?
            .is_some_and(|owner| owner.remote_id != remote_id);
        let file_in_way = tokio::fs::metadata(&destination)
            .await
            .is_ok_and(|meta| !meta.is_dir());
        if !owned_elsewhere && !file_in_way {
            return Ok(destination);
        }
        let renamed = non_colliding_path(&destination, reserved);
        warn!(
            path = %destination.display(),
            renamed = %renamed.display(),
            remote_id = %remote_id,
            "local path belongs to something else, using a new name"
        );
        Ok(renamed)
    }

    /// Moves the local copy of an item renamed or moved remotely and
    /// re-keys its archive subtree. Returns `false`, leaving everything in
    /// place, when the new path is already taken.
    async fn relocate(&self, from: &Path, to: &Path) -> Result<bool, EngineError> {
        if tokio::fs::try_exists(to).await.unwrap_or(true) {
            warn!(
                from = %from.display(),
                to = %to.display(),
                "cannot follow remote move, target already exists"
            );
            return Ok(false);
        }
        if self.dry_run {
            return Ok(true);
        }
        if tokio::fs::try_exists(from).await.unwrap_or(false) {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_error(parent))?;
            }
            tokio::fs::rename(from, to).await.map_err(io_error(from))?;
        }
        let records = self.ctx.store.rename_prefix(from, to).await?;
        info!(from = %from.display(), to = %to.display(), records, "followed remote move");
        Ok(true)
    }

    /// Puts `conflicts` to `prompt` and logs the rejected ones. Returns the
    /// accepted items, destinations possibly renamed.
    async fn settle_conflicts(
        &self,
        prompt: &mut dyn ConflictPrompt,
        conflicts: Vec<DownloadItem>,
        report: &mut SyncReport,
    ) -> Result<Vec<DownloadItem>, EngineError> {
        let resolution = ConflictResolver::new(prompt, self.dry_run).resolve(conflicts);
        for rejected in &resolution.rejected {
            self.ctx
                .store
                .record_conflict(
                    &rejected.remote_id,
                    &rejected.destination,
                    now_secs(),
                    "rejected",
                )
                .await?;
            report.conflicts_rejected.push(rejected.destination.clone());
        }
        report.conflicts_deferred.extend(
            resolution
                .deferred
                .iter()
                .map(|item| item.destination.clone()),
        );
        Ok(resolution.accepted)
    }

    /// Polls the change feed and downloads what changed remotely. Conflicts
    /// go through `prompt`; the cursor only advances once every transfer
    /// has finished, and its sync time is the moment polling began so
    /// edits made during the run are seen by the next one.
    pub async fn download_changes(
        &mut self,
        prompt: &mut dyn ConflictPrompt,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let started = now_secs();
        let (cursor, last_sync) = self.current_cursor(CursorKind::Download).await?;
        let (mut items, new_cursor) = self.poller().poll_changes(&cursor, last_sync).await?;
        items.sort_by_key(ChangeItem::depth);

        let mut queue = (!self.dry_run).then(|| self.download_queue());
        let mut planned: HashMap<String, PathBuf> = HashMap::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut moves: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut folder_levels: BTreeMap<usize, Vec<DownloadItem>> = BTreeMap::new();
        let mut files = Vec::new();
        let mut conflicts = Vec::new();

        for item in &items {
            let record = self.ctx.store.find_by_remote_id(&item.remote_id).await?;
            let mut destination = self
                .plan_destination(item, record.as_ref(), &planned)
                .await?;
            if self.blacklist.is_excluded_within_roots(&destination) {
                debug!(path = %destination.display(), "destination is excluded");
                continue;
            }

            if let Some(record) = &record {
                let current = remap(&record.local_path, &moves);
                if path_key(&current) != path_key(&destination) {
                    if self.relocate(&current, &destination).await? {
                        report.moved.push(destination.clone());
                        moves.push((current, destination.clone()));
                    } else {
                        destination = current;
                    }
                }
            }
            if item.decision == SyncDecision::None {
                continue;
            }

            let mut collides = false;
            if record.is_none() {
                if item.is_folder() {
                    destination = self
                        .folder_destination(&item.remote_id, destination, &claimed)
                        .await?;
                } else {
                    collides = claimed.contains(Path::new(&path_key(&destination)))
                        || self
                            .destination_taken(
                                &item.remote_id,
                                item.content_hash.as_deref(),
                                &destination,
                            )
                            .await?;
                }
            }
            claimed.insert(PathBuf::from(path_key(&destination)));

            let download = DownloadItem {
                remote_id: item.remote_id.clone(),
                kind: item.kind,
                md5: item.content_hash.clone(),
                destination: destination.clone(),
            };
            match (item.kind, item.decision) {
                (RemoteKind::Folder, _) => {
                    planned.insert(item.remote_id.clone(), destination);
                    folder_levels.entry(item.depth()).or_default().push(download);
                }
                (RemoteKind::File, SyncDecision::Conflict) => conflicts.push(download),
                (RemoteKind::File, _) if collides => {
                    debug!(
                        path = %destination.display(),
                        remote_id = %item.remote_id,
                        "untracked remote file collides with a local path"
                    );
                    conflicts.push(download);
                }
                (RemoteKind::File, _) => files.push(download),
            }
        }

        for level in folder_levels.into_values() {
            for folder in level {
                if !folder.destination.exists() && !report.moved.contains(&folder.destination) {
                    report.folders_created.push(folder.destination.clone());
                }
                if let Some(queue) = &queue {
                    queue.put(folder)?;
                }
            }
            if let Some(queue) = queue.as_mut() {
                queue.wait(false).await?;
            }
        }

        let accepted = self
            .settle_conflicts(prompt, conflicts, &mut report)
            .await?;
        for file in files.into_iter().chain(accepted) {
            report.downloaded.push(file.destination.clone());
            if let Some(queue) = &queue {
                queue.put(file)?;
            }
        }

        let Some(mut queue) = queue else {
            return Ok(report);
        };
        queue.wait(true).await?;
        self.ctx
            .store
            .set_cursor(CursorKind::Download, Some(&new_cursor), Some(started))
            .await?;
        info!(
            downloaded = report.downloaded.len(),
            moved = report.moved.len(),
            rejected = report.conflicts_rejected.len(),
            "download sync finished"
        );
        Ok(report)
    }

    /// Blacklists and forgets every archived path the remote reports as
    /// removed or trashed, including whole subtrees for folders.
    pub async fn apply_remote_removals(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let (cursor, _) = self.current_cursor(CursorKind::Removed).await?;
        let (ids, new_cursor) = self.poller().poll_removed(&cursor).await?;

        for id in ids {
            let Some(record) = self.ctx.store.find_by_remote_id(&id).await? else {
                continue;
            };
            let path = record.local_path;
            report.removed.push(path.clone());
            if self.dry_run {
                continue;
            }
            if self.blacklist.add_to_blacklist(&path) {
                self.ctx.store.add_blacklist_entry(&path).await?;
                report.blacklisted.push(path.clone());
            }
            let forgotten = self.ctx.store.delete_subtree(&path).await?;
            info!(path = %path.display(), remote_id = %id, records = forgotten, "removed remotely");
        }

        if !self.dry_run {
            self.ctx
                .store
                .set_cursor(CursorKind::Removed, Some(&new_cursor), Some(now_secs()))
                .await?;
        }
        Ok(report)
    }

    /// Deletes the remote copy of archived paths that are gone locally.
    /// Records under a missing sync root are left alone.
    pub async fn delete_removed_locally(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let mut live_roots = Vec::new();
        for root in &self.ctx.config.sync_dirs {
            if tokio::fs::try_exists(root).await.unwrap_or(false) {
                live_roots.push(root.clone());
            } else {
                warn!(root = %root.display(), "sync root is missing, not deleting anything under it");
            }
        }

        let mut deleted: Vec<PathBuf> = Vec::new();
        for record in self.ctx.store.list_all().await? {
            let path = &record.local_path;
            if !live_roots.iter().any(|root| is_within(path, root))
                || deleted.iter().any(|prefix| is_within(path, prefix))
                || tokio::fs::try_exists(path).await.unwrap_or(true)
            {
                continue;
            }
            deleted.push(path.clone());
            report.deleted_remote.push(path.clone());
            if self.dry_run {
                continue;
            }

            let remote = &self.ctx.remote;
            self.ctx
                .retry
                .run_remote("delete", || remote.delete(&record.remote_id))
                .await?;
            self.ctx.store.delete_subtree(path).await?;
            info!(path = %path.display(), remote_id = %record.remote_id, "deleted remotely");
        }
        Ok(report)
    }

    pub async fn compact_blacklist(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        if self.dry_run {
            let mut preview = self.blacklist.clone();
            report.blacklist_compacted = preview.compact();
            return Ok(report);
        }
        report.blacklist_compacted = self.blacklist.compact();
        let entries: Vec<PathBuf> = self.blacklist.entries().map(Path::to_path_buf).collect();
        self.ctx.store.replace_blacklist(&entries).await?;
        info!(
            removed = report.blacklist_compacted,
            remaining = entries.len(),
            "blacklist compacted"
        );
        Ok(report)
    }

    /// Forgets archived paths whose remote object is gone or trashed, as
    /// long as the local copy is gone too or excluded. Nothing is deleted on
    /// either side.
    pub async fn prune_archive(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let remote = &self.ctx.remote;
        for record in self.ctx.store.list_all().await? {
            let path = &record.local_path;
            if report.pruned.iter().any(|prefix| is_within(path, prefix)) {
                continue;
            }
            let item = self
                .ctx
                .retry
                .run_remote("metadata", || remote.metadata(&record.remote_id))
                .await?;
            if item.is_some_and(|item| !item.trashed) {
                continue;
            }
            let local_gone = !tokio::fs::try_exists(path).await.unwrap_or(true);
            if !local_gone && !self.blacklist.is_excluded_within_roots(path) {
                debug!(
                    path = %path.display(),
                    remote_id = %record.remote_id,
                    "remote copy is gone but the local one is still synced"
                );
                continue;
            }
            report.pruned.push(path.clone());
            if self.dry_run {
                continue;
            }
            let forgotten = self.ctx.store.delete_subtree(path).await?;
            info!(path = %path.display(), remote_id = %record.remote_id, records = forgotten, "pruned from archive");
        }
        Ok(report)
    }

    /// Deletes the remote copy of every archived path that is now excluded,
    /// then forgets it.
    pub async fn purge_blacklisted(&mut self) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let remote = &self.ctx.remote;
        for record in self.ctx.store.list_all().await? {
            let path = &record.local_path;
            if report.purged.iter().any(|prefix| is_within(path, prefix))
                || !self.blacklist.is_excluded_within_roots(path)
            {
                continue;
            }
            report.purged.push(path.clone());
            if self.dry_run {
                continue;
            }
            self.ctx
                .retry
                .run_remote("delete", || remote.delete(&record.remote_id))
                .await?;
            let forgotten = self.ctx.store.delete_subtree(path).await?;
            info!(path = %path.display(), remote_id = %record.remote_id, records = forgotten, "excluded path purged");
        }
        Ok(report)
    }

    /// Pulls a whole remote folder tree into `destination`, one level at a
    /// time.
    pub async fn download_folder(
        &mut self,
        remote_id: &str,
        destination: &Path,
        prompt: &mut dyn ConflictPrompt,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::new(self.dry_run);
        let remote = &self.ctx.remote;
        self.ctx
            .retry
            .run_remote("metadata", || remote.metadata(remote_id))
            .await?
            .filter(|item| item.is_folder())
            .ok_or_else(|| EngineError::MissingRemoteFolder(remote_id.to_string()))?;

        let mut queue = (!self.dry_run).then(|| self.download_queue());
        let reconciler = Reconciler::new(&self.blacklist);
        let mut conflicts = Vec::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut level = vec![(remote_id.to_string(), destination.to_path_buf())];

        if !destination.exists() {
            report.folders_created.push(destination.to_path_buf());
        }
        if let Some(queue) = queue.as_mut() {
            queue.put(DownloadItem {
                remote_id: remote_id.to_string(),
                kind: RemoteKind::Folder,
                md5: None,
                destination: destination.to_path_buf(),
            })?;
            queue.wait(false).await?;
        }

        while !level.is_empty() {
            let mut next = Vec::new();
            for (folder_id, folder_path) in level {
                let children = self
                    .ctx
                    .retry
                    .run_remote("list_children", || remote.list_children(&folder_id))
                    .await?
                    .unwrap_or_default();
                for child in children {
                    let mut target = folder_path.join(local_name(&child.name));
                    if self.blacklist.is_excluded_within_roots(&target) {
                        continue;
                    }
                    let record = self.ctx.store.find_by_remote_id(&child.id).await?;
                    let mut collides = false;
                    match child.kind {
                        RemoteKind::Folder => {
                            if record.is_none() {
                                target = self.folder_destination(&child.id, target, &claimed).await?;
                            }
                            if !target.exists() {
                                report.folders_created.push(target.clone());
                            }
                            next.push((child.id.clone(), target.clone()));
                        }
                        RemoteKind::File => {
                            let Some(hash) = child.md5.as_deref() else {
                                debug!(name = %child.name, "remote file has no content hash, skipping");
                                continue;
                            };
                            let modified = child.modified.map(datetime_ns);
                            match reconciler.decide_for(record.as_ref(), hash, modified).await? {
                                SyncDecision::None => continue,
                                SyncDecision::Conflict => collides = true,
                                SyncDecision::Safe if record.is_none() => {
                                    collides = claimed.contains(Path::new(&path_key(&target)))
                                        || self.destination_taken(&child.id, Some(hash), &target).await?;
                                }
                                SyncDecision::Safe => {}
                            }
                        }
                    }
                    claimed.insert(PathBuf::from(path_key(&target)));
                    let item = DownloadItem {
                        remote_id: child.id.clone(),
                        kind: child.kind,
                        md5: child.md5.clone(),
                        destination: target.clone(),
                    };
                    if collides {
                        conflicts.push(item);
                        continue;
                    }
                    if child.kind == RemoteKind::File {
                        report.downloaded.push(target);
                    }
                    if let Some(queue) = &queue {
                        queue.put(item)?;
                    }
                }
            }
            if let Some(queue) = queue.as_mut() {
                queue.wait(false).await?;
            }
            level = next;
        }

        let accepted = self
            .settle_conflicts(prompt, conflicts, &mut report)
            .await?;
        for accepted in accepted {
            report.downloaded.push(accepted.destination.clone());
            if let Some(queue) = &queue {
                queue.put(accepted)?;
            }
        }
        if let Some(mut queue) = queue {
            queue.wait(true).await?;
        }
        Ok(report)
    }

    /// Remote removals, then uploads, then downloads.
    pub async fn sync_all(
        &mut self,
        prompt: &mut dyn ConflictPrompt,
    ) -> Result<SyncReport, EngineError> {
        let mut report = self.apply_remote_removals().await?;
        report.merge(self.upload_changes().await?);
        report.merge(self.download_changes(prompt).await?);
        Ok(report)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
