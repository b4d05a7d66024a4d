use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::archive::{ArchiveError, ArchiveRecord, ArchiveStore};
use super::blacklist::Blacklist;
use super::paths::{modified_ns, path_key};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to read modification time of {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Depth below the crawled root; the root itself is 0.
    pub depth: usize,
}

/// Local tree walker that yields what still has to be uploaded.
pub struct LocalCrawler<'a> {
    blacklist: &'a Blacklist,
    archived: HashMap<String, ArchiveRecord>,
}

impl<'a> LocalCrawler<'a> {
    pub fn new<I>(blacklist: &'a Blacklist, archived: I) -> Self
    where
        I: IntoIterator<Item = ArchiveRecord>,
    {
        Self {
            blacklist,
            archived: archived
                .into_iter()
                .map(|record| (path_key(&record.local_path), record))
                .collect(),
        }
    }

    /// Crawler primed with every archived record under `root`.
    pub async fn for_root(
        blacklist: &'a Blacklist,
        store: &ArchiveStore,
        root: &Path,
    ) -> Result<Self, ArchiveError> {
        Ok(Self::new(blacklist, store.list_subtree(root).await?))
    }

    pub fn needs_upload(&self, path: &Path, kind: EntryKind, modified_ns: i64) -> bool {
        match (self.archived.get(&path_key(path)), kind) {
            (None, _) => true,
            (Some(_), EntryKind::Folder) => false,
            (Some(record), EntryKind::File) => modified_ns > record.modified_ns,
        }
    }

    /// Depth-first walk of `root`. Excluded directories are pruned before
    /// their children are read; symlinks are not followed.
    pub fn walk_for_sync(&self, root: &Path) -> WalkForSync<'_, 'a> {
        if self.blacklist.is_excluded(root) || self.blacklist.is_excluded_within_roots(root) {
            debug!(root = %root.display(), "sync root is excluded, nothing to crawl");
            return WalkForSync {
                crawler: self,
                entries: Box::new(std::iter::empty::<walkdir::Result<DirEntry>>()),
            };
        }

        let blacklist = self.blacklist;
        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| entry.depth() == 0 || !blacklist.is_excluded(entry.path()));
        WalkForSync {
            crawler: self,
            entries: Box::new(entries),
        }
    }

    fn candidate(&self, entry: &DirEntry) -> Result<Option<Candidate>, CrawlError> {
        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Folder
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            return Ok(None);
        };
        let metadata = entry.metadata().map_err(|source| CrawlError::Walk {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let modified = modified_ns(&metadata).map_err(|source| CrawlError::Metadata {
            path: entry.path().to_path_buf(),
            source,
        })?;
        if !self.needs_upload(entry.path(), kind, modified) {
            return Ok(None);
        }
        Ok(Some(Candidate {
            path: entry.path().to_path_buf(),
            kind,
            depth: entry.depth(),
        }))
    }
}

pub struct WalkForSync<'c, 'a> {
    crawler: &'c LocalCrawler<'a>,
    entries: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + 'c>,
}

impl Iterator for WalkForSync<'_, '_> {
    type Item = Result<Candidate, CrawlError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(source) => {
                    let path = source
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    return Some(Err(CrawlError::Walk { path, source }));
                }
            };
            match self.crawler.candidate(&entry) {
                Ok(Some(candidate)) => return Some(Ok(candidate)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
