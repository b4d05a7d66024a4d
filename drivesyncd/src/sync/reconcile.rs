use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::archive::ArchiveRecord;
use super::blacklist::Blacklist;
use super::paths::file_md5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDecision {
    None,
    Safe,
    Conflict,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to hash {path:?}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn same_hash(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Three-way diff of content hashes. `local` is `None` when the file is
/// gone from disk.
pub fn three_way(remote: &str, archived: &str, local: Option<&str>) -> SyncDecision {
    if same_hash(remote, archived) {
        return SyncDecision::None;
    }
    let Some(local) = local else {
        return SyncDecision::Conflict;
    };
    if same_hash(remote, local) {
        SyncDecision::None
    } else if same_hash(local, archived) {
        SyncDecision::Safe
    } else {
        SyncDecision::Conflict
    }
}

/// Download-direction drift check against an archived record and the
/// local disk.
pub struct Reconciler<'a> {
    blacklist: &'a Blacklist,
}

impl<'a> Reconciler<'a> {
    pub fn new(blacklist: &'a Blacklist) -> Self {
        Self { blacklist }
    }

    /// `record` is the archive entry for the remote object, if any.
    pub async fn decide_for(
        &self,
        record: Option<&ArchiveRecord>,
        remote_hash: &str,
        remote_modified_ns: Option<i64>,
    ) -> Result<SyncDecision, ReconcileError> {
        let Some(record) = record else {
            return Ok(SyncDecision::Safe);
        };
        if self.blacklist.is_excluded_within_roots(&record.local_path) {
            return Ok(SyncDecision::None);
        }
        if same_hash(remote_hash, &record.content_hash) {
            return Ok(SyncDecision::None);
        }
        if record.is_folder() {
            debug!(path = %record.local_path.display(), "archived folder now holds a remote file");
            return Ok(SyncDecision::Conflict);
        }

        let local_hash = match file_md5(&record.local_path).await {
            Ok(hash) => Some(hash),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ReconcileError::Hash {
                    path: record.local_path.clone(),
                    source,
                });
            }
        };

        if local_hash.is_none()
            && remote_modified_ns.is_some_and(|remote| remote < record.modified_ns)
        {
            debug!(
                path = %record.local_path.display(),
                remote_id = %record.remote_id,
                "stale change for a locally missing file"
            );
            return Ok(SyncDecision::None);
        }

        Ok(three_way(
            remote_hash,
            &record.content_hash,
            local_hash.as_deref(),
        ))
    }
}
