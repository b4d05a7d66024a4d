use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use drivesync_core::{DriveClient, RemoteStore};
use tracing::info;

use crate::config::SyncConfig;
use crate::sync::archive::{ArchiveStore, ConflictRecord};
use crate::sync::conflict::ConflictPrompt;
use crate::sync::engine::{SyncContext, SyncEngine, SyncReport};

const TOKEN_VAR: &str = "DRIVESYNC_TOKEN";

/// One engine operation, as selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Sync,
    Upload,
    Download,
    Removed,
    DeleteRemoved,
    CompactBlacklist,
    PruneArchive,
    PurgeBlacklisted,
    Pull {
        remote_id: String,
        destination: PathBuf,
    },
}

pub struct DaemonRuntime {
    engine: SyncEngine,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: SyncConfig, dry_run: bool) -> anyhow::Result<Self> {
        let token = resolve_token(|name| std::env::var(name).ok())?;
        let client = match config.api_url.as_deref() {
            Some(url) => DriveClient::with_base_url(url, token),
            None => DriveClient::new(token),
        }
        .context("failed to build REST client")?;

        let store = match config.db_path.as_deref() {
            Some(path) => ArchiveStore::open(path).await,
            None => ArchiveStore::new_default().await,
        }
        .context("failed to open archive database")?;

        Self::from_parts(config, Arc::new(store), Arc::new(client), dry_run).await
    }

    pub async fn from_parts(
        config: SyncConfig,
        store: Arc<ArchiveStore>,
        remote: Arc<dyn RemoteStore>,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let roots = config.sync_dirs.len();
        let ctx = SyncContext::new(config, store, remote);
        let engine = SyncEngine::new(ctx)
            .await
            .context("failed to initialize sync engine")?
            .with_dry_run(dry_run);
        info!(roots, dry_run, "sync runtime ready");
        Ok(Self { engine })
    }

    pub async fn run(
        &mut self,
        operation: Operation,
        prompt: &mut dyn ConflictPrompt,
    ) -> anyhow::Result<SyncReport> {
        let engine = &mut self.engine;
        let report = match &operation {
            Operation::Sync => engine.sync_all(prompt).await,
            Operation::Upload => engine.upload_changes().await,
            Operation::Download => engine.download_changes(prompt).await,
            Operation::Removed => engine.apply_remote_removals().await,
            Operation::DeleteRemoved => engine.delete_removed_locally().await,
            Operation::CompactBlacklist => engine.compact_blacklist().await,
            Operation::PruneArchive => engine.prune_archive().await,
            Operation::PurgeBlacklisted => engine.purge_blacklisted().await,
            Operation::Pull {
                remote_id,
                destination,
            } => {
                engine
                    .download_folder(remote_id, destination, prompt)
                    .await
            }
        }
        .with_context(|| format!("{operation:?} failed"))?;
        Ok(report)
    }

    pub async fn conflicts(&self) -> anyhow::Result<Vec<ConflictRecord>> {
        self.engine
            .context()
            .store
            .list_conflicts()
            .await
            .context("failed to read conflict log")
    }

    pub async fn shutdown(self) {
        self.engine.context().close().await;
    }
}

fn resolve_token<F>(lookup: F) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(TOKEN_VAR)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{TOKEN_VAR} is not set"))
}
