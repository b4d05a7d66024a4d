use std::fs;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::paths::path_key;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Content hash stored for folders, which have no content of their own.
pub const FOLDER_HASH: &str = "";

const ROOT_FOLDER_KEY: &str = "root_folder_id";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub local_path: PathBuf,
    pub remote_id: String,
    pub modified_ns: i64,
    pub content_hash: String,
}

impl ArchiveRecord {
    pub fn folder(local_path: PathBuf, remote_id: String, modified_ns: i64) -> Self {
        Self {
            local_path,
            remote_id,
            modified_ns,
            content_hash: FOLDER_HASH.to_string(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.content_hash == FOLDER_HASH
    }

    fn from_row(row: &SqliteRow) -> Result<Self, ArchiveError> {
        let local_path: String = row.try_get("local_path")?;
        Ok(Self {
            local_path: PathBuf::from(local_path),
            remote_id: row.try_get("remote_id")?,
            modified_ns: row.try_get("modified_ns")?,
            content_hash: row.try_get("content_hash")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Removed,
    Download,
    Upload,
}

impl CursorKind {
    fn as_str(&self) -> &'static str {
        match self {
            CursorKind::Removed => "removed",
            CursorKind::Download => "download",
            CursorKind::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub cursor: Option<String>,
    pub last_sync: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub remote_id: String,
    pub local_path: PathBuf,
    pub created: i64,
    pub reason: String,
}

pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub async fn open(db_path: &Path) -> Result<Self, ArchiveError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, ArchiveError> {
        Self::open(&default_db_path()?).await
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty schema.
    pub async fn in_memory() -> Result<Self, ArchiveError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), ArchiveError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn find_by_path(&self, path: &Path) -> Result<Option<ArchiveRecord>, ArchiveError> {
        let row = sqlx::query(
            "SELECT local_path, remote_id, modified_ns, content_hash FROM archive WHERE local_path = ?1",
        )
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ArchiveRecord::from_row).transpose()
    }

    pub async fn find_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<ArchiveRecord>, ArchiveError> {
        let row = sqlx::query(
            "SELECT local_path, remote_id, modified_ns, content_hash FROM archive WHERE remote_id = ?1",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ArchiveRecord::from_row).transpose()
    }

    /// Inserts or updates the record for `record.local_path`.
    ///
    /// A row that already holds `record.remote_id` under another path is
    /// replaced, so both keys stay unique.
    pub async fn upsert(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let local_path = path_key(&record.local_path);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM archive WHERE remote_id = ?1 AND local_path <> ?2")
            .bind(&record.remote_id)
            .bind(&local_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO archive (local_path, remote_id, modified_ns, content_hash)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(local_path) DO UPDATE SET
                remote_id = excluded.remote_id,
                modified_ns = excluded.modified_ns,
                content_hash = excluded.content_hash;
            "#,
        )
        .bind(&local_path)
        .bind(&record.remote_id)
        .bind(record.modified_ns)
        .bind(&record.content_hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records for `prefix` itself and everything below it, in path order.
    pub async fn list_subtree(&self, prefix: &Path) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let (exact, below) = subtree_keys(prefix);
        let rows = sqlx::query(
            "SELECT local_path, remote_id, modified_ns, content_hash
             FROM archive
             WHERE local_path = ?1 OR substr(local_path, 1, length(?2)) = ?2
             ORDER BY local_path ASC",
        )
        .bind(exact)
        .bind(below)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ArchiveRecord::from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let rows = sqlx::query(
            "SELECT local_path, remote_id, modified_ns, content_hash FROM archive ORDER BY local_path ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ArchiveRecord::from_row).collect()
    }

    pub async fn delete_subtree(&self, prefix: &Path) -> Result<u64, ArchiveError> {
        let (exact, below) = subtree_keys(prefix);
        let result = sqlx::query(
            "DELETE FROM archive WHERE local_path = ?1 OR substr(local_path, 1, length(?2)) = ?2",
        )
        .bind(exact)
        .bind(below)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Moves every record at or below `from` so it sits at or below `to`.
    pub async fn rename_prefix(&self, from: &Path, to: &Path) -> Result<u64, ArchiveError> {
        let (exact, below) = subtree_keys(from);
        let result = sqlx::query(
            "UPDATE archive
             SET local_path = ?3 || substr(local_path, length(?1) + 1)
             WHERE local_path = ?1 OR substr(local_path, 1, length(?2)) = ?2",
        )
        .bind(exact)
        .bind(below)
        .bind(path_key(to))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_cursor(
        &self,
        kind: CursorKind,
        cursor: Option<&str>,
        last_sync: Option<i64>,
    ) -> Result<(), ArchiveError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (name, cursor, last_sync)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                cursor = excluded.cursor,
                last_sync = excluded.last_sync;
            "#,
        )
        .bind(kind.as_str())
        .bind(cursor)
        .bind(last_sync)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cursor(&self, kind: CursorKind) -> Result<SyncCursor, ArchiveError> {
        let row = sqlx::query("SELECT cursor, last_sync FROM sync_cursors WHERE name = ?1")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(SyncCursor::default());
        };

        Ok(SyncCursor {
            cursor: row.try_get("cursor")?,
            last_sync: row.try_get("last_sync")?,
        })
    }

    pub async fn root_folder_id(&self) -> Result<Option<String>, ArchiveError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(ROOT_FOLDER_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<String, _>("value"))
            .transpose()?)
    }

    pub async fn set_root_folder_id(&self, id: &str) -> Result<(), ArchiveError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(ROOT_FOLDER_KEY)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_blacklist(&self) -> Result<Vec<PathBuf>, ArchiveError> {
        let rows = sqlx::query("SELECT path FROM blacklist ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            out.push(PathBuf::from(path));
        }
        Ok(out)
    }

    pub async fn add_blacklist_entry(&self, path: &Path) -> Result<(), ArchiveError> {
        sqlx::query("INSERT INTO blacklist (path) VALUES (?1) ON CONFLICT(path) DO NOTHING")
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn replace_blacklist(&self, paths: &[PathBuf]) -> Result<(), ArchiveError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blacklist").execute(&mut *tx).await?;
        for path in paths {
            sqlx::query("INSERT INTO blacklist (path) VALUES (?1) ON CONFLICT(path) DO NOTHING")
                .bind(path_key(path))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_conflict(
        &self,
        remote_id: &str,
        local_path: &Path,
        created: i64,
        reason: &str,
    ) -> Result<i64, ArchiveError> {
        let result = sqlx::query(
            "INSERT INTO conflicts (remote_id, local_path, created, reason) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(remote_id)
        .bind(path_key(local_path))
        .bind(created)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, ArchiveError> {
        let rows = sqlx::query(
            "SELECT id, remote_id, local_path, created, reason FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let local_path: String = row.try_get("local_path")?;
            out.push(ConflictRecord {
                id: row.try_get("id")?,
                remote_id: row.try_get("remote_id")?,
                local_path: PathBuf::from(local_path),
                created: row.try_get("created")?,
                reason: row.try_get("reason")?,
            });
        }
        Ok(out)
    }
}

/// Exact key plus the `key/` prefix that selects descendants.
fn subtree_keys(prefix: &Path) -> (String, String) {
    let exact = path_key(prefix);
    let below = if exact.ends_with(MAIN_SEPARATOR) {
        exact.clone()
    } else {
        format!("{exact}{MAIN_SEPARATOR}")
    };
    (exact, below)
}

fn default_db_path() -> Result<PathBuf, ArchiveError> {
    let mut path = dirs::data_dir().ok_or(ArchiveError::MissingDataDir)?;
    path.push("drivesync");
    path.push("archive.db");
    Ok(path)
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod tests;
