use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::paths::canonical_path;
use crate::sync::retry::{Backoff, RetryPolicy};

const DEFAULT_BLACKLIST_RULES: &str = ".git;*.partial;*.tmp;__pycache__";
const DEFAULT_UPLOAD_WORKERS: u64 = 5;
const DEFAULT_DOWNLOAD_WORKERS: u64 = 8;
const DEFAULT_REMOTE_ROOT_NAME: &str = "drivesync";
const DEFAULT_RETRY_ATTEMPTS: u64 = 6;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_MS: u64 = 64_000;
const DEFAULT_PATH_CACHE_SIZE: u64 = 4_096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub sync_dirs: Vec<PathBuf>,
    pub blacklist: Vec<PathBuf>,
    pub blacklist_rules: Vec<String>,
    pub download_dir: Option<PathBuf>,
    /// `None` selects the per-user data directory.
    pub db_path: Option<PathBuf>,
    pub upload_workers: usize,
    pub download_workers: usize,
    pub remote_root_name: String,
    pub remote_root_id: Option<String>,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub path_cache_size: usize,
    pub api_url: Option<String>,
}

impl SyncConfig {
    /// Defaults for the given roots, as `from_env` would produce them.
    pub fn for_roots(sync_dirs: Vec<PathBuf>) -> Self {
        Self {
            sync_dirs,
            blacklist: Vec::new(),
            blacklist_rules: split_list(DEFAULT_BLACKLIST_RULES),
            download_dir: None,
            db_path: None,
            upload_workers: DEFAULT_UPLOAD_WORKERS as usize,
            download_workers: DEFAULT_DOWNLOAD_WORKERS as usize,
            remote_root_name: DEFAULT_REMOTE_ROOT_NAME.to_string(),
            remote_root_id: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS as u32,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            path_cache_size: DEFAULT_PATH_CACHE_SIZE as usize,
            api_url: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home, dirs::download_dir())
    }

    pub fn from_lookup<F>(
        lookup: F,
        home: &Path,
        default_download_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths = |name: &str| -> anyhow::Result<Vec<PathBuf>> {
            lookup(name)
                .map(|value| split_list(&value))
                .unwrap_or_default()
                .iter()
                .map(|value| {
                    canonical_path(&expand_with_home(value, home))
                        .with_context(|| format!("invalid path {value:?} in {name}"))
                })
                .collect()
        };

        let sync_dirs = paths("DRIVESYNC_SYNC_DIRS")?;
        anyhow::ensure!(
            !sync_dirs.is_empty(),
            "DRIVESYNC_SYNC_DIRS must name at least one directory"
        );
        let blacklist = paths("DRIVESYNC_BLACKLIST")?;
        let blacklist_rules = split_list(
            &lookup("DRIVESYNC_BLACKLIST_RULES").unwrap_or_else(|| DEFAULT_BLACKLIST_RULES.into()),
        );
        let download_dir = match lookup("DRIVESYNC_DOWNLOAD_DIR") {
            Some(value) if !value.trim().is_empty() => Some(
                canonical_path(&expand_with_home(value.trim(), home))
                    .context("invalid DRIVESYNC_DOWNLOAD_DIR")?,
            ),
            _ => default_download_dir,
        };
        let db_path = lookup("DRIVESYNC_DB_PATH")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(value.trim(), home));

        let number = |name: &str, default: u64| read_u64(&lookup, name, default);
        Ok(Self {
            sync_dirs,
            blacklist,
            blacklist_rules,
            download_dir,
            db_path,
            upload_workers: number("DRIVESYNC_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS) as usize,
            download_workers: number("DRIVESYNC_DOWNLOAD_WORKERS", DEFAULT_DOWNLOAD_WORKERS)
                as usize,
            remote_root_name: lookup("DRIVESYNC_REMOTE_ROOT_NAME")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REMOTE_ROOT_NAME.to_string()),
            remote_root_id: lookup("DRIVESYNC_REMOTE_ROOT_ID").filter(|value| !value.trim().is_empty()),
            retry_attempts: u32::try_from(number("DRIVESYNC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS))
                .unwrap_or(u32::MAX),
            retry_base: Duration::from_millis(number("DRIVESYNC_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)),
            retry_max: Duration::from_millis(number("DRIVESYNC_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)),
            path_cache_size: number("DRIVESYNC_PATH_CACHE_SIZE", DEFAULT_PATH_CACHE_SIZE) as usize,
            api_url: lookup("DRIVESYNC_API_URL").filter(|value| !value.trim().is_empty()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Backoff::new(self.retry_base, self.retry_max, false),
        )
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<SyncConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        SyncConfig::from_lookup(
            |name| vars.get(name).cloned(),
            Path::new("/home/alice"),
            Some(PathBuf::from("/home/alice/Downloads")),
        )
    }

    #[test]
    fn defaults_apply_when_only_roots_are_set() {
        let config = config_from(&[("DRIVESYNC_SYNC_DIRS", "~/Documents; /data/photos ;")]).unwrap();

        assert_eq!(
            config.sync_dirs,
            vec![
                PathBuf::from("/home/alice/Documents"),
                PathBuf::from("/data/photos")
            ]
        );
        assert_eq!(config.upload_workers, 5);
        assert_eq!(config.download_workers, 8);
        assert_eq!(config.retry_attempts, 6);
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.retry_max, Duration::from_secs(64));
        assert_eq!(config.path_cache_size, 4096);
        assert_eq!(config.remote_root_name, "drivesync");
        assert_eq!(config.remote_root_id, None);
        assert_eq!(
            config.blacklist_rules,
            vec![".git", "*.partial", "*.tmp", "__pycache__"]
        );
        assert_eq!(
            config.download_dir,
            Some(PathBuf::from("/home/alice/Downloads"))
        );
        assert_eq!(config, {
            let mut expected = SyncConfig::for_roots(config.sync_dirs.clone());
            expected.download_dir = config.download_dir.clone();
            expected
        });
    }

    #[test]
    fn missing_roots_are_rejected() {
        assert!(config_from(&[]).is_err());
        assert!(config_from(&[("DRIVESYNC_SYNC_DIRS", " ; ")]).is_err());
    }

    #[test]
    fn invalid_or_zero_numbers_fall_back_to_defaults() {
        let config = config_from(&[
            ("DRIVESYNC_SYNC_DIRS", "/sync"),
            ("DRIVESYNC_UPLOAD_WORKERS", "0"),
            ("DRIVESYNC_DOWNLOAD_WORKERS", "lots"),
            ("DRIVESYNC_RETRY_ATTEMPTS", "3"),
        ])
        .unwrap();
        assert_eq!(config.upload_workers, 5);
        assert_eq!(config.download_workers, 8);
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn overrides_are_read_and_expanded() {
        let config = config_from(&[
            ("DRIVESYNC_SYNC_DIRS", "/sync"),
            ("DRIVESYNC_BLACKLIST", "/sync/private;~/sync/tmp/../cache"),
            ("DRIVESYNC_BLACKLIST_RULES", "*.bak"),
            ("DRIVESYNC_DOWNLOAD_DIR", "~/Inbox"),
            ("DRIVESYNC_DB_PATH", "~/.local/state/archive.db"),
            ("DRIVESYNC_REMOTE_ROOT_ID", "abc123"),
            ("DRIVESYNC_API_URL", "http://127.0.0.1:9000"),
        ])
        .unwrap();

        assert_eq!(
            config.blacklist,
            vec![
                PathBuf::from("/sync/private"),
                PathBuf::from("/home/alice/sync/cache")
            ]
        );
        assert_eq!(config.blacklist_rules, vec!["*.bak"]);
        assert_eq!(config.download_dir, Some(PathBuf::from("/home/alice/Inbox")));
        assert_eq!(
            config.db_path,
            Some(PathBuf::from("/home/alice/.local/state/archive.db"))
        );
        assert_eq!(config.remote_root_id.as_deref(), Some("abc123"));
        assert_eq!(config.api_url.as_deref(), Some("http://127.0.0.1:9000"));
    }

    #[test]
    fn expand_with_home_handles_tilde_forms() {
        let home = Path::new("/home/alice");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/alice"));
        assert_eq!(expand_with_home("~/x", home), PathBuf::from("/home/alice/x"));
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
    }
}
