use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("invalid blacklist rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// Paths and basename rules excluded from sync.
///
/// A listed directory excludes its whole subtree up to the nearest sync
/// root; descendants are never stored individually.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    paths: BTreeSet<PathBuf>,
    rules: Vec<Pattern>,
    roots: HashSet<PathBuf>,
}

impl Blacklist {
    pub fn new<R, P>(roots: R, paths: P, rules: &[String]) -> Result<Self, BlacklistError>
    where
        R: IntoIterator<Item = PathBuf>,
        P: IntoIterator<Item = PathBuf>,
    {
        let rules = rules
            .iter()
            .filter(|rule| !rule.trim().is_empty())
            .map(|rule| {
                Pattern::new(rule.trim()).map_err(|err| BlacklistError::InvalidRule {
                    rule: rule.clone(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            paths: paths.into_iter().collect(),
            rules,
            roots: roots.into_iter().collect(),
        })
    }

    pub fn roots(&self) -> &HashSet<PathBuf> {
        &self.roots
    }

    pub fn entries(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.paths.contains(path) {
            return true;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        self.rules
            .iter()
            .any(|rule| rule.matches_with(name, match_options()))
    }

    /// Walks from `path` toward the filesystem root, answering `false` as
    /// soon as a member of `stop_set` is reached.
    pub fn is_excluded_considering_ancestors(
        &self,
        path: &Path,
        stop_set: &HashSet<PathBuf>,
    ) -> bool {
        for candidate in path.ancestors() {
            if stop_set.contains(candidate) {
                return false;
            }
            if self.is_excluded(candidate) {
                return true;
            }
        }
        false
    }

    /// Ancestor check bounded by the configured sync roots.
    pub fn is_excluded_within_roots(&self, path: &Path) -> bool {
        self.is_excluded_considering_ancestors(path, &self.roots)
    }

    /// Returns `true` when a new entry was stored.
    pub fn add_to_blacklist(&mut self, path: &Path) -> bool {
        if self.is_excluded_within_roots(path) {
            debug!(path = %path.display(), "already excluded");
            return false;
        }
        info!(path = %path.display(), "blacklist add");
        self.paths.insert(path.to_path_buf())
    }

    /// Drops entries that vanished from disk or sit under another exclusion.
    /// Returns how many entries were removed.
    pub fn compact(&mut self) -> usize {
        let before = self.paths.len();
        let kept: BTreeSet<PathBuf> = self
            .paths
            .iter()
            .filter(|entry| {
                entry.exists()
                    && !entry
                        .parent()
                        .is_some_and(|parent| self.is_excluded_within_roots(parent))
            })
            .cloned()
            .collect();
        self.paths = kept;
        before - self.paths.len()
    }
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: false,
        require_literal_leading_dot: false,
    }
}
