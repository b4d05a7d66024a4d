use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::transfer::DownloadItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Accept,
    Reject,
    AcceptWithRename,
    AcceptAll,
    RejectAll,
    RenameAll,
}

impl ConflictChoice {
    /// Splits a bulk choice into the per-item choice it applies.
    fn expand(self) -> (ConflictChoice, bool) {
        match self {
            ConflictChoice::AcceptAll => (ConflictChoice::Accept, true),
            ConflictChoice::RejectAll => (ConflictChoice::Reject, true),
            ConflictChoice::RenameAll => (ConflictChoice::AcceptWithRename, true),
            single => (single, false),
        }
    }
}

/// Source of per-conflict decisions.
pub trait ConflictPrompt {
    fn choose(&mut self, conflict: &DownloadItem) -> ConflictChoice;
}

/// Answers every conflict the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedChoice(pub ConflictChoice);

impl ConflictPrompt for FixedChoice {
    fn choose(&mut self, _conflict: &DownloadItem) -> ConflictChoice {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    /// Ready to download, destination possibly renamed.
    pub accepted: Vec<DownloadItem>,
    pub rejected: Vec<DownloadItem>,
    /// Left undecided because no changes may be committed.
    pub deferred: Vec<DownloadItem>,
}

pub struct ConflictResolver<'p> {
    prompt: &'p mut dyn ConflictPrompt,
    dry_run: bool,
}

impl<'p> ConflictResolver<'p> {
    pub fn new(prompt: &'p mut dyn ConflictPrompt, dry_run: bool) -> Self {
        Self { prompt, dry_run }
    }

    pub fn resolve(&mut self, conflicts: Vec<DownloadItem>) -> Resolution {
        let mut resolution = Resolution::default();
        if self.dry_run {
            for item in &conflicts {
                info!(
                    path = %item.destination.display(),
                    remote_id = %item.remote_id,
                    "conflict deferred"
                );
            }
            resolution.deferred = conflicts;
            return resolution;
        }

        let mut bulk: Option<ConflictChoice> = None;
        let mut reserved = HashSet::new();
        for mut item in conflicts {
            let choice = match bulk {
                Some(choice) => choice,
                None => {
                    let (choice, sticky) = self.prompt.choose(&item).expand();
                    if sticky {
                        bulk = Some(choice);
                    }
                    choice
                }
            };

            match choice {
                ConflictChoice::Reject => {
                    info!(path = %item.destination.display(), remote_id = %item.remote_id, "conflict rejected");
                    resolution.rejected.push(item);
                }
                ConflictChoice::AcceptWithRename => {
                    let renamed = non_colliding_path(&item.destination, &reserved);
                    debug!(
                        from = %item.destination.display(),
                        to = %renamed.display(),
                        "conflict accepted under new name"
                    );
                    reserved.insert(renamed.clone());
                    item.destination = renamed;
                    resolution.accepted.push(item);
                }
                _ => {
                    info!(path = %item.destination.display(), remote_id = %item.remote_id, "conflict accepted, overwriting");
                    resolution.accepted.push(item);
                }
            }
        }
        resolution
    }
}

/// First `name (N).ext` sibling of `path`, N counting from 1, that neither
/// exists on disk nor is in `reserved`.
pub fn non_colliding_path(path: &Path, reserved: &HashSet<PathBuf>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    let extension = path.extension().map(|ext| ext.to_os_string());

    let mut counter = 1u32;
    loop {
        let mut name = OsString::from(&stem);
        name.push(format!(" ({counter})"));
        if let Some(extension) = &extension {
            name.push(".");
            name.push(extension);
        }
        let candidate = path.with_file_name(name);
        if !candidate.exists() && !reserved.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesync_core::RemoteKind;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    struct Scripted {
        answers: VecDeque<ConflictChoice>,
        asked: usize,
    }

    impl Scripted {
        fn new(answers: &[ConflictChoice]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                asked: 0,
            }
        }
    }

    impl ConflictPrompt for Scripted {
        fn choose(&mut self, _conflict: &DownloadItem) -> ConflictChoice {
            self.asked += 1;
            self.answers.pop_front().unwrap_or(ConflictChoice::Reject)
        }
    }

    fn conflict(destination: PathBuf) -> DownloadItem {
        DownloadItem {
            remote_id: format!("id-{}", destination.display()),
            kind: RemoteKind::File,
            md5: Some("remote".into()),
            destination,
        }
    }

    #[test]
    fn rename_skips_existing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("report (1).txt"), b"2").unwrap();

        let renamed = non_colliding_path(&dir.path().join("report.txt"), &HashSet::new());
        assert_eq!(renamed, dir.path().join("report (2).txt"));
    }

    #[test]
    fn rename_handles_missing_extension() {
        let dir = tempdir().unwrap();
        let renamed = non_colliding_path(&dir.path().join("Makefile"), &HashSet::new());
        assert_eq!(renamed, dir.path().join("Makefile (1)"));
    }

    #[test]
    fn rename_skips_names_reserved_in_the_batch() {
        let dir = tempdir().unwrap();
        let reserved = HashSet::from([dir.path().join("a (1).txt")]);
        let renamed = non_colliding_path(&dir.path().join("a.txt"), &reserved);
        assert_eq!(renamed, dir.path().join("a (2).txt"));
    }

    #[test]
    fn per_item_choices_split_accepted_and_rejected() {
        let dir = tempdir().unwrap();
        let mut prompt = Scripted::new(&[ConflictChoice::Accept, ConflictChoice::Reject]);
        let mut resolver = ConflictResolver::new(&mut prompt, false);

        let resolution = resolver.resolve(vec![
            conflict(dir.path().join("a.txt")),
            conflict(dir.path().join("b.txt")),
        ]);

        assert_eq!(resolution.accepted.len(), 1);
        assert_eq!(resolution.accepted[0].destination, dir.path().join("a.txt"));
        assert_eq!(resolution.rejected.len(), 1);
        assert!(resolution.deferred.is_empty());
    }

    #[test]
    fn bulk_choice_applies_to_remaining_items_without_prompting() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("same.txt");
        std::fs::write(&target, b"local").unwrap();
        let mut prompt = Scripted::new(&[ConflictChoice::Reject, ConflictChoice::RenameAll]);

        let resolution = {
            let mut resolver = ConflictResolver::new(&mut prompt, false);
            resolver.resolve(vec![
                conflict(dir.path().join("skip.txt")),
                conflict(target.clone()),
                conflict(target.clone()),
                conflict(target.clone()),
            ])
        };

        assert_eq!(prompt.asked, 2);
        assert_eq!(resolution.rejected.len(), 1);
        let destinations: Vec<_> = resolution
            .accepted
            .iter()
            .map(|item| item.destination.clone())
            .collect();
        assert_eq!(
            destinations,
            vec![
                dir.path().join("same (1).txt"),
                dir.path().join("same (2).txt"),
                dir.path().join("same (3).txt"),
            ]
        );
    }

    #[test]
    fn dry_run_defers_without_prompting() {
        let dir = tempdir().unwrap();
        let mut prompt = Scripted::new(&[ConflictChoice::Accept]);

        let resolution = {
            let mut resolver = ConflictResolver::new(&mut prompt, true);
            resolver.resolve(vec![conflict(dir.path().join("a.txt"))])
        };

        assert_eq!(prompt.asked, 0);
        assert_eq!(resolution.deferred.len(), 1);
        assert!(resolution.accepted.is_empty());
        assert!(resolution.rejected.is_empty());
    }

    #[test]
    fn fixed_choice_renames_to_distinct_path() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("edit.txt");
        std::fs::write(&target, b"local edit").unwrap();
        let mut prompt = FixedChoice(ConflictChoice::AcceptWithRename);

        let resolution = ConflictResolver::new(&mut prompt, false).resolve(vec![conflict(target.clone())]);

        assert_ne!(resolution.accepted[0].destination, target);
        assert!(!resolution.accepted[0].destination.exists());
    }
}
