use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use drivesyncd::config::SyncConfig;
use drivesyncd::daemon::{DaemonRuntime, Operation};
use drivesyncd::sync::conflict::{ConflictChoice, ConflictPrompt, FixedChoice};
use drivesyncd::sync::engine::SyncReport;
use drivesyncd::sync::transfer::DownloadItem;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drivesyncd", version, about = "Sync local folders with a remote drive")]
struct Cli {
    /// Report what would change without transferring or persisting anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// How to settle files changed on both sides
    #[arg(long, value_enum, default_value_t = OnConflict::Ask, global = true)]
    on_conflict: OnConflict,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Apply remote removals, upload, then download
    Sync,
    /// Upload new and modified local files
    Upload,
    /// Download remote changes
    Download,
    /// Forget and blacklist items removed remotely
    Removed,
    /// Delete remote copies of locally removed items
    DeleteRemoved,
    /// Drop stale blacklist entries
    CompactBlacklist,
    /// Forget archived paths whose remote copy no longer exists
    PruneArchive,
    /// Delete remote copies of excluded paths and forget them
    PurgeBlacklisted,
    /// List rejected conflicts
    Conflicts,
    /// Download a whole remote folder
    Pull {
        remote_id: String,
        destination: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnConflict {
    Ask,
    Accept,
    Reject,
    Rename,
}

impl Command {
    fn operation(&self) -> Option<Operation> {
        Some(match self {
            Command::Sync => Operation::Sync,
            Command::Upload => Operation::Upload,
            Command::Download => Operation::Download,
            Command::Removed => Operation::Removed,
            Command::DeleteRemoved => Operation::DeleteRemoved,
            Command::CompactBlacklist => Operation::CompactBlacklist,
            Command::PruneArchive => Operation::PruneArchive,
            Command::PurgeBlacklisted => Operation::PurgeBlacklisted,
            Command::Conflicts => return None,
            Command::Pull {
                remote_id,
                destination,
            } => Operation::Pull {
                remote_id: remote_id.clone(),
                destination: destination.clone(),
            },
        })
    }
}

/// Asks on the terminal, once per conflict.
struct StdinPrompt;

impl ConflictPrompt for StdinPrompt {
    fn choose(&mut self, conflict: &DownloadItem) -> ConflictChoice {
        let stdin = std::io::stdin();
        loop {
            eprint!(
                "conflict: {} changed locally and remotely\n  [a]ccept, [r]eject, re[n]ame, or A/R/N for all: ",
                conflict.destination.display()
            );
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return ConflictChoice::Reject,
                Ok(_) => {}
            }
            if let Some(choice) = parse_answer(line.trim()) {
                return choice;
            }
        }
    }
}

fn parse_answer(answer: &str) -> Option<ConflictChoice> {
    match answer {
        "a" => Some(ConflictChoice::Accept),
        "r" => Some(ConflictChoice::Reject),
        "n" => Some(ConflictChoice::AcceptWithRename),
        "A" => Some(ConflictChoice::AcceptAll),
        "R" => Some(ConflictChoice::RejectAll),
        "N" => Some(ConflictChoice::RenameAll),
        _ => None,
    }
}

fn prompt_for(mode: OnConflict) -> Box<dyn ConflictPrompt> {
    match mode {
        OnConflict::Ask => Box::new(StdinPrompt),
        OnConflict::Accept => Box::new(FixedChoice(ConflictChoice::Accept)),
        OnConflict::Reject => Box::new(FixedChoice(ConflictChoice::Reject)),
        OnConflict::Rename => Box::new(FixedChoice(ConflictChoice::AcceptWithRename)),
    }
}

fn print_report(report: &SyncReport) {
    let sections = [
        ("folder", &report.folders_created),
        ("upload", &report.uploaded),
        ("download", &report.downloaded),
        ("conflict deferred", &report.conflicts_deferred),
        ("conflict rejected", &report.conflicts_rejected),
        ("removed", &report.removed),
        ("blacklisted", &report.blacklisted),
        ("deleted remotely", &report.deleted_remote),
        ("moved", &report.moved),
        ("pruned", &report.pruned),
        ("purged", &report.purged),
    ];
    for (label, paths) in sections {
        for path in paths {
            println!("{label}: {}", path.display());
        }
    }
    if report.blacklist_compacted > 0 {
        println!("blacklist entries dropped: {}", report.blacklist_compacted);
    }
    if report.is_empty() {
        println!("nothing to do");
    } else if report.dry_run {
        println!("dry run, nothing was changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let env_filter = if cli.verbose > 0 {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = SyncConfig::from_env()?;
    let mut runtime = DaemonRuntime::bootstrap(config, cli.dry_run).await?;

    let Some(operation) = cli.command.operation() else {
        let conflicts = runtime.conflicts().await?;
        if cli.json {
            let rows: Vec<_> = conflicts
                .iter()
                .map(|conflict| {
                    serde_json::json!({
                        "id": conflict.id,
                        "remote_id": conflict.remote_id,
                        "local_path": conflict.local_path,
                        "created": conflict.created,
                        "reason": conflict.reason,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            for conflict in &conflicts {
                println!(
                    "{}\t{}\t{}\t{}",
                    conflict.created,
                    conflict.reason,
                    conflict.remote_id,
                    conflict.local_path.display()
                );
            }
        }
        runtime.shutdown().await;
        return Ok(());
    };

    let mut prompt = prompt_for(cli.on_conflict);
    let result = runtime.run(operation, prompt.as_mut()).await;
    runtime.shutdown().await;
    let report = result?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}
