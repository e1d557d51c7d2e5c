use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;

use crate::core::normalize_path;
use crate::history::CouplingOptions;
use crate::session::ProjectSession;
use crate::session::SessionOptions;
use crate::watch::WatchConfig;

mod core;
mod error;
mod graph;
mod history;
mod impact;
mod imports;
mod languages;
mod memo;
mod scc;
mod session;
mod update;
mod watch;

/// Mine a project's import graph and answer change-impact queries
///
/// ripplemap scans the project for source files, resolves their imports
/// into a dependency graph, and reports how far a change to any one file
/// ripples through the rest: direct and transitive dependents, cascade
/// depth, circular clusters, and a risk classification. Commit history can
/// be mined for the co-change couplings that imports alone do not reveal.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// The root of the project to scan
    ///
    /// Defaults to the nearest ancestor of the current directory carrying a
    /// manifest marker (a .git directory or a recognised project file).
    #[arg(short, long)]
    project_root: Option<PathBuf>,

    /// Cap on the number of files loaded into the graph
    #[arg(long)]
    max_files: Option<usize>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the dependency graph and print a summary
    Scan,

    /// Analyse the impact of changing one file
    Impact {
        /// The file to analyse
        file: PathBuf,

        /// Attach historically co-changing files not linked by imports
        #[arg(long)]
        couplings: bool,
    },

    /// Rank the most-imported files
    Hubs {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Mine commit history for change couplings
    Couplings {
        /// Number of commits to read, newest first
        #[arg(long, default_value_t = 500)]
        max_commits: usize,

        /// Minimum co-change count for a pair to be reported
        #[arg(long, default_value_t = 3)]
        min_support: usize,

        /// Minimum confidence for a pair to be reported
        #[arg(long, default_value_t = 0.3)]
        min_confidence: f64,

        /// Commits touching more files than this are ignored
        #[arg(long, default_value_t = 20)]
        max_files_per_commit: usize,
    },

    /// Watch the project, applying changes to the graph as they happen
    ///
    /// Change events and graph updates are streamed to stdout as JSON
    /// lines until interrupted.
    Watch {
        /// Per-path debounce window in milliseconds
        #[arg(long, default_value_t = 1500)]
        debounce_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let multi_progress = MultiProgress::new();
    LogWrapper::new(multi_progress.clone(), logger).try_init().unwrap();

    let root = resolve_project_root(cli.project_root)?;
    let options = SessionOptions {
        max_files: cli.max_files,
        coupling: coupling_options(&cli.command),
        ..Default::default()
    };

    let start = Instant::now();
    let session = Arc::new(ProjectSession::open(&root, options, Some(&multi_progress)));

    match cli.command {
        Command::Scan => print_json(&session.summary())?,
        Command::Impact { file, couplings } => {
            let file = normalize_path(absolutize(file)?);
            let report = session.analyze_impact(&file, couplings)?;
            print_json(&report)?;
            log::debug!("Memo cache: {:?}", session.memo_stats());
        }
        Command::Hubs { top } => print_json(&session.hub_files(top))?,
        Command::Couplings { .. } => print_json(&*session.couplings())?,
        Command::Watch { debounce_ms } => {
            session.subscribe_changes(|event| {
                if let Ok(line) = serde_json::to_string(event) {
                    println!("{}", line);
                }
            });
            session.subscribe_graph_updates(|update| {
                if let Ok(line) = serde_json::to_string(update) {
                    println!("{}", line);
                }
            });

            session.clone().watch(WatchConfig { debounce: Duration::from_millis(debounce_ms) })?;
            log::info!("Watching {}. Interrupt to stop.", session.project_root().display());

            loop {
                std::thread::park();
            }
        }
    }

    log::info!("Finished in {}ms.", start.elapsed().as_millis());
    Ok(())
}

fn resolve_project_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(root) => Ok(root),
        None => {
            let cwd = std::env::current_dir()?;
            Ok(ProjectSession::discover_project_root(&cwd).unwrap_or(cwd))
        }
    }
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn coupling_options(command: &Command) -> CouplingOptions {
    match command {
        Command::Couplings { max_commits, min_support, min_confidence, max_files_per_commit } => {
            CouplingOptions {
                max_commits: *max_commits,
                min_support: *min_support,
                min_confidence: *min_confidence,
                max_files_per_commit: *max_files_per_commit,
            }
        }
        _ => CouplingOptions::default(),
    }
}
