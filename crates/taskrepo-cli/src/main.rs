//! tsk-sync - synchronise TaskRepo repositories with their remotes.

mod prompt;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use taskrepo_core::TaskRecord;
use taskrepo_sync::{
    discover_repositories, ListingOrder, MergeStrategy, Repository, RepositoryReport, SessionReport,
    SyncConfig, SyncEngine, SyncPolicy,
};

use prompt::PromptResolver;

/// Sync task repositories kept in git
#[derive(Parser)]
#[command(name = "tsk-sync")]
#[command(about = "Synchronise TaskRepo repositories with their remotes", long_about = None)]
struct Cli {
    /// Directory containing tasks-* repositories
    #[arg(short, long, default_value = ".")]
    parent_dir: PathBuf,

    /// Only these repositories (name or path); repeatable
    #[arg(short, long = "repo")]
    repos: Vec<String>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull, merge and push every repository (default)
    Sync {
        /// Conflict strategy: auto, prefer-local, prefer-remote, interactive
        #[arg(short, long, default_value = "auto")]
        strategy: MergeStrategy,

        /// Do not merge fields automatically
        #[arg(long)]
        no_auto_merge: bool,

        /// Do not push after pulling
        #[arg(long)]
        no_push: bool,

        /// Keep existing display ids instead of renumbering
        #[arg(long)]
        no_rebalance: bool,

        /// Repositories processed at the same time
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List records with their display ids
    List {
        /// Sort keys, e.g. priority,-due
        #[arg(long, value_delimiter = ',', default_value = "priority,due")]
        sort: Vec<String>,

        /// Include archived records
        #[arg(long)]
        archived: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("taskrepo_sync={level}").parse()?)
                .add_directive(format!("tsk_sync={level}").parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .init();

    let repositories = select_repositories(&cli)?;
    if repositories.is_empty() {
        return Err(format!("no tasks-* repositories found in {}", cli.parent_dir.display()).into());
    }

    match cli.command.unwrap_or(Commands::Sync {
        strategy: MergeStrategy::Auto,
        no_auto_merge: false,
        no_push: false,
        no_rebalance: false,
        jobs: None,
        json: false,
    }) {
        Commands::Sync {
            strategy,
            no_auto_merge,
            no_push,
            no_rebalance,
            jobs,
            json,
        } => {
            let mut config = SyncConfig::from_env();
            if no_push {
                config = config.with_push(false);
            }
            if let Some(jobs) = jobs {
                config = config.with_max_parallel(jobs);
            }
            let policy = SyncPolicy {
                auto_merge: !no_auto_merge,
                strategy,
                rebalance_ids: !no_rebalance,
            };

            let mut engine = SyncEngine::new(config);
            if strategy == MergeStrategy::Interactive {
                engine = engine.with_resolver(Arc::new(PromptResolver::new()));
            }

            let token = engine.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; finishing repositories in progress");
                    token.cancel();
                }
            });

            let session = engine.sync(&repositories, &policy).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
            if !session.is_ok() {
                std::process::exit(1);
            }
        }
        Commands::List { sort, archived } => {
            let order = ListingOrder::from_fields(&sort)?;
            let engine = SyncEngine::new(SyncConfig::from_env());
            for repository in &repositories {
                let listing = engine.read_snapshot(repository, archived).await?;
                let mut records: Vec<&TaskRecord> = listing.records.iter().collect();
                records.sort_by(|a, b| order.compare(a, b));

                println!("{} ({}):", repository.name, records.len());
                for record in records {
                    let id = record
                        .display_id
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {:>4}  {:<11}  {}  {}",
                        id,
                        record.status.as_str(),
                        record.priority.as_str(),
                        record.title
                    );
                }
                for issue in &listing.issues {
                    println!("  !     {}: {}", issue.path.display(), issue.error);
                }
            }
        }
    }

    Ok(())
}

fn select_repositories(cli: &Cli) -> Result<Vec<Repository>, Box<dyn std::error::Error>> {
    let discovered = discover_repositories(&cli.parent_dir)?;
    if cli.repos.is_empty() {
        return Ok(discovered);
    }

    let mut selected = Vec::new();
    for wanted in &cli.repos {
        let found = discovered
            .iter()
            .find(|r| &r.name == wanted || r.path.ends_with(wanted))
            .cloned();
        match found {
            Some(repository) => selected.push(repository),
            None => {
                let path = PathBuf::from(wanted);
                if path.is_dir() {
                    selected.push(Repository::from_path(path));
                } else {
                    return Err(format!("unknown repository '{wanted}'").into());
                }
            }
        }
    }
    Ok(selected)
}

fn print_session(session: &SessionReport) {
    println!("{:<16}  {:<10}  {:<14}  {:<20}  {}", "REPOSITORY", "OUTCOME", "PULL", "PUSH", "CHANGES");
    println!("{}", "-".repeat(80));
    for report in &session.repositories {
        print_repository(report);
    }
    println!();
    println!("Session: {:?}", session.severity);
}

fn print_repository(report: &RepositoryReport) {
    let changes = format!(
        "+{} ~{} -{}",
        report.counts.created, report.counts.updated, report.counts.deleted
    );
    println!(
        "{:<16}  {:<10}  {:<14}  {:<20}  {}",
        report.name,
        format!("{:?}", report.outcome),
        format!("{:?}", report.pull),
        format!("{:?}", report.push),
        changes
    );

    for file in &report.auto_merged {
        let fields: Vec<String> = file
            .decisions
            .iter()
            .map(|d| format!("{}={:?}", d.field, d.resolution))
            .collect();
        println!("    merged  {}  {}", file.path.display(), fields.join(" "));
    }
    for path in &report.manual {
        println!("    manual  {}", path.display());
    }
    for path in &report.uncommitted {
        println!("    stray   {}", path.display());
    }
    for path in &report.needs_review {
        println!("    review  {}", path.display());
    }
    for warning in &report.validation {
        println!("    invalid {}: {}", warning.path.display(), warning.message);
    }
    for warning in &report.warnings {
        println!("    warning {warning}");
    }
    if let Some(error) = &report.error {
        println!("    error   {error}");
    }
    if let Some(hint) = &report.hint {
        println!("    hint    {hint}");
    }
}
