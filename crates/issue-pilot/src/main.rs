use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use issue_pilot::applier::ChangeApplier;
use issue_pilot::config::{FileSettings, PilotConfig};
use issue_pilot::model::{BackoffPolicy, HttpTransport, ModelClient};
use issue_pilot::orchestrator::{Orchestrator, RunOutcome};
use issue_pilot::publisher::{GitCli, Publisher};
use issue_pilot::tracker::{GitHubTracker, IssueTracker};

#[derive(Parser)]
#[command(name = "issue-pilot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Turn the next labeled issue into a pull request", long_about = None)]
struct Cli {
    /// TOML file with non-secret settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working tree the plan is applied to (default: current directory)
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Process at most one eligible issue (default)
    Run,
    /// Show which issue a run would pick, without touching it
    Peek,
}

fn load_config(cli: &Cli) -> Result<PilotConfig> {
    let file = match &cli.config {
        Some(path) => FileSettings::load(path)?,
        None => FileSettings::default(),
    };
    let workdir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    Ok(PilotConfig::from_env(file, workdir)?)
}

async fn run(config: PilotConfig) -> Result<()> {
    let tracker = GitHubTracker::new(config.tracker.clone())?;
    let generator = ModelClient::new(
        HttpTransport::new(&config.model)?,
        config.model.model.clone(),
        config.tracker.repo.clone(),
        BackoffPolicy::from_settings(&config.model),
    );
    let applier = ChangeApplier::new(&config.workdir);
    let vcs = GitCli::new(&config.workdir)?;
    let publisher = Publisher::new(Box::new(vcs), &tracker, config.git.clone());

    let orchestrator = Orchestrator::new(&tracker, &generator, &applier, &publisher);
    match orchestrator.run_once().await? {
        RunOutcome::NoEligibleItem => info!("Nothing to do"),
        RunOutcome::Published { item, url } => info!(issue = item, url = %url, "Done"),
    }
    Ok(())
}

async fn peek(config: PilotConfig) -> Result<()> {
    let tracker = GitHubTracker::new(config.tracker)?;
    match tracker.select_next_eligible().await? {
        Some(item) => println!("#{} {}", item.id, item.title),
        None => println!("no eligible issue"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    info!(
        repo = %config.tracker.repo,
        model = %config.model.model,
        workdir = %config.workdir.display(),
        "issue-pilot starting"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Peek => peek(config).await,
    }
}
