//! `stepper`: run isolated agent steps against registered projects and roll them back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use stepper::core::rollback_plan::RollbackMode;
use stepper::core::types::StepId;
use stepper::events::NoopSink;
use stepper::exit_codes;
use stepper::io::config::{DEFAULT_CONFIG_PATH, StepperConfig, load_config};
use stepper::io::container::DockerConnector;
use stepper::io::database::get_database_info;
use stepper::io::ledger::StepLedger;
use stepper::io::registry::{ConfigRegistry, ProjectRegistry};
use stepper::io::worktree::get_worktrees;
use stepper::logging;
use stepper::rollback::rollback;
use stepper::step::{StepOrchestrator, StepRequest};

#[derive(Parser)]
#[command(
    name = "stepper",
    version,
    about = "Isolated, reversible agent step cycles"
)]
struct Cli {
    /// Path to the TOML config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one agent step for a project and print the outcome as JSON.
    Step { project: String },
    /// Undo a project's steps starting at `step_id` and reset its repository.
    Rollback {
        project: String,
        step_id: StepId,
        /// Keep `step_id` itself; undo only later steps.
        #[arg(long)]
        keep_target: bool,
    },
    /// List a project's steps, most recent first.
    List {
        project: String,
        /// Only steps that have not been rolled back.
        #[arg(long)]
        active: bool,
    },
    /// Print diagnostics for a database file.
    DbInfo { path: PathBuf },
    /// List the git worktrees of a project's repository.
    Worktrees { project: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Step { project } => cmd_step(&cfg, &project),
        Command::Rollback {
            project,
            step_id,
            keep_target,
        } => cmd_rollback(&cfg, &project, step_id, keep_target),
        Command::List { project, active } => cmd_list(&cfg, &project, active),
        Command::DbInfo { path } => cmd_db_info(&path),
        Command::Worktrees { project } => cmd_worktrees(&cfg, &project),
    }
}

fn open_ledger(cfg: &StepperConfig) -> Result<StepLedger> {
    StepLedger::init(&cfg.ledger.path)
        .with_context(|| format!("open ledger {}", cfg.ledger.path.display()))
}

fn cmd_step(cfg: &StepperConfig, project: &str) -> Result<i32> {
    let registry = ConfigRegistry::from_config(cfg);
    let request = StepRequest::for_project(&registry, project, cfg.agent.clone())?;
    let ledger = open_ledger(cfg)?;
    let connector = DockerConnector::new(&cfg.container.docker_bin);
    let orchestrator = StepOrchestrator::new(&ledger, connector, cfg.step_config());
    let outcome = orchestrator
        .run_step(&request)
        .with_context(|| format!("step for project '{project}'"))?;
    print_json(&outcome)?;
    if let Some(branch) = &outcome.unmerged_branch {
        eprintln!("agent changes kept on branch '{branch}'; merge it manually");
        return Ok(exit_codes::CHANGES_UNMERGED);
    }
    Ok(exit_codes::for_step(outcome.exit_code, outcome.timed_out))
}

fn cmd_rollback(cfg: &StepperConfig, project: &str, step_id: StepId, keep_target: bool) -> Result<i32> {
    let paths = ConfigRegistry::from_config(cfg).resolve(project)?;
    let ledger = open_ledger(cfg)?;
    let mode = if keep_target {
        RollbackMode::KeepTarget
    } else {
        RollbackMode::UndoFrom
    };
    let outcome = rollback(&ledger, &paths.repo_dir, project, step_id, mode, &NoopSink)
        .with_context(|| format!("rollback of project '{project}' to step {step_id}"))?;
    print_json(&outcome)?;
    Ok(exit_codes::OK)
}

fn cmd_list(cfg: &StepperConfig, project: &str, active_only: bool) -> Result<i32> {
    let ledger = open_ledger(cfg)?;
    for step in ledger.list_steps(project, active_only)? {
        let after = step.commit_sha_after.as_deref().map(short_sha).unwrap_or("-");
        let exit = step
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        println!(
            "{}\t{}\t{}..{}\texit={}\ttokens={}",
            step.id,
            if step.active { "active" } else { "inactive" },
            short_sha(&step.commit_sha_before),
            after,
            exit,
            step.token_usage.total_tokens
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_db_info(path: &Path) -> Result<i32> {
    let info = get_database_info(path).with_context(|| format!("inspect {}", path.display()))?;
    print_json(&info)?;
    Ok(exit_codes::OK)
}

fn cmd_worktrees(cfg: &StepperConfig, project: &str) -> Result<i32> {
    let paths = ConfigRegistry::from_config(cfg).resolve(project)?;
    for worktree in get_worktrees(&paths.repo_dir)? {
        println!(
            "{}\t{}\t{}",
            worktree.path.display(),
            short_sha(&worktree.head),
            worktree.branch.as_deref().unwrap_or("(detached)")
        );
    }
    Ok(exit_codes::OK)
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
