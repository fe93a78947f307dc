//! Operator CLI for the run engine.
//!
//! Reads the file-backed store and event log written by an embedding service.
//! Run drivers themselves are library entry points; the CLI only routes
//! messages, inspects persisted runs and replays logged events.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use run_engine::core::resume_point::{ResumeInputs, decide_resume_point};
use run_engine::core::types::RunRecord;
use run_engine::exit_codes;
use run_engine::io::config::{RouterConfig, load_config, to_toml};
use run_engine::io::event_log::EventLog;
use run_engine::io::repository::{FileRepository, Repository};
use run_engine::logging;
use run_engine::router::route;

#[derive(Parser)]
#[command(
    name = "run-engine",
    version,
    about = "Inspect and route resumable multi-step runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a message with the deterministic heuristic and print the decision.
    Route {
        message: String,
    },
    /// Print a run's status, plan items and step ledger.
    Inspect {
        #[arg(long)]
        store: PathBuf,
        task_id: String,
        run_id: String,
    },
    /// Print where a resumed run would continue.
    ResumePoint {
        #[arg(long)]
        store: PathBuf,
        task_id: String,
        run_id: String,
    },
    /// Print logged events of a session after a sequence id.
    Replay {
        #[arg(long)]
        events: PathBuf,
        session: String,
        #[arg(long, default_value_t = 0)]
        after: u64,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = "run-engine.toml")]
        path: PathBuf,
    },
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
    match cli.command {
        Command::Route { message } => cmd_route(&message),
        Command::Inspect {
            store,
            task_id,
            run_id,
        } => cmd_inspect(&store, &task_id, &run_id),
        Command::ResumePoint {
            store,
            task_id,
            run_id,
        } => cmd_resume_point(&store, &task_id, &run_id),
        Command::Replay {
            events,
            session,
            after,
        } => cmd_replay(&events, &session, after),
        Command::Config { path } => cmd_config(&path),
    }
}

fn cmd_route(message: &str) -> Result<i32> {
    let decision = route(message, None, &RouterConfig::default());
    print_json(&decision)?;
    Ok(exit_codes::OK)
}

fn cmd_inspect(store: &Path, task_id: &str, run_id: &str) -> Result<i32> {
    let repo = FileRepository::new(store);
    let Some(run) = load_run(&repo, task_id, run_id)? else {
        return Ok(exit_codes::NOT_FOUND);
    };
    let steps = repo
        .list_steps(task_id, run_id)
        .context("list step ledger")?;
    let items: Vec<_> = run
        .plan
        .as_ref()
        .map(|plan| plan.items.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            json!({
                "order": idx + 1,
                "id": item.id,
                "title": item.title,
                "status": item.status,
            })
        })
        .collect();
    let ledger: Vec<_> = steps
        .iter()
        .map(|step| {
            json!({
                "order": step.step_order,
                "step_id": step.step_id,
                "status": step.status,
                "attempts": step.attempts,
                "error": step.error,
            })
        })
        .collect();
    print_json(&json!({
        "run_id": run.run_id,
        "mode": run.mode,
        "status": run.status,
        "error": run.error,
        "warnings": run.warnings,
        "paused": run.state.envelope.paused,
        "items": items,
        "steps": ledger,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_resume_point(store: &Path, task_id: &str, run_id: &str) -> Result<i32> {
    let repo = FileRepository::new(store);
    let Some(run) = load_run(&repo, task_id, run_id)? else {
        return Ok(exit_codes::NOT_FOUND);
    };
    let steps = repo
        .list_steps(task_id, run_id)
        .context("list step ledger")?;
    let plan = run.plan.clone().unwrap_or_default();
    let inputs = ResumeInputs::collect(&run.state.envelope, &plan, &steps);
    let decision = decide_resume_point(&inputs);
    print_json(&json!({
        "resume_step_order": decision.resume_step_order,
        "skip_execution": decision.skip_execution,
        "paused": inputs.paused_step_order.is_some(),
        "pending_planning": inputs.pending_planning,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_replay(dir: &Path, session: &str, after: u64) -> Result<i32> {
    if !dir.join(format!("{session}.jsonl")).is_file() {
        eprintln!("session {session} not found in {}", dir.display());
        return Ok(exit_codes::NOT_FOUND);
    }
    let log = EventLog::persistent(dir);
    for logged in log.replay(session, after)? {
        println!(
            "{}",
            serde_json::to_string(&logged).context("serialize logged event")?
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_config(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    print!("{}", to_toml(&cfg)?);
    Ok(exit_codes::OK)
}

fn load_run(repo: &FileRepository, task_id: &str, run_id: &str) -> Result<Option<RunRecord>> {
    let run = repo
        .get_run(task_id, run_id)
        .with_context(|| format!("load run {run_id}"))?;
    if run.is_none() {
        eprintln!("run {run_id} not found for task {task_id}");
    }
    Ok(run)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_replay_defaults_after_to_zero() {
        let cli = Cli::parse_from(["run-engine", "replay", "--events", "logs", "s1"]);
        assert!(matches!(
            cli.command,
            Command::Replay { after: 0, ref session, .. } if session == "s1"
        ));
    }

    #[test]
    fn parse_inspect_requires_store() {
        assert!(Cli::try_parse_from(["run-engine", "inspect", "t1", "r1"]).is_err());
        let cli = Cli::parse_from(["run-engine", "inspect", "--store", "db", "t1", "r1"]);
        assert!(matches!(cli.command, Command::Inspect { .. }));
    }

    #[test]
    fn parse_config_default_path() {
        let cli = Cli::parse_from(["run-engine", "config"]);
        assert!(matches!(
            cli.command,
            Command::Config { ref path } if path == Path::new("run-engine.toml")
        ));
    }
}
