//! Step execution: sequential for do mode, dependency-parallel prefix plus a
//! sequential tail for think mode.
//!
//! Ledger and plan writes happen only on the driver task. Parallel branches
//! run the executor call and nothing else, so step records are written in the
//! order results are reaped and the run state stays single-writer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{StepContext, StepExecutor, StepOutput};
use crate::core::choices::{default_choices, suspend_reason};
use crate::core::dependencies::{dependency_orders, ready_orders};
use crate::core::types::{
    ActionKind, DebugLevel, ItemStatus, ModeState, OutputKind, PausedMarker, PlanItem, StepRecord,
    StepStatus,
};
use crate::engine::{ActiveRun, Engine};
use crate::events::EventSink;

/// How an execution stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    /// Every scheduled step is settled.
    Completed,
    Failed { order: u32, error: String },
    Suspended { order: u32 },
    Cancelled,
}

/// Result of applying one executor call to the ledger and the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepResult {
    Done,
    Failed(String),
    Suspended,
}

/// Run steps `from..=total` one at a time with a checkpoint after each.
pub(crate) async fn run_sequential(
    engine: &Engine,
    run: &mut ActiveRun,
    from: u32,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let total = run.plan.total_steps();
    for order in from.max(1)..=total {
        if cancel.is_cancelled() {
            return Ok(ExecOutcome::Cancelled);
        }
        let Some(item) = run.plan.item(order).cloned() else {
            break;
        };
        if item.status.is_settled() {
            continue;
        }

        let record = begin_step(engine, run, order, &item, "sequential").await?;
        let ctx = step_context(engine, run, order);
        let executor = Arc::clone(&engine.agents.executor);
        let outcome = tokio::select! {
            out = executor.execute(&item, &ctx) => out,
            _ = cancel.cancelled() => return Ok(ExecOutcome::Cancelled),
        };
        let result = complete_step(engine, run, order, record, outcome, events).await?;
        if result == StepResult::Done {
            run.state.envelope.step_order = order + 1;
        } else {
            run.state.envelope.step_order = order;
        }
        engine.checkpoint(run, None, false).await;
        run.emit_plan(events);

        match result {
            StepResult::Done => {}
            StepResult::Failed(error) => return Ok(ExecOutcome::Failed { order, error }),
            StepResult::Suspended => return Ok(ExecOutcome::Suspended { order }),
        }
    }
    Ok(ExecOutcome::Completed)
}

/// Run the unsettled prefix in dependency order, then the confirmation tail.
///
/// A failure or suspension stops new branches from starting; branches already
/// running are drained and recorded before returning. Failure reports the
/// lowest failed order.
pub(crate) async fn run_parallel(
    engine: &Engine,
    run: &mut ActiveRun,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let total = run.plan.total_steps();
    let tail = run.plan.confirmation_tail();
    let prefix_end = tail.map_or(total, |t| t - 1);

    let mut pending: BTreeSet<u32> = (1..=prefix_end)
        .filter(|order| run.plan.item(*order).is_some_and(|i| !i.status.is_settled()))
        .collect();
    let mut completed: BTreeSet<u32> = (1..=total)
        .filter(|order| run.plan.item(*order).is_some_and(|i| i.status.is_settled()))
        .collect();
    let graph = dependency_orders(&run.plan, &pending);

    let mut branches: JoinSet<Result<StepOutput>> = JoinSet::new();
    let mut in_flight: HashMap<tokio::task::Id, (u32, StepRecord)> = HashMap::new();
    let mut failed: Option<(u32, String)> = None;
    let mut suspended: Option<u32> = None;

    loop {
        if failed.is_none() && suspended.is_none() && !cancel.is_cancelled() {
            let mut ready = ready_orders(&run.plan, &graph, &pending, &completed);
            if ready.is_empty() && in_flight.is_empty() {
                // Unsatisfiable dependencies: fall back to plan order.
                if let Some(first) = pending.iter().next().copied() {
                    warn!(run_id = %run.key.run_id, order = first, "no ready step, running lowest pending");
                    ready.push(first);
                }
            }
            for order in ready {
                let Some(item) = run.plan.item(order).cloned() else {
                    pending.remove(&order);
                    continue;
                };
                pending.remove(&order);
                let record = begin_step(engine, run, order, &item, "parallel").await?;
                let ctx = step_context(engine, run, order);
                let executor: Arc<dyn StepExecutor> = Arc::clone(&engine.agents.executor);
                let handle = branches.spawn(async move { executor.execute(&item, &ctx).await });
                in_flight.insert(handle.id(), (order, record));
            }
            run.emit_plan(events);
        }

        if in_flight.is_empty() {
            break;
        }

        let joined = tokio::select! {
            joined = branches.join_next_with_id() => joined,
            _ = cancel.cancelled() => {
                branches.abort_all();
                while branches.join_next().await.is_some() {}
                return Ok(ExecOutcome::Cancelled);
            }
        };
        let Some(joined) = joined else {
            break;
        };
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(join) => {
                let id = join.id();
                (id, Err(anyhow::anyhow!("step branch aborted: {join}")))
            }
        };
        let Some((order, record)) = in_flight.remove(&id) else {
            continue;
        };

        let result = complete_step(engine, run, order, record, outcome, events).await?;
        match result {
            StepResult::Done => {
                completed.insert(order);
            }
            StepResult::Failed(error) => {
                if failed.as_ref().is_none_or(|(lowest, _)| order < *lowest) {
                    failed = Some((order, error));
                }
            }
            StepResult::Suspended => {
                suspended = Some(suspended.map_or(order, |o: u32| o.min(order)));
            }
        }
        run.state.envelope.step_order = first_unsettled(run).unwrap_or(total + 1);
        if let Some(order) = suspended {
            run.state.envelope.step_order = order;
        }
        engine.checkpoint(run, None, false).await;
        run.emit_plan(events);
    }

    if let Some(order) = suspended {
        return Ok(ExecOutcome::Suspended { order });
    }
    if let Some((order, error)) = failed {
        run.state.envelope.step_order = order;
        return Ok(ExecOutcome::Failed { order, error });
    }
    if cancel.is_cancelled() {
        return Ok(ExecOutcome::Cancelled);
    }

    match tail {
        Some(order) if run.plan.item(order).is_some_and(|i| !i.status.is_settled()) => {
            debug!(run_id = %run.key.run_id, order, "running confirmation tail");
            run_tail(engine, run, order, events, cancel).await
        }
        _ => Ok(ExecOutcome::Completed),
    }
}

async fn run_tail(
    engine: &Engine,
    run: &mut ActiveRun,
    order: u32,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let Some(item) = run.plan.item(order).cloned() else {
        return Ok(ExecOutcome::Completed);
    };
    let record = begin_step(engine, run, order, &item, "tail").await?;
    let ctx = step_context(engine, run, order);
    let executor = Arc::clone(&engine.agents.executor);
    let outcome = tokio::select! {
        out = executor.execute(&item, &ctx) => out,
        _ = cancel.cancelled() => return Ok(ExecOutcome::Cancelled),
    };
    let result = complete_step(engine, run, order, record, outcome, events).await?;
    run.state.envelope.step_order = if result == StepResult::Done { order + 1 } else { order };
    engine.checkpoint(run, None, false).await;
    run.emit_plan(events);
    Ok(match result {
        StepResult::Done => ExecOutcome::Completed,
        StepResult::Failed(error) => ExecOutcome::Failed { order, error },
        StepResult::Suspended => ExecOutcome::Suspended { order },
    })
}

fn first_unsettled(run: &ActiveRun) -> Option<u32> {
    run.plan
        .items
        .iter()
        .position(|item| !item.status.is_settled())
        .and_then(|idx| u32::try_from(idx + 1).ok())
}

fn step_context(engine: &Engine, run: &ActiveRun, order: u32) -> StepContext {
    StepContext {
        key: run.key.clone(),
        order,
        instruction: run.instruction.clone(),
        workdir: run.workdir.clone(),
        context: run.state.envelope.context.clone(),
        observations: run.recent_observations(engine.cfg.observation_window),
    }
}

/// Mark the ledger row and the plan item running.
async fn begin_step(
    engine: &Engine,
    run: &mut ActiveRun,
    order: u32,
    item: &PlanItem,
    lane: &str,
) -> Result<StepRecord> {
    let now = Utc::now();
    let attempts = engine
        .store
        .get_step(&run.key, order)
        .await?
        .filter(|row| row.step_id == item.id)
        .map_or(0, |row| row.attempts);
    let record = StepRecord {
        task_id: run.key.task_id.clone(),
        run_id: run.key.run_id.clone(),
        step_order: order,
        step_id: item.id.clone(),
        title: item.title.clone(),
        status: StepStatus::Running,
        result: None,
        error: None,
        attempts: attempts + 1,
        started_at: Some(now),
        finished_at: None,
        updated_at: now,
    };
    engine.store.upsert_step(record.clone()).await?;
    if let Some(slot) = run.plan.item_mut(order) {
        slot.status = ItemStatus::Running;
    }
    if let ModeState::Think {
        executor_assignments,
        ..
    } = &mut run.state.mode
    {
        executor_assignments.insert(item.id.clone(), lane.to_string());
    }
    info!(run_id = %run.key.run_id, order, step = %item.id, lane, "step started");
    Ok(record)
}

/// Apply an executor outcome to the ledger row, the plan item and the state.
async fn complete_step(
    engine: &Engine,
    run: &mut ActiveRun,
    order: u32,
    mut record: StepRecord,
    outcome: Result<StepOutput>,
    events: &EventSink,
) -> Result<StepResult> {
    let Some(item) = run.plan.item(order).cloned() else {
        return Ok(StepResult::Failed(format!("step#{order} missing from plan")));
    };
    let now = Utc::now();
    record.updated_at = now;

    let output = match outcome {
        Ok(output) => output,
        Err(err) => StepOutput::failed(format!("{err:#}")),
    };

    if let Some(request) = output.input_request {
        let reason = suspend_reason(&request.question, item.kind);
        let choices = default_choices(&request.question, &request.choices, item.kind);
        record.status = StepStatus::Waiting;
        engine.store.upsert_step(record).await?;
        set_item_status(run, order, ItemStatus::Waiting);
        run.state.envelope.paused = Some(PausedMarker {
            step_order: order,
            step_id: item.id.clone(),
            question: request.question.clone(),
            choices,
            reason,
        });
        run.state.envelope.suspend_reason = Some(reason);
        info!(run_id = %run.key.run_id, order, "step waiting for input");
        run.delta(events, request.question);
        return Ok(StepResult::Suspended);
    }

    if let Some(error) = output.error {
        record.status = StepStatus::Failed;
        record.error = Some(error.clone());
        record.finished_at = Some(now);
        engine.store.upsert_step(record).await?;
        set_item_status(run, order, ItemStatus::Failed);
        engine
            .store
            .debug(&run.key, Some(order), DebugLevel::Error, error.clone())
            .await;
        run.observe(format!("step#{order} {} failed: {error}", item.title));
        warn!(run_id = %run.key.run_id, order, error = %error, "step failed");
        run.delta(events, format!("step#{order} failed"));
        return Ok(StepResult::Failed(error));
    }

    record.status = StepStatus::Done;
    record.result = Some(output.result.clone());
    record.finished_at = Some(now);
    engine.store.upsert_step(record).await?;
    set_item_status(run, order, ItemStatus::Done);
    run.state
        .envelope
        .context
        .insert(item.id.clone(), output.result);
    if !output.observation.is_empty() {
        run.observe(format!("step#{order} {}: {}", item.title, output.observation));
    }
    if let Some(text) = output.output_text {
        if item.allows(ActionKind::TaskOutput) {
            engine
                .store
                .append_output(&run.key, OutputKind::Text, Some(order), text)
                .await?;
        } else {
            run.state
                .envelope
                .context
                .insert(format!("{}.text", item.id), json!(text));
        }
    }
    info!(run_id = %run.key.run_id, order, "step done");
    run.delta(events, format!("step#{order} {} done", item.title));
    Ok(StepResult::Done)
}

fn set_item_status(run: &mut ActiveRun, order: u32, status: ItemStatus) {
    if let Some(item) = run.plan.item_mut(order) {
        item.status = status;
    }
}

