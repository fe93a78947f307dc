//! Resume preflight: where to continue, and reconciling a user's answer.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::core::resume_point::{ResumeDecision, ResumeInputs, decide_resume_point};
use crate::core::types::{ItemStatus, OutputKind, RunStatus, StepRecord, StepStatus};
use crate::engine::{ActiveRun, Engine};
use crate::events::EventSink;
use crate::finalize::finalize;

/// Compute the resume point for a loaded run from its ledger.
///
/// The ledger is first realigned to the persisted plan, which finishes a
/// reflection splice that stopped between its checkpoint and its ledger moves.
pub(crate) async fn preflight(engine: &Engine, run: &ActiveRun) -> Result<ResumeDecision> {
    let realigned = engine.store.realign_steps(&run.key, &run.plan).await?;
    if !realigned.is_empty() {
        warn!(
            run_id = %run.key.run_id,
            moved = realigned.moves.len(),
            skipped = realigned.skipped.len(),
            "ledger realigned to the saved plan"
        );
    }
    let steps = engine.store.list_steps(&run.key).await?;
    let inputs = ResumeInputs::collect(&run.state.envelope, &run.plan, &steps);
    let decision = decide_resume_point(&inputs);
    info!(
        run_id = %run.key.run_id,
        resume_at = decision.resume_step_order,
        skip = decision.skip_execution,
        "resume point decided"
    );
    Ok(decision)
}

/// Record the user's answer to the paused step and clear the pause.
///
/// Returns the 1-based order execution continues from. Persistence failures
/// are logged, never raised.
pub(crate) async fn apply_resume_user_input(
    engine: &Engine,
    run: &mut ActiveRun,
    answer: &str,
    events: &EventSink,
) -> u32 {
    let Some(paused) = run.state.envelope.paused.clone() else {
        return run.state.envelope.step_order;
    };
    // The marker's id is authoritative if a splice moved the step.
    let order = run
        .plan
        .order_of(&paused.step_id)
        .unwrap_or(paused.step_order);

    if let Err(err) = engine
        .store
        .append_output(&run.key, OutputKind::UserAnswer, Some(order), answer.to_string())
        .await
    {
        warn!(run_id = %run.key.run_id, error = %format!("{err:#}"), "answer output not written");
    }

    let result = json!({ "question": paused.question, "answer": answer });
    let row_key = run.key.clone();
    let step_id = paused.step_id.clone();
    let title = run
        .plan
        .item(order)
        .map(|i| i.title.clone())
        .unwrap_or_default();
    let row_result = result.clone();
    let marked = engine
        .store
        .call_on_conflict("mark answered step done", move |repo| {
            let now = Utc::now();
            let mut row = repo
                .get_step(&row_key.task_id, &row_key.run_id, order)?
                .unwrap_or_else(|| StepRecord {
                    task_id: row_key.task_id.clone(),
                    run_id: row_key.run_id.clone(),
                    step_order: order,
                    step_id: step_id.clone(),
                    title: title.clone(),
                    status: StepStatus::Waiting,
                    result: None,
                    error: None,
                    attempts: 1,
                    started_at: Some(now),
                    finished_at: None,
                    updated_at: now,
                });
            row.status = StepStatus::Done;
            row.result = Some(row_result.clone());
            row.error = None;
            row.finished_at = Some(now);
            row.updated_at = now;
            repo.upsert_step(&row)
        })
        .await;
    if let Err(err) = marked {
        warn!(run_id = %run.key.run_id, error = %format!("{err:#}"), "answered step not marked done");
    }

    let terminal = run.plan.confirmation_tail() == Some(order);
    let input_only = run.plan.item(order).is_some_and(|i| i.is_input_only());
    if let Some(item) = run.plan.item_mut(order) {
        item.status = if input_only {
            ItemStatus::Done
        } else {
            ItemStatus::Pending
        };
    }
    let resume_at = if input_only && !terminal { order + 1 } else { order };

    let envelope = &mut run.state.envelope;
    envelope.paused = None;
    envelope.step_order = resume_at;
    envelope.context.insert("user_answer".to_string(), json!(answer));
    envelope.context.insert(paused.step_id.clone(), result);
    envelope
        .observations
        .push(format!("user answered step#{order} \"{}\": {answer}", paused.question));

    engine
        .checkpoint(run, Some(RunStatus::Running), true)
        .await;
    engine.mirror_task(&run.key, RunStatus::Running).await;
    run.emit_plan(events);
    info!(run_id = %run.key.run_id, order, resume_at, "answer applied");
    resume_at
}

/// Finish a run whose plan was fully executed before the process stopped.
pub(crate) async fn finalize_skip_execution_resume(
    engine: &Engine,
    run: &mut ActiveRun,
    events: &EventSink,
) -> RunStatus {
    for item in &mut run.plan.items {
        if !matches!(
            item.status,
            ItemStatus::Done | ItemStatus::Skipped | ItemStatus::Failed
        ) {
            item.status = ItemStatus::Done;
        }
    }
    run.state.envelope.step_order = run.plan.total_steps() + 1;
    engine.checkpoint(run, None, false).await;

    let failed: Vec<String> = run
        .plan
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.status == ItemStatus::Failed)
        .map(|(idx, _)| format!("step#{}", idx + 1))
        .collect();
    if !failed.is_empty() {
        let error = format!("unresolved failed steps: {}", failed.join(", "));
        warn!(run_id = %run.key.run_id, error = %error, "resumed run still has failed steps");
        return finalize(engine, run, RunStatus::Failed, Some(error), events).await;
    }

    let missing = engine
        .artifacts
        .missing(&run.workdir, &run.plan.declared_artifacts());
    if missing.is_empty() {
        finalize(engine, run, RunStatus::Done, None, events).await
    } else {
        let error = format!("declared artifacts missing: {}", missing.join(", "));
        warn!(run_id = %run.key.run_id, error = %error, "downgrading resumed run to failed");
        finalize(engine, run, RunStatus::Failed, Some(error), events).await
    }
}
