//! The single funnel every run path passes through to reach its final status.
//!
//! Order matters: the artifact warning exists before items close, the failure
//! summary is written before the status flips, and postprocessing is handed off
//! last. No step here raises; each failure is logged and the funnel continues.

use chrono::Utc;
use tracing::{info, warn};

use crate::core::failure_summary::{synthesize_failure_output, truncate_chars};
use crate::core::sanitize::sanitize_error;
use crate::core::types::{
    AgentState, DebugLevel, ItemStatus, MemoryRecord, OutputKind, Plan, RunKey, RunStatus,
    StepStatus, SuspendReason, TaskStatus,
};
use crate::engine::{ActiveRun, Engine};
use crate::events::{EventSink, RunEvent};
use crate::io::checkpoint::Checkpoint;
use crate::io::postprocess::PostprocessJob;
use crate::io::store::Store;

/// Reconcile a run into `status` and return the status actually recorded.
pub(crate) async fn finalize(
    engine: &Engine,
    run: &mut ActiveRun,
    status: RunStatus,
    error: Option<String>,
    events: &EventSink,
) -> RunStatus {
    if status == RunStatus::Done {
        check_artifacts(engine, run, events).await;
    }
    close_items(run, status);
    if status == RunStatus::Failed {
        ensure_failure_output(engine, &run.key, error.as_deref()).await;
    }

    let mut cp = Checkpoint::new(run.key.clone(), run.state.clone())
        .with_plan(run.plan.clone())
        .with_status(status);
    cp.warnings = run.warnings.clone();
    cp.error = error;
    if let Err(err) = engine.store.persist(cp, None).await {
        engine
            .store
            .debug(&run.key, None, DebugLevel::Warn, format!("final status write failed: {err}"))
            .await;
    }
    engine.mirror_task(&run.key, status).await;
    info!(run_id = %run.key.run_id, status = status.as_str(), "run finalized");

    if status == RunStatus::Waiting
        && run.state.envelope.suspend_reason == Some(SuspendReason::ConfirmSatisfaction)
    {
        trigger_review(engine, run, events);
    }
    if status == RunStatus::Done {
        write_memory(engine, run, events).await;
    }
    if status.is_terminal() {
        engine.postprocess.enqueue(PostprocessJob {
            key: run.key.clone(),
            status,
        });
    }

    events.emit(RunEvent::Done {
        run_id: run.key.run_id.clone(),
        status,
    });
    status
}

async fn check_artifacts(engine: &Engine, run: &mut ActiveRun, events: &EventSink) {
    let declared = run.plan.declared_artifacts();
    if declared.is_empty() {
        return;
    }
    let missing = engine.artifacts.missing(&run.workdir, &declared);
    for path in missing {
        let warning = format!("declared artifact missing: {path}");
        warn!(run_id = %run.key.run_id, path = %path, "declared artifact missing");
        engine
            .store
            .debug(&run.key, None, DebugLevel::Warn, warning.clone())
            .await;
        run.delta(events, warning.clone());
        if !run.warnings.contains(&warning) {
            run.warnings.push(warning);
        }
    }
}

/// Roll lingering running items to the final outcome; waiting items stay.
pub(crate) fn close_items(run: &mut ActiveRun, status: RunStatus) {
    let closed = match status {
        RunStatus::Done => ItemStatus::Done,
        RunStatus::Failed | RunStatus::Stopped => ItemStatus::Failed,
        RunStatus::Running | RunStatus::Waiting => return,
    };
    for item in &mut run.plan.items {
        if item.status == ItemStatus::Running {
            item.status = closed;
        }
    }
}

/// Write a failure summary unless the run already has human-readable output.
async fn ensure_failure_output(engine: &Engine, key: &RunKey, error: Option<&str>) {
    let outputs = match engine.store.list_outputs(key).await {
        Ok(outputs) => outputs,
        Err(err) => {
            warn!(run_id = %key.run_id, error = %format!("{err:#}"), "cannot list outputs");
            Vec::new()
        }
    };
    if outputs.iter().any(|o| o.kind.is_human_readable()) {
        return;
    }
    let steps = engine.store.list_steps(key).await.unwrap_or_default();
    let debug = engine.store.list_debug(key).await.unwrap_or_default();
    let text = synthesize_failure_output(error, &steps, &debug, engine.cfg.error_excerpt_chars);
    if let Err(err) = engine
        .store
        .append_output(key, OutputKind::FailureSummary, None, text)
        .await
    {
        warn!(run_id = %key.run_id, error = %format!("{err:#}"), "failure summary not written");
    }
}

fn trigger_review(engine: &Engine, run: &ActiveRun, events: &EventSink) {
    let Some(evaluator) = engine.agents.evaluator.clone() else {
        return;
    };
    let key = run.key.clone();
    let store = engine.store.clone();
    let events = events.clone();
    let answer = run
        .state
        .envelope
        .context
        .get("user_answer")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    engine.postprocess.spawn_detached(async move {
        match evaluator.review(&key, answer.as_deref()).await {
            Ok(verdict) => {
                events.emit(RunEvent::Review {
                    run_id: key.run_id.clone(),
                    verdict,
                });
            }
            Err(err) => {
                store
                    .debug(&key, None, DebugLevel::Warn, format!("review failed: {err:#}"))
                    .await;
            }
        }
    });
}

async fn write_memory(engine: &Engine, run: &ActiveRun, events: &EventSink) {
    let outputs = engine.store.list_outputs(&run.key).await.unwrap_or_default();
    let summary = outputs
        .iter()
        .rev()
        .find(|o| o.kind == OutputKind::Text)
        .map(|o| o.content.clone())
        .unwrap_or_else(|| format!("completed: {}", run.instruction));
    let summary = truncate_chars(&summary, engine.cfg.error_excerpt_chars);
    let memory = MemoryRecord {
        task_id: run.key.task_id.clone(),
        run_id: run.key.run_id.clone(),
        summary: summary.clone(),
        created_at: Utc::now(),
    };
    match engine.store.insert_memory_once(memory).await {
        Ok(true) => events.emit(RunEvent::MemoryItem {
            run_id: run.key.run_id.clone(),
            summary,
        }),
        Ok(false) => {}
        Err(err) => {
            warn!(run_id = %run.key.run_id, error = %format!("{err:#}"), "memory write failed");
        }
    }
}

/// Narrow cancellation path: never runs artifact checks or memory writes.
///
/// The run and task become stopped, and running or waiting steps go back to
/// planned so the run stays resumable. The writes run as detached work.
pub(crate) fn stop_run(engine: &Engine, run: &ActiveRun, events: &EventSink) {
    let store = engine.store.clone();
    let key = run.key.clone();
    let mut state = run.state.clone();
    let mut plan = run.plan.clone();
    for item in &mut plan.items {
        if matches!(item.status, ItemStatus::Running | ItemStatus::Waiting) {
            item.status = ItemStatus::Pending;
        }
    }
    state.envelope.paused = None;

    engine.postprocess.spawn_detached(async move {
        stop_writes(&store, key, state, plan).await;
    });
    events.emit(RunEvent::Done {
        run_id: run.key.run_id.clone(),
        status: RunStatus::Stopped,
    });
}

async fn stop_writes(store: &Store, key: RunKey, state: AgentState, plan: Plan) {
    let cp = Checkpoint::new(key.clone(), state)
        .with_plan(plan)
        .with_status(RunStatus::Stopped);
    if let Err(err) = store.persist(cp, None).await {
        warn!(run_id = %key.run_id, error = %err, "stop checkpoint failed");
    }
    if let Err(err) = store.mirror_task_status(&key.task_id, TaskStatus::Stopped).await {
        warn!(run_id = %key.run_id, error = %format!("{err:#}"), "task stop failed");
    }
    let steps = store.list_steps(&key).await.unwrap_or_default();
    for mut step in steps {
        if matches!(step.status, StepStatus::Running | StepStatus::Waiting) {
            step.status = StepStatus::Planned;
            step.updated_at = Utc::now();
            if let Err(err) = store.upsert_step(step).await {
                warn!(run_id = %key.run_id, error = %format!("{err:#}"), "step reset failed");
            }
        }
    }
    info!(run_id = %key.run_id, "run stopped");
}

/// Top-level catch: mark the run failed, guarantee output, hand off, report.
pub(crate) async fn fail_uncaught(
    engine: &Engine,
    key: &RunKey,
    err: &anyhow::Error,
    events: &EventSink,
) -> RunStatus {
    let message = format!("internal error: {err:#}");
    warn!(run_id = %key.run_id, error = %message, "run aborted");

    ensure_failure_output(engine, key, Some(&message)).await;
    match engine.store.get_run(key).await {
        Ok(Some(mut record)) => {
            record.status = RunStatus::Failed;
            record.error = Some(message.clone());
            let now = Utc::now();
            record.finished_at.get_or_insert(now);
            record.updated_at = now;
            if let Err(write) = engine.store.update_run(record).await {
                warn!(run_id = %key.run_id, error = %format!("{write:#}"), "failed status write failed");
            }
        }
        Ok(None) => {}
        Err(read) => {
            warn!(run_id = %key.run_id, error = %format!("{read:#}"), "cannot load run to fail it");
        }
    }
    engine.mirror_task(key, RunStatus::Failed).await;
    engine.postprocess.enqueue(PostprocessJob {
        key: key.clone(),
        status: RunStatus::Failed,
    });
    events.emit(RunEvent::Error {
        run_id: Some(key.run_id.clone()),
        message: sanitize_error(&message, engine.cfg.error_excerpt_chars),
    });
    RunStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::core::types::RunMode;
    use crate::io::artifacts::ArtifactChecker;
    use crate::test_support::{EngineHarness, item, plan_of};

    #[tokio::test]
    async fn waiting_items_survive_closure_and_running_items_follow_status() {
        let harness = EngineHarness::new(|agents| agents);
        let mut plan = plan_of(vec![item("a"), item("b")]);
        plan.items[0].status = ItemStatus::Running;
        plan.items[1].status = ItemStatus::Waiting;
        let mut run = harness.insert_active(RunMode::Do, plan).await;

        close_items(&mut run, RunStatus::Failed);
        assert_eq!(run.plan.items[0].status, ItemStatus::Failed);
        assert_eq!(run.plan.items[1].status, ItemStatus::Waiting);
    }

    #[tokio::test]
    async fn missing_artifact_warns_without_flipping_done() {
        let harness = EngineHarness::new(|agents| agents);
        let mut plan = plan_of(vec![item("a")]);
        plan.artifacts = vec!["report.md".to_string()];
        plan.items[0].status = ItemStatus::Done;
        let mut run = harness.insert_active(RunMode::Do, plan).await;

        let status = finalize(&harness.engine, &mut run, RunStatus::Done, None, &harness.events).await;
        assert_eq!(status, RunStatus::Done);
        let record = harness.run_record(&run.key);
        assert_eq!(record.status, RunStatus::Done);
        assert!(record.finished_at.is_some());
        assert!(record.warnings.iter().any(|w| w.contains("report.md")));
    }

    struct NothingMissing;

    impl ArtifactChecker for NothingMissing {
        fn missing(&self, _workdir: &Path, _declared: &[String]) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn artifact_checker_is_pluggable() {
        let mut harness = EngineHarness::new(|agents| agents);
        harness.engine = harness
            .engine
            .with_artifact_checker(Arc::new(NothingMissing));
        let mut plan = plan_of(vec![item("a")]);
        plan.artifacts = vec!["report.md".to_string()];
        let mut run = harness.insert_active(RunMode::Do, plan).await;

        finalize(&harness.engine, &mut run, RunStatus::Done, None, &harness.events).await;
        assert!(harness.run_record(&run.key).warnings.is_empty());
    }

    #[tokio::test]
    async fn waiting_keeps_finished_at_unset_and_memory_is_written_once() {
        let harness = EngineHarness::new(|agents| agents);
        let mut run = harness
            .insert_active(RunMode::Do, plan_of(vec![item("a")]))
            .await;
        finalize(&harness.engine, &mut run, RunStatus::Waiting, None, &harness.events).await;
        assert!(harness.run_record(&run.key).finished_at.is_none());

        finalize(&harness.engine, &mut run, RunStatus::Done, None, &harness.events).await;
        finalize(&harness.engine, &mut run, RunStatus::Done, None, &harness.events).await;
        assert_eq!(harness.repo.memory_count(), 1);
    }

    #[tokio::test]
    async fn failed_run_without_output_gets_a_summary() {
        let harness = EngineHarness::new(|agents| agents);
        let mut run = harness
            .insert_active(RunMode::Do, plan_of(vec![item("a")]))
            .await;
        finalize(
            &harness.engine,
            &mut run,
            RunStatus::Failed,
            Some("empty_plan".to_string()),
            &harness.events,
        )
        .await;
        let outputs = harness.outputs(&run.key);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::FailureSummary);
        assert!(outputs[0].content.contains("empty_plan"));
        assert_eq!(harness.run_record(&run.key).error.as_deref(), Some("empty_plan"));
    }
}
