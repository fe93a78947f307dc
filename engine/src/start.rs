//! Run entry drivers: new run, think-mode run, resume.
//!
//! Each driver is one event-emitting sequence: retrieval and planning, the
//! execution loop, reflection (think mode), then finalization. Errors that
//! escape a driver after the run exists are caught once here, mark the run
//! failed and are reported as a sanitized error event.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::PlanRequest;
use crate::agents::planning::{PlanProposal, parse_plan_proposal};
use crate::core::types::{
    DebugLevel, ModeState, RunKey, RunMode, RunStatus, TaskRecord, TaskStatus,
};
use crate::core::vote::majority_vote;
use crate::engine::{ActiveRun, Engine, new_run_record};
use crate::events::{EventSink, RunEvent};
use crate::execute::{ExecOutcome, run_parallel, run_sequential};
use crate::finalize::{fail_uncaught, finalize, stop_run};
use crate::reflection::{ReflectOutcome, reflect};
use crate::resume::{apply_resume_user_input, finalize_skip_execution_resume, preflight};

/// Fixed reason code for a planning phase that produced no steps.
pub const EMPTY_PLAN: &str = "empty_plan";

#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Existing task to attach the run to; a new task is created when absent.
    pub task_id: Option<String>,
    pub instruction: String,
    pub workdir: PathBuf,
    /// Caller-driven cancellation (client disconnect).
    pub cancel: CancellationToken,
}

impl StartRequest {
    pub fn new(instruction: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: None,
            instruction: instruction.into(),
            workdir: workdir.into(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub key: RunKey,
    /// Answer to the pending question, required when the run is waiting.
    pub answer: Option<String>,
    pub cancel: CancellationToken,
}

impl ResumeRequest {
    pub fn new(key: RunKey, answer: Option<String>) -> Self {
        Self {
            key,
            answer,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub key: RunKey,
    pub status: RunStatus,
}

impl Engine {
    /// Start a single-planner run with strictly sequential steps.
    pub async fn start_run(&self, req: StartRequest, events: &EventSink) -> Result<RunOutcome> {
        self.start_with_mode(RunMode::Do, req, events).await
    }

    /// Start a multi-planner run with a dependency-parallel prefix and reflection.
    pub async fn start_think_run(&self, req: StartRequest, events: &EventSink) -> Result<RunOutcome> {
        self.start_with_mode(RunMode::Think, req, events).await
    }

    async fn start_with_mode(
        &self,
        mode: RunMode,
        req: StartRequest,
        events: &EventSink,
    ) -> Result<RunOutcome> {
        let key = self.create_run(mode, &req, events).await?;
        let status = match self.drive_new(&key, &req.cancel, events).await {
            Ok(status) => status,
            Err(err) => fail_uncaught(self, &key, &err, events).await,
        };
        Ok(RunOutcome { key, status })
    }

    /// Continue a waiting, stopped, failed or interrupted run.
    pub async fn resume_run(&self, req: ResumeRequest, events: &EventSink) -> Result<RunOutcome> {
        let Some(record) = self.store.get_run(&req.key).await? else {
            bail!("run {} not found", req.key.run_id);
        };
        if record.status == RunStatus::Done {
            bail!("run {} is already done", req.key.run_id);
        }
        if record.state.envelope.paused.is_some() && req.answer.is_none() {
            bail!("run {} is waiting for an answer", req.key.run_id);
        }
        let run = ActiveRun::from_record(record);
        let status = match self.drive_resume(run, &req, events).await {
            Ok(status) => status,
            Err(err) => fail_uncaught(self, &req.key, &err, events).await,
        };
        Ok(RunOutcome {
            key: req.key,
            status,
        })
    }

    /// Create the task (when new) and the run together.
    async fn create_run(&self, mode: RunMode, req: &StartRequest, events: &EventSink) -> Result<RunKey> {
        let task_id = req
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = RunKey {
            task_id: task_id.clone(),
            run_id: Uuid::new_v4().to_string(),
        };

        let lookup = task_id.clone();
        let existing = self
            .store
            .call("load task", move |repo| {
                let task = repo.get_task(&lookup)?;
                let active = repo.active_run(&lookup)?;
                Ok((task, active))
            })
            .await?;
        match existing {
            (_, Some(active)) => {
                bail!("task {task_id} already has active run {}", active.run_id);
            }
            (Some(_), None) => {
                self.store
                    .mirror_task_status(&task_id, TaskStatus::Running)
                    .await?;
            }
            (None, None) => {
                let now = Utc::now();
                self.store
                    .insert_task(TaskRecord {
                        task_id: task_id.clone(),
                        title: req.instruction.chars().take(80).collect(),
                        status: TaskStatus::Running,
                        created_at: now,
                        updated_at: now,
                        finished_at: None,
                    })
                    .await?;
            }
        }
        self.store
            .insert_run(new_run_record(&key, mode, &req.instruction, req.workdir.clone()))
            .await?;

        info!(task_id = %key.task_id, run_id = %key.run_id, ?mode, "run created");
        events.emit(RunEvent::RunCreated {
            task_id: key.task_id.clone(),
            run_id: key.run_id.clone(),
            mode,
        });
        Ok(key)
    }

    async fn drive_new(
        &self,
        key: &RunKey,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<RunStatus> {
        let record = self.store.require_run(key).await?;
        let mut run = ActiveRun::from_record(record);
        if !self.plan_run(&mut run, events).await? {
            return Ok(self.fail_empty_plan(&mut run, events).await);
        }
        self.execute_and_finish(&mut run, 1, cancel, events).await
    }

    async fn drive_resume(
        &self,
        mut run: ActiveRun,
        req: &ResumeRequest,
        events: &EventSink,
    ) -> Result<RunStatus> {
        let decision = preflight(self, &run).await?;
        let mut from = decision.resume_step_order;

        if run.state.envelope.paused.is_some() {
            let answer = req.answer.as_deref().unwrap_or_default();
            from = apply_resume_user_input(self, &mut run, answer, events).await;
        } else {
            run.state.envelope.step_order = from;
            self.checkpoint(&run, Some(RunStatus::Running), true).await;
            self.mirror_task(&run.key, RunStatus::Running).await;
            run.emit_plan(events);
        }

        if run.state.envelope.pending_planning {
            if !self.plan_run(&mut run, events).await? {
                return Ok(self.fail_empty_plan(&mut run, events).await);
            }
            from = 1;
        } else if decision.skip_execution {
            return Ok(finalize_skip_execution_resume(self, &mut run, events).await);
        }
        self.execute_and_finish(&mut run, from, &req.cancel, events).await
    }

    async fn fail_empty_plan(&self, run: &mut ActiveRun, events: &EventSink) -> RunStatus {
        finalize(self, run, RunStatus::Failed, Some(EMPTY_PLAN.to_string()), events).await
    }

    /// Retrieval then planning. Returns false when planning produced no steps.
    async fn plan_run(&self, run: &mut ActiveRun, events: &EventSink) -> Result<bool> {
        let hints = match &self.agents.retriever {
            Some(retriever) => match retriever.retrieve(&run.instruction).await {
                Ok(hints) => hints,
                Err(err) => {
                    self.store
                        .debug(&run.key, None, DebugLevel::Warn, format!("retrieval failed: {err:#}"))
                        .await;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let planners = match run.mode {
            RunMode::Do => &self.agents.planners[..self.agents.planners.len().min(1)],
            RunMode::Think => &self.agents.planners[..],
        };
        if planners.is_empty() {
            bail!("no planner configured");
        }
        let req = PlanRequest {
            instruction: run.instruction.clone(),
            mode: run.mode,
            hints,
            max_steps: self.cfg.max_plan_steps,
        };
        let replies = join_all(planners.iter().map(|planner| planner.plan(&req))).await;

        let mut proposals: Vec<PlanProposal> = Vec::new();
        let mut rejected: Vec<String> = Vec::new();
        for (planner, reply) in planners.iter().zip(replies) {
            match reply.and_then(|raw| parse_plan_proposal(&raw)) {
                Ok(proposal) => proposals.push(proposal),
                Err(err) => {
                    let msg = format!("planner {} rejected: {err:#}", planner.label());
                    warn!(run_id = %run.key.run_id, "{msg}");
                    self.store
                        .debug(&run.key, None, DebugLevel::Warn, msg.clone())
                        .await;
                    rejected.push(msg);
                }
            }
        }
        let Some(vote) = majority_vote(&proposals) else {
            bail!("planning failed: {}", rejected.join("; "));
        };
        if let ModeState::Think { planner_votes, .. } = &mut run.state.mode {
            *planner_votes = vote.tally.clone();
        }

        run.plan = vote.winner.into_plan(self.cfg.max_plan_steps);
        run.state.envelope.pending_planning = false;
        run.state.envelope.step_order = 1;
        if run.plan.is_empty() {
            warn!(run_id = %run.key.run_id, "planning produced an empty plan");
            return Ok(false);
        }
        debug!(run_id = %run.key.run_id, steps = run.plan.len(), "plan accepted");
        self.checkpoint(run, Some(RunStatus::Running), false).await;
        run.emit_plan(events);
        Ok(true)
    }

    /// Execution loop (with reflection in think mode) followed by finalization.
    async fn execute_and_finish(
        &self,
        run: &mut ActiveRun,
        from: u32,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<RunStatus> {
        let outcome = match run.mode {
            RunMode::Do => run_sequential(self, run, from, events, cancel).await?,
            RunMode::Think => self.execute_with_reflection(run, events, cancel).await?,
        };

        Ok(match outcome {
            ExecOutcome::Cancelled => {
                stop_run(self, run, events);
                RunStatus::Stopped
            }
            ExecOutcome::Failed { order, error } => {
                let error = format!("step#{order} failed: {error}");
                finalize(self, run, RunStatus::Failed, Some(error), events).await
            }
            ExecOutcome::Suspended { .. } => finalize(self, run, RunStatus::Waiting, None, events).await,
            ExecOutcome::Completed => finalize(self, run, RunStatus::Done, None, events).await,
        })
    }

    async fn execute_with_reflection(
        &self,
        run: &mut ActiveRun,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        loop {
            let outcome = run_parallel(self, run, events, cancel).await?;
            let ExecOutcome::Failed { order, error } = outcome else {
                return Ok(outcome);
            };
            match reflect(self, run, order, &error, events).await? {
                ReflectOutcome::Spliced { resume_at, .. } => {
                    debug!(run_id = %run.key.run_id, resume_at, "resuming after reflection");
                }
                ReflectOutcome::GaveUp(reason) => {
                    info!(run_id = %run.key.run_id, order, reason = %reason, "reflection gave up");
                    return Ok(ExecOutcome::Failed {
                        order,
                        error: format!("{error} ({reason})"),
                    });
                }
            }
        }
    }
}
